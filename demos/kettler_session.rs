use std::{env, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use pedalers::{
    adapter::{DeviceAdapter, KettlerDriver, StartProps},
    transport::{PortRegistry, TcpTransport},
    ControlRequest, ModeKind, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Serial-to-TCP bridge in front of the ergometer
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.1.20:51955".to_string());

    info!("🚴 Pedalers Kettler Session Example");
    info!("Connecting to {}...", path);

    let transport = Arc::new(TcpTransport::from_path(&path)?);
    let driver = Arc::new(KettlerDriver::new(transport, PortRegistry::new()));
    let adapter = DeviceAdapter::new(driver);

    match adapter.check().await {
        Ok(device) => info!("✅ Found: {} ({:?})", device.name, device.firmware_version),
        Err(e) => {
            error!("❌ No ergometer answered: {}", e);
            return Err(e);
        }
    }

    adapter
        .on_data(|data| {
            info!(
                "📊 {:>4} W  {:>3} rpm  {:>5.1} km/h  {:>7.0} m",
                data.power.unwrap_or_default(),
                data.cadence.unwrap_or_default(),
                data.speed.unwrap_or_default(),
                data.distance.unwrap_or_default()
            );
        })
        .await;

    let props = StartProps {
        mode: Some(ModeKind::Erg),
        ..StartProps::default()
    };
    let first = adapter.start(props).await?;
    info!("▶️  Started, device reports {:.0} W", first.power);

    info!("⚡ Holding 150 W for one minute...");
    adapter
        .send_update(&ControlRequest::target_power(150.0))
        .await;
    sleep(Duration::from_secs(60)).await;

    let status = adapter.status().await;
    info!("📈 Final state: {} in {} mode", status.state, status.mode);

    info!("🛑 Stopping...");
    if let Err(e) = adapter.stop().await {
        error!("❌ Failed to close the connection: {}", e);
        return Err(e);
    }
    info!("✅ Session finished");

    Ok(())
}
