use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::BikeDriver;
use crate::{
    comms::{CommsChannel, PremiumCodec},
    error::Result,
    modes::ModeKind,
    protocol::daum_premium::{self as cmd, Command},
    transport::{PortRegistry, Transport},
    types::{
        BikeTelemetry, ConnectionParams, ConnectionState, DeviceCommand, DeviceInfo, Protocol,
        TimeoutConfig, UserSettings,
    },
};

const MODES: &[ModeKind] = &[
    ModeKind::SmartTrainer,
    ModeKind::Erg,
    ModeKind::PowerMeter,
    ModeKind::Classic,
];

/// Driver for Daum 8i premium cockpits
pub struct DaumPremiumDriver {
    channel: CommsChannel<PremiumCodec>,
}

impl DaumPremiumDriver {
    /// Create a driver with the premium connection defaults
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, registry: PortRegistry) -> Self {
        Self::with_params(
            transport,
            registry,
            ConnectionParams::for_protocol(Protocol::DaumPremium),
        )
    }

    /// Create a driver with custom connection parameters
    #[must_use]
    pub fn with_params(
        transport: Arc<dyn Transport>,
        registry: PortRegistry,
        params: ConnectionParams,
    ) -> Self {
        Self {
            channel: CommsChannel::new(transport, registry, params, TimeoutConfig::premium()),
        }
    }
}

#[async_trait]
impl BikeDriver for DaumPremiumDriver {
    fn protocol(&self) -> Protocol {
        Protocol::DaumPremium
    }

    fn path(&self) -> &str {
        self.channel.path()
    }

    fn supported_modes(&self) -> &'static [ModeKind] {
        MODES
    }

    fn default_mode(&self) -> ModeKind {
        ModeKind::SmartTrainer
    }

    fn power_range(&self) -> (f64, f64) {
        (cmd::MIN_POWER, cmd::MAX_POWER)
    }

    fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe()
    }

    fn set_blocked(&self, blocked: bool) {
        self.channel.set_blocked(blocked);
    }

    async fn connect(&self) -> Result<()> {
        self.channel.open().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.channel.close().await
    }

    async fn identify(&self) -> Result<DeviceInfo> {
        let protocol = cmd::parse_version(&self.channel.send(cmd::protocol_version()).await?)?;
        let dashboard = cmd::parse_version(&self.channel.send(cmd::dashboard_version()).await?)?;
        let kind = cmd::parse_device_type(&self.channel.send(cmd::device_type()).await?)?;
        info!(
            "{}: Daum premium {} (protocol {}, dashboard {})",
            self.path(),
            kind,
            protocol,
            dashboard
        );

        let mut device = DeviceInfo::new(
            "Daum 8i".to_string(),
            Protocol::DaumPremium,
            self.path().to_string(),
        );
        device.firmware_version = Some(dashboard);
        device.device_type = Some(kind.to_string());
        Ok(device)
    }

    async fn initialize(&self, user: &UserSettings, command: &DeviceCommand) -> Result<()> {
        let frame = self.channel.send(cmd::set_person(user)).await?;
        cmd::parse_ack(&frame, Command::SetPerson)?;
        self.apply(command).await
    }

    async fn read_telemetry(&self) -> Result<BikeTelemetry> {
        let frame = self.channel.send(cmd::training_data()).await?;
        cmd::parse_training_data(&frame)
    }

    async fn apply(&self, command: &DeviceCommand) -> Result<()> {
        if let Some(power) = command.target_power {
            debug!("{}: power {:.0} W", self.path(), power);
            let frame = self.channel.send(cmd::set_power(power)).await?;
            cmd::parse_ack(&frame, Command::SetPower)?;
        }
        if let Some(slope) = command.slope {
            debug!("{}: slope {:.1} %", self.path(), slope);
            let frame = self.channel.send(cmd::set_slope(slope)).await?;
            cmd::parse_ack(&frame, Command::SetSlope)?;
        }
        Ok(())
    }

    async fn set_gear(&self, gear: u8) -> Result<()> {
        let frame = self.channel.send(cmd::set_gear(gear)).await?;
        cmd::parse_ack(&frame, Command::SetGear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comms::premium::{build_frame, ACK},
        transport::testing::ScriptedTransport,
    };
    use tokio_test::assert_ok;

    #[tokio::test(start_paused = true)]
    async fn test_identify() {
        let (transport, mut peer) = ScriptedTransport::new("192.168.1.30:51955");
        let driver = Arc::new(DaumPremiumDriver::new(transport, PortRegistry::new()));
        assert_ok!(driver.connect().await);

        let task = tokio::spawn({
            let driver = driver.clone();
            async move { driver.identify().await }
        });

        let exchanges = [
            (*b"V00", &b"201"[..]),
            (*b"V70", &b"3.004"[..]),
            (*b"Y00", &b"2"[..]),
        ];
        for (command, payload) in exchanges {
            assert_eq!(peer.next_write().await, build_frame(command, &[]).freeze());
            peer.reply(&[ACK]).await;
            peer.reply(&build_frame(command, payload)).await;
            assert_eq!(&peer.next_write().await[..], &[ACK]);
        }

        let device = task.await.unwrap().unwrap();
        assert_eq!(device.firmware_version.as_deref(), Some("3.004"));
        assert_eq!(device.device_type.as_deref(), Some("bike"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_gear_is_acknowledged() {
        let (transport, mut peer) = ScriptedTransport::new("premium-gear");
        let driver = Arc::new(DaumPremiumDriver::new(transport, PortRegistry::new()));
        assert_ok!(driver.connect().await);

        let task = tokio::spawn({
            let driver = driver.clone();
            async move { driver.set_gear(7).await }
        });

        assert_eq!(peer.next_write().await, build_frame(*b"M71", &[7]).freeze());
        peer.reply(&[ACK]).await;
        peer.reply(&build_frame(*b"M71", &[7])).await;
        assert_ok!(task.await.unwrap());
    }
}
