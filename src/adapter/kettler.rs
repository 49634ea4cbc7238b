use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info};

use super::BikeDriver;
use crate::{
    comms::{CommsChannel, KettlerCodec},
    error::{PedalError, Result},
    modes::ModeKind,
    protocol::kettler as cmd,
    transport::{PortRegistry, Transport},
    types::{
        BikeTelemetry, ConnectionParams, ConnectionState, DeviceCommand, DeviceInfo, Protocol,
        TimeoutConfig, UserSettings,
    },
};

const MODES: &[ModeKind] = &[ModeKind::Erg, ModeKind::SmartTrainer, ModeKind::PowerMeter];

/// Pause after `RS` before the console accepts commands again
const RESET_SETTLE: Duration = Duration::from_millis(500);

/// Driver for Kettler ergometers
pub struct KettlerDriver {
    channel: CommsChannel<KettlerCodec>,
}

impl KettlerDriver {
    /// Create a driver with the Kettler connection defaults
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, registry: PortRegistry) -> Self {
        Self::with_params(
            transport,
            registry,
            ConnectionParams::for_protocol(Protocol::Kettler),
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
            channel: CommsChannel::new(transport, registry, params, TimeoutConfig::kettler()),
        }
    }

    async fn expect_ack(&self, command: String) -> Result<()> {
        let answer = self.channel.send(command.clone()).await?;
        if cmd::is_acknowledged(&answer) {
            Ok(())
        } else {
            Err(PedalError::IllegalResponse(format!(
                "{command} answered {answer:?}"
            )))
        }
    }
}

#[async_trait]
impl BikeDriver for KettlerDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Kettler
    }

    fn path(&self) -> &str {
        self.channel.path()
    }

    fn supported_modes(&self) -> &'static [ModeKind] {
        MODES
    }

    fn default_mode(&self) -> ModeKind {
        ModeKind::Erg
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
        self.expect_ack(cmd::command_mode()).await?;
        let id = self.channel.send(cmd::identify()).await?;
        let version = self.channel.send(cmd::version()).await?;
        info!("{}: Kettler {} (version {})", self.path(), id, version);

        let mut device = DeviceInfo::new(
            format!("Kettler {id}"),
            Protocol::Kettler,
            self.path().to_string(),
        );
        device.serial_number = Some(id);
        device.firmware_version = Some(version);
        Ok(device)
    }

    async fn initialize(&self, _user: &UserSettings, command: &DeviceCommand) -> Result<()> {
        self.expect_ack(cmd::reset()).await?;
        tokio::time::sleep(RESET_SETTLE).await;
        self.expect_ack(cmd::command_mode()).await?;
        self.apply(command).await
    }

    async fn read_telemetry(&self) -> Result<BikeTelemetry> {
        let line = self.channel.send(cmd::status()).await?;
        cmd::parse_status(&line)
    }

    async fn apply(&self, command: &DeviceCommand) -> Result<()> {
        if let Some(slope) = command.slope {
            debug!("{}: no slope control, dropping {:.1} %", self.path(), slope);
        }
        if let Some(power) = command.target_power {
            debug!("{}: power {:.0} W", self.path(), power);
            let line = self.channel.send(cmd::set_power(power)).await?;
            cmd::parse_status(&line)?;
        }
        Ok(())
    }
}
