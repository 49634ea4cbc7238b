use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tokio::sync::watch;
use tracing::{debug, info};

use super::BikeDriver;
use crate::{
    comms::{ClassicCodec, CommsChannel},
    error::Result,
    modes::ModeKind,
    protocol::daum_classic as cmd,
    transport::{PortRegistry, Transport},
    types::{
        BikeTelemetry, ConnectionParams, ConnectionState, DeviceCommand, DeviceInfo, Protocol,
        TimeoutConfig, UserSettings,
    },
};

const MODES: &[ModeKind] = &[
    ModeKind::Classic,
    ModeKind::Erg,
    ModeKind::SmartTrainer,
    ModeKind::PowerMeter,
];

/// Driver for Daum 8008 classic cockpits
pub struct DaumClassicDriver {
    channel: CommsChannel<ClassicCodec>,
    bike: AtomicU8,
}

impl DaumClassicDriver {
    /// Create a driver with the classic connection defaults
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, registry: PortRegistry) -> Self {
        Self::with_params(
            transport,
            registry,
            ConnectionParams::for_protocol(Protocol::DaumClassic),
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
            channel: CommsChannel::new(transport, registry, params, TimeoutConfig::classic()),
            bike: AtomicU8::new(0),
        }
    }

    /// Bus address reported by the cockpit
    #[must_use]
    pub fn bike_number(&self) -> u8 {
        self.bike.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BikeDriver for DaumClassicDriver {
    fn protocol(&self) -> Protocol {
        Protocol::DaumClassic
    }

    fn path(&self) -> &str {
        self.channel.path()
    }

    fn supported_modes(&self) -> &'static [ModeKind] {
        MODES
    }

    fn default_mode(&self) -> ModeKind {
        ModeKind::Classic
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
        let bike = cmd::parse_address(&self.channel.send(cmd::get_address()).await?)?;
        self.bike.store(bike, Ordering::SeqCst);

        let cockpit = cmd::parse_cockpit(&self.channel.send(cmd::check_cockpit(bike)).await?)?;
        let (serial, kind) = cmd::parse_version(&self.channel.send(cmd::get_version(bike)).await?)?;
        info!("{}: Daum {} cockpit, bike {}, serial {}", self.path(), kind, bike, serial);

        let mut device = DeviceInfo::new(
            format!("Daum {kind}"),
            Protocol::DaumClassic,
            self.path().to_string(),
        );
        device.bike_number = Some(bike);
        device.serial_number = Some(serial);
        device.firmware_version = Some(format!("{cockpit:02X}"));
        device.device_type = Some(kind.to_string());
        Ok(device)
    }

    async fn initialize(&self, user: &UserSettings, command: &DeviceCommand) -> Result<()> {
        let bike = self.bike_number();
        self.channel.send(cmd::set_person(bike, user)).await?;
        self.channel.send(cmd::set_program(bike, 0)).await?;
        self.channel.send(cmd::start_program(bike)).await?;
        self.apply(command).await
    }

    async fn read_telemetry(&self) -> Result<BikeTelemetry> {
        let response = self.channel.send(cmd::run_data(self.bike_number())).await?;
        cmd::parse_run_data(&response)
    }

    async fn apply(&self, command: &DeviceCommand) -> Result<()> {
        let bike = self.bike_number();
        if let Some(power) = command.target_power {
            debug!("{}: power {:.0} W", self.path(), power);
            self.channel.send(cmd::set_power(bike, power)).await?;
        }
        if let Some(slope) = command.slope {
            debug!("{}: slope {:.1} %", self.path(), slope);
            self.channel.send(cmd::set_slope(bike, slope)).await?;
        }
        Ok(())
    }

    async fn set_gear(&self, gear: u8) -> Result<()> {
        self.channel
            .send(cmd::set_gear(self.bike_number(), gear))
            .await
            .map(drop)
    }
}
