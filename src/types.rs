use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::SystemTime};

use crate::error::PedalError;

/// Wire protocol spoken by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Daum 8008 classic: fixed-length binary frames
    DaumClassic,
    /// Daum 8i premium: escaped binary frames with ACK/NAK
    DaumPremium,
    /// Kettler ergometers: CRLF-delimited ASCII lines
    Kettler,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DaumClassic => write!(f, "Daum Classic"),
            Self::DaumPremium => write!(f, "Daum Premium"),
            Self::Kettler => write!(f, "Kettler"),
        }
    }
}

/// Bike category, used for the gear model and drag defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BikeType {
    /// Road bike
    #[default]
    Race,
    /// Time-trial bike
    Triathlon,
    /// Mountain bike
    Mountain,
}

impl fmt::Display for BikeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Race => write!(f, "race"),
            Self::Triathlon => write!(f, "triathlon"),
            Self::Mountain => write!(f, "mountain"),
        }
    }
}

impl FromStr for BikeType {
    type Err = PedalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "race" => Ok(Self::Race),
            "triathlon" => Ok(Self::Triathlon),
            "mountain" | "mtb" => Ok(Self::Mountain),
            other => Err(PedalError::InvalidArgument(format!(
                "Unknown bike type: {other}"
            ))),
        }
    }
}

/// Connection lifecycle of a comms channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never opened
    Idle,
    /// Open in progress
    Connecting,
    /// Open and able to carry commands
    Connected,
    /// Close in progress
    Disconnecting,
    /// Closed after having been open, or after a failed open
    Disconnected,
    /// Unrecoverable transport fault
    Error,
}

impl ConnectionState {
    /// Whether queued commands may be dispatched in this state
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Raw telemetry sample as parsed from a device response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BikeTelemetry {
    /// Pedal cadence (rpm)
    pub cadence: f64,
    /// Power (W)
    pub power: f64,
    /// Speed (km/h)
    pub speed: f64,
    /// Heart rate (bpm), when a strap is paired with the device
    pub heartrate: Option<f64>,
    /// Distance counter reported by the device (m)
    pub distance_counter: f64,
    /// Distance integrated by the cycling mode (m)
    pub distance_internal: f64,
    /// Selected gear, for devices with a gear shifter
    pub gear: Option<u8>,
    /// Elapsed time reported by the device (s)
    pub time: f64,
    /// Whether the rider is pedalling
    pub is_pedalling: bool,
    /// Slope (%), as reported by the device or set by the cycling mode
    pub slope: f64,
    /// Power target the device currently applies (W)
    pub requested_power: Option<f64>,
    /// Energy counter reported by the device (kJ)
    pub energy: Option<f64>,
}

/// Control request issued by a client
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Clear cycling mode state
    pub reset: bool,
    /// Ask the mode to recompute (or replay) its current target
    pub refresh: bool,
    /// Simulated slope (%)
    pub slope: Option<f64>,
    /// Power target (W)
    pub target_power: Option<f64>,
    /// Lower power bound (W)
    pub min_power: Option<f64>,
    /// Upper power bound (W)
    pub max_power: Option<f64>,
}

impl ControlRequest {
    /// Request that clears cycling mode state
    #[must_use]
    pub fn reset() -> Self {
        Self {
            reset: true,
            ..Self::default()
        }
    }

    /// Request that re-evaluates the current target
    #[must_use]
    pub fn refresh() -> Self {
        Self {
            refresh: true,
            ..Self::default()
        }
    }

    /// Slope-only request
    #[must_use]
    pub fn slope(slope: f64) -> Self {
        Self {
            slope: Some(slope),
            ..Self::default()
        }
    }

    /// Power-target request
    #[must_use]
    pub fn target_power(power: f64) -> Self {
        Self {
            target_power: Some(power),
            ..Self::default()
        }
    }

    /// Whether the request carries no intent at all
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.reset
            && !self.refresh
            && self.slope.is_none()
            && self.target_power.is_none()
            && self.min_power.is_none()
            && self.max_power.is_none()
    }
}

/// Command a cycling mode wants transmitted to the hardware
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Power the device should apply (W)
    pub target_power: Option<f64>,
    /// Slope the device should simulate (%)
    pub slope: Option<f64>,
}

impl DeviceCommand {
    /// Command carrying a power target
    #[must_use]
    pub const fn power(power: f64) -> Self {
        Self {
            target_power: Some(power),
            slope: None,
        }
    }

    /// Command carrying a slope
    #[must_use]
    pub const fn slope(slope: f64) -> Self {
        Self {
            target_power: None,
            slope: Some(slope),
        }
    }

    /// A command with nothing to send produces no wire traffic
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.target_power.is_none() && self.slope.is_none()
    }

    /// Whether sending `self` after `previous` changes anything on the device
    ///
    /// Power is compared at 1 W resolution and slope at 0.1 %, the finest
    /// steps any supported device accepts.
    #[must_use]
    pub fn differs_from(&self, previous: Option<&Self>) -> bool {
        let Some(previous) = previous else {
            return !self.is_empty();
        };

        let power_changed = match (self.target_power, previous.target_power) {
            (Some(a), Some(b)) => a.round() != b.round(),
            (None, None) => false,
            _ => true,
        };
        let slope_changed = match (self.slope, previous.slope) {
            (Some(a), Some(b)) => (a * 10.0).round() != (b * 10.0).round(),
            (None, None) => false,
            _ => true,
        };

        power_changed || slope_changed
    }
}

/// Data suppression applied at the output-shaping step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IgnoreFlags {
    /// Drop heart rate
    pub ignore_hrm: bool,
    /// Drop bike data (speed, cadence, power, distance, slope) and stop control traffic
    pub ignore_bike: bool,
    /// Drop power and cadence
    pub ignore_power: bool,
}

/// Telemetry as delivered to clients, rounded once at the adapter boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOutput {
    /// Speed (km/h, 0.1 resolution)
    pub speed: Option<f64>,
    /// Power (W)
    pub power: Option<u16>,
    /// Cadence (rpm)
    pub cadence: Option<u16>,
    /// Heart rate (bpm)
    pub heartrate: Option<u8>,
    /// Distance since start (m)
    pub distance: Option<f64>,
    /// Slope (%)
    pub slope: Option<f64>,
    /// When the underlying sample was taken
    pub timestamp: SystemTime,
}

impl NormalizedOutput {
    /// Round the enriched telemetry and strip ignored fields
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_telemetry(data: &BikeTelemetry, ignore: IgnoreFlags) -> Self {
        let mut output = Self {
            speed: Some((data.speed * 10.0).round() / 10.0),
            power: Some(data.power.max(0.0).round() as u16),
            cadence: Some(data.cadence.max(0.0).round() as u16),
            heartrate: data
                .heartrate
                .filter(|hr| *hr > 0.0)
                .map(|hr| hr.round().min(255.0) as u8),
            distance: Some(data.distance_internal),
            slope: Some(data.slope),
            timestamp: SystemTime::now(),
        };

        if ignore.ignore_hrm {
            output.heartrate = None;
        }
        if ignore.ignore_power {
            output.power = None;
            output.cadence = None;
        }
        if ignore.ignore_bike {
            output.speed = None;
            output.power = None;
            output.cadence = None;
            output.distance = None;
            output.slope = None;
        }

        output
    }
}

/// Device identity discovered by `check()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Display name
    pub name: String,
    /// Wire protocol
    pub protocol: Protocol,
    /// Transport path (serial port or host:port)
    pub path: String,
    /// Bus address for Daum classic bikes
    pub bike_number: Option<u8>,
    /// Serial number
    pub serial_number: Option<String>,
    /// Firmware or protocol version
    pub firmware_version: Option<String>,
    /// Model or cockpit type
    pub device_type: Option<String>,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, protocol: Protocol, path: String) -> Self {
        Self {
            name,
            protocol,
            path,
            bike_number: None,
            serial_number: None,
            firmware_version: None,
            device_type: None,
        }
    }
}

/// Rider data used for physics and device person setup
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Rider weight (kg)
    pub weight_kg: f64,
    /// Bike weight (kg)
    pub bike_weight_kg: f64,
    /// Rider height (cm)
    pub height_cm: u8,
    /// Rider age (years)
    pub age: u8,
}

impl UserSettings {
    /// Total mass moved by the rider (kg)
    #[must_use]
    pub fn total_mass(&self) -> f64 {
        self.weight_kg + self.bike_weight_kg
    }
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            weight_kg: 80.0,
            bike_weight_kg: 10.0,
            height_cm: 180,
            age: 30,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Transport open timeout in milliseconds
    pub open_timeout_ms: u64,
    /// Transport close timeout in milliseconds
    pub close_timeout_ms: u64,
    /// Overall identification timeout in milliseconds
    pub check_timeout_ms: u64,
    /// Attempts made by `start()` before giving up
    pub retry_attempts: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl ConnectionParams {
    /// Defaults tuned per protocol
    #[must_use]
    pub fn for_protocol(protocol: Protocol) -> Self {
        let open_timeout_ms = match protocol {
            Protocol::DaumClassic => 1_500,
            Protocol::DaumPremium => 5_000,
            Protocol::Kettler => 15_000,
        };

        Self {
            open_timeout_ms,
            ..Self::default()
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            open_timeout_ms: 5_000,
            close_timeout_ms: 2_000,
            check_timeout_ms: 10_000,
            retry_attempts: 5,
            retry_delay_ms: 1_000,
        }
    }
}

/// Per-channel command timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time allowed for a complete response in milliseconds
    pub response_timeout_ms: u64,
    /// Time allowed for the ACK/NAK byte in milliseconds
    pub ack_timeout_ms: u64,
    /// Interval of the dispatch tick in milliseconds
    pub dispatch_interval_ms: u64,
    /// Retransmissions after a NAK or a corrupt frame
    pub max_nak_retries: u32,
}

impl TimeoutConfig {
    /// Timing for Daum classic bikes
    #[must_use]
    pub const fn classic() -> Self {
        Self {
            response_timeout_ms: 1_000,
            ack_timeout_ms: 1_000,
            dispatch_interval_ms: 50,
            max_nak_retries: 0,
        }
    }

    /// Timing for Daum premium bikes
    #[must_use]
    pub const fn premium() -> Self {
        Self {
            response_timeout_ms: 2_000,
            ack_timeout_ms: 1_000,
            dispatch_interval_ms: 50,
            max_nak_retries: 3,
        }
    }

    /// Timing for Kettler ergometers
    #[must_use]
    pub const fn kettler() -> Self {
        Self {
            response_timeout_ms: 3_000,
            ack_timeout_ms: 3_000,
            dispatch_interval_ms: 50,
            max_nak_retries: 0,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::classic()
    }
}

/// Update scheduler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval of the telemetry pull loop in milliseconds
    pub sync_interval_ms: u64,
    /// Interval of the data delivery loop in milliseconds
    pub emit_interval_ms: u64,
    /// Upper bound for `stop()` in milliseconds
    pub stop_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 1_000,
            emit_interval_ms: 1_000,
            stop_timeout_ms: 5_000,
        }
    }
}
