//! Daum 8i premium command set.
//!
//! Commands are three ASCII characters; numeric payloads are little-endian.

use bytes::{Buf, BufMut};

use super::{ascii_text, require_len};
use crate::{
    comms::{PremiumFrame, PremiumRequest},
    error::{PedalError, Result},
    types::{BikeTelemetry, UserSettings},
};

/// Lowest power the cockpit accepts (W)
pub const MIN_POWER: f64 = 25.0;

/// Highest power the cockpit accepts (W)
pub const MAX_POWER: f64 = 800.0;

/// Highest selectable gear
pub const MAX_GEAR: u8 = 28;

/// Length of the training data payload
pub const TRAINING_DATA_LEN: usize = 36;

/// Premium commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Protocol version
    ProtocolVersion,
    /// Dashboard firmware version
    DashboardVersion,
    /// Device type (bike or treadmill)
    DeviceType,
    /// Current training data
    TrainingData,
    /// Set the target power
    SetPower,
    /// Set the simulated slope
    SetSlope,
    /// Select a gear
    SetGear,
    /// Upload person data
    SetPerson,
}

impl Command {
    /// Wire code of the command
    #[must_use]
    pub const fn code(self) -> [u8; 3] {
        match self {
            Self::ProtocolVersion => *b"V00",
            Self::DashboardVersion => *b"V70",
            Self::DeviceType => *b"Y00",
            Self::TrainingData => *b"X70",
            Self::SetPower => *b"S23",
            Self::SetSlope => *b"S22",
            Self::SetGear => *b"M71",
            Self::SetPerson => *b"M70",
        }
    }

    /// Convert from a wire code
    #[must_use]
    pub fn from_code(code: [u8; 3]) -> Option<Self> {
        match &code {
            b"V00" => Some(Self::ProtocolVersion),
            b"V70" => Some(Self::DashboardVersion),
            b"Y00" => Some(Self::DeviceType),
            b"X70" => Some(Self::TrainingData),
            b"S23" => Some(Self::SetPower),
            b"S22" => Some(Self::SetSlope),
            b"M71" => Some(Self::SetGear),
            b"M70" => Some(Self::SetPerson),
            _ => None,
        }
    }

    fn request(self, payload: Vec<u8>) -> PremiumRequest {
        PremiumRequest::new(self.code(), payload)
    }
}

/// Read the protocol version
#[must_use]
pub fn protocol_version() -> PremiumRequest {
    Command::ProtocolVersion.request(Vec::new())
}

/// Read the dashboard firmware version
#[must_use]
pub fn dashboard_version() -> PremiumRequest {
    Command::DashboardVersion.request(Vec::new())
}

/// Read the device type
#[must_use]
pub fn device_type() -> PremiumRequest {
    Command::DeviceType.request(Vec::new())
}

/// Read the training data of the active slot
#[must_use]
pub fn training_data() -> PremiumRequest {
    Command::TrainingData.request(vec![0x00])
}

/// Set the target power (W), `u16` little-endian
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn set_power(power: f64) -> PremiumRequest {
    let power = power.clamp(MIN_POWER, MAX_POWER).round() as u16;
    Command::SetPower.request(power.to_le_bytes().to_vec())
}

/// Set the simulated slope (%), `f32` little-endian
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn set_slope(slope: f64) -> PremiumRequest {
    Command::SetSlope.request((slope as f32).to_le_bytes().to_vec())
}

/// Select a gear between 1 and [`MAX_GEAR`]
#[must_use]
pub fn set_gear(gear: u8) -> PremiumRequest {
    Command::SetGear.request(vec![gear.clamp(1, MAX_GEAR)])
}

/// Upload rider data
///
/// Payload:
/// - Byte 0: person slot (always 0)
/// - Byte 1: age (years)
/// - Byte 2: height (cm)
/// - Bytes 3-6: rider weight (f32 little-endian, kg)
/// - Bytes 7-10: bike weight (f32 little-endian, kg)
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn set_person(user: &UserSettings) -> PremiumRequest {
    let mut payload = Vec::with_capacity(11);
    payload.put_u8(0);
    payload.put_u8(user.age);
    payload.put_u8(user.height_cm);
    payload.put_f32_le(user.weight_kg as f32);
    payload.put_f32_le(user.bike_weight_kg as f32);
    Command::SetPerson.request(payload)
}

fn expect_command(frame: &PremiumFrame, command: Command) -> Result<()> {
    if frame.command != command.code() {
        return Err(PedalError::IllegalResponse(format!(
            "expected {}, got {}",
            String::from_utf8_lossy(&command.code()),
            String::from_utf8_lossy(&frame.command)
        )));
    }
    Ok(())
}

/// Version text from a [`protocol_version`] or [`dashboard_version`] response
pub fn parse_version(frame: &PremiumFrame) -> Result<String> {
    if frame.command != Command::ProtocolVersion.code() {
        expect_command(frame, Command::DashboardVersion)?;
    }
    Ok(ascii_text(&frame.payload))
}

/// Device category reported by [`device_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Treadmill
    Run,
    /// Ergometer
    Bike,
    /// Unrecognised code
    Unknown(u8),
}

impl From<u8> for DeviceKind {
    fn from(value: u8) -> Self {
        match value {
            b'0' => Self::Run,
            b'2' => Self::Bike,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Bike => write!(f, "bike"),
            Self::Unknown(code) => write!(f, "unknown ({code:02X})"),
        }
    }
}

/// Device category from a [`device_type`] response; first payload byte
pub fn parse_device_type(frame: &PremiumFrame) -> Result<DeviceKind> {
    expect_command(frame, Command::DeviceType)?;
    require_len(&frame.payload, 1, "device type")?;
    Ok(DeviceKind::from(frame.payload[0]))
}

/// Training data from a [`training_data`] response
///
/// Payload layout, little-endian:
/// - Bytes 0-3: elapsed time (u32, s)
/// - Byte 4: heart rate (bpm)
/// - Bytes 5-8: speed (f32, m/s)
/// - Bytes 9-12: slope (f32, %)
/// - Bytes 13-16: distance (u32, m)
/// - Bytes 17-20: cadence (f32, rpm)
/// - Bytes 21-22: power (u16, W)
/// - Bytes 23-26: energy (f32, kJ)
/// - Bytes 27-30: torque (f32, Nm)
/// - Byte 31: gear
/// - Byte 32: pedalling flag
/// - Bytes 33-34: target power (u16, W)
/// - Byte 35: reserved
pub fn parse_training_data(frame: &PremiumFrame) -> Result<BikeTelemetry> {
    expect_command(frame, Command::TrainingData)?;
    require_len(&frame.payload, TRAINING_DATA_LEN, "training data")?;

    let mut buf = &frame.payload[..];
    let time = f64::from(buf.get_u32_le());
    let heartrate = f64::from(buf.get_u8());
    let speed = f64::from(buf.get_f32_le()) * 3.6;
    let slope = f64::from(buf.get_f32_le());
    let distance = f64::from(buf.get_u32_le());
    let cadence = f64::from(buf.get_f32_le());
    let power = f64::from(buf.get_u16_le());
    let energy = f64::from(buf.get_f32_le());
    let _torque = buf.get_f32_le();
    let gear = buf.get_u8();
    let pedalling = buf.get_u8() != 0;
    let requested_power = buf.get_u16_le();

    Ok(BikeTelemetry {
        cadence,
        power,
        speed,
        heartrate: Some(heartrate),
        distance_counter: distance,
        gear: (gear > 0).then_some(gear),
        time,
        is_pedalling: pedalling || cadence > 0.0,
        slope,
        requested_power: (requested_power > 0).then(|| f64::from(requested_power)),
        energy: Some(energy),
        ..BikeTelemetry::default()
    })
}

/// Check that a setter was echoed by the cockpit
pub fn parse_ack(frame: &PremiumFrame, command: Command) -> Result<()> {
    expect_command(frame, command)
}
