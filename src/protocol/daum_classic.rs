//! Daum 8008 classic command set.
//!
//! Every request starts with an opcode and, except for the address probe, the
//! bike number assigned by the cockpit. The response length is fixed per
//! opcode and the first response byte echoes the opcode.

use bytes::Buf;

use super::{ascii_text, require_len};
use crate::{
    comms::ClassicRequest,
    error::{PedalError, Result},
    types::{BikeTelemetry, UserSettings},
};

/// Lowest power the cockpit accepts (W)
pub const MIN_POWER: f64 = 25.0;

/// Highest power the cockpit accepts (W)
pub const MAX_POWER: f64 = 800.0;

/// Highest gear of the cockpit's gear shifter
pub const MAX_GEAR: u8 = 28;

/// Classic opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Probe the cockpit for a bike
    CheckCockpit = 0x10,
    /// Ask the cockpit for its bus address
    GetAddress = 0x11,
    /// Reset the cockpit
    Reset = 0x12,
    /// Start the selected program
    StartProgram = 0x21,
    /// Select a training program
    SetProgram = 0x23,
    /// Upload person data
    SetPerson = 0x24,
    /// Read the current training data
    RunData = 0x40,
    /// Set the target power
    SetPower = 0x51,
    /// Select a gear
    SetGear = 0x53,
    /// Set the simulated slope
    SetSlope = 0x55,
    /// Read serial number and cockpit type
    GetVersion = 0x73,
}

impl Opcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x10 => Some(Self::CheckCockpit),
            0x11 => Some(Self::GetAddress),
            0x12 => Some(Self::Reset),
            0x21 => Some(Self::StartProgram),
            0x23 => Some(Self::SetProgram),
            0x24 => Some(Self::SetPerson),
            0x40 => Some(Self::RunData),
            0x51 => Some(Self::SetPower),
            0x53 => Some(Self::SetGear),
            0x55 => Some(Self::SetSlope),
            0x73 => Some(Self::GetVersion),
            _ => None,
        }
    }

    /// Number of bytes the cockpit answers with
    #[must_use]
    pub const fn response_len(self) -> usize {
        match self {
            Self::GetAddress | Self::Reset => 2,
            Self::CheckCockpit | Self::StartProgram | Self::SetPower | Self::SetGear => 3,
            Self::SetProgram => 4,
            Self::SetSlope => 6,
            Self::GetVersion => 11,
            Self::SetPerson => 16,
            Self::RunData => 19,
        }
    }

    fn request(self, payload: &[u8]) -> ClassicRequest {
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(self as u8);
        bytes.extend_from_slice(payload);
        ClassicRequest::new(bytes, self.response_len())
    }
}

/// Probe for a cockpit at `bike`
#[must_use]
pub fn check_cockpit(bike: u8) -> ClassicRequest {
    Opcode::CheckCockpit.request(&[bike])
}

/// Ask for the bus address
#[must_use]
pub fn get_address() -> ClassicRequest {
    Opcode::GetAddress.request(&[])
}

/// Read serial number and cockpit type
#[must_use]
pub fn get_version(bike: u8) -> ClassicRequest {
    Opcode::GetVersion.request(&[bike])
}

/// Reset the cockpit
#[must_use]
pub fn reset(bike: u8) -> ClassicRequest {
    Opcode::Reset.request(&[bike])
}

/// Start the selected program
#[must_use]
pub fn start_program(bike: u8) -> ClassicRequest {
    Opcode::StartProgram.request(&[bike])
}

/// Select a training program, 0 being the free-ride program
#[must_use]
pub fn set_program(bike: u8, program: u8) -> ClassicRequest {
    Opcode::SetProgram.request(&[bike, program])
}

/// Upload rider data
///
/// Payload after the bike number:
/// - Byte 0: person slot (always 0)
/// - Byte 1: age (years)
/// - Byte 2: height (cm)
/// - Byte 3: total weight (kg, rider plus bike)
/// - Byte 4: body fat (%; unused, 0)
/// - Byte 5: coaching level (0 = off)
/// - Byte 6: coaching frequency (0 = off)
/// - Byte 7: maximum power (W / 5)
/// - Byte 8: maximum heart rate (bpm)
/// - Bytes 9-11: reserved (0)
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn set_person(bike: u8, user: &UserSettings) -> ClassicRequest {
    let weight = user.total_mass().round().clamp(10.0, 250.0) as u8;
    let max_power = (MAX_POWER / 5.0) as u8;
    let max_heartrate = 220u8.saturating_sub(user.age);

    Opcode::SetPerson.request(&[
        bike,
        0,
        user.age,
        user.height_cm,
        weight,
        0,
        0,
        0,
        max_power,
        max_heartrate,
        0,
        0,
        0,
    ])
}

/// Set the target power, sent in 5 W steps within the cockpit range
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn set_power(bike: u8, power: f64) -> ClassicRequest {
    let steps = (power.clamp(MIN_POWER, MAX_POWER) / 5.0).round() as u8;
    Opcode::SetPower.request(&[bike, steps])
}

/// Select a gear between 1 and [`MAX_GEAR`]
#[must_use]
pub fn set_gear(bike: u8, gear: u8) -> ClassicRequest {
    Opcode::SetGear.request(&[bike, gear.clamp(1, MAX_GEAR)])
}

/// Set the simulated slope (%), sent as `f32` little-endian
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn set_slope(bike: u8, slope: f64) -> ClassicRequest {
    let mut payload = vec![bike];
    payload.extend_from_slice(&(slope as f32).to_le_bytes());
    Opcode::SetSlope.request(&payload)
}

/// Read the current training data
#[must_use]
pub fn run_data(bike: u8) -> ClassicRequest {
    Opcode::RunData.request(&[bike])
}

fn expect_opcode(data: &[u8], opcode: Opcode) -> Result<()> {
    require_len(data, opcode.response_len(), "classic response")?;
    if data[0] != opcode as u8 {
        return Err(PedalError::IllegalResponse(format!(
            "expected opcode {:02X}, got {:02X}",
            opcode as u8, data[0]
        )));
    }
    Ok(())
}

/// Bike number from a [`get_address`] response: `[0x11, bike]`
pub fn parse_address(data: &[u8]) -> Result<u8> {
    expect_opcode(data, Opcode::GetAddress)?;
    Ok(data[1])
}

/// Cockpit version byte from a [`check_cockpit`] response: `[0x10, bike, version]`
pub fn parse_cockpit(data: &[u8]) -> Result<u8> {
    expect_opcode(data, Opcode::CheckCockpit)?;
    Ok(data[2])
}

/// Cockpit model reported in the version response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CockpitType {
    /// Cardio
    Cardio,
    /// Fitness
    Fitness,
    /// Vita De Luxe
    VitaDeLuxe,
    /// 8008 cockpit
    Classic8008,
    /// 8080 cockpit
    Classic8080,
    /// Therapie
    Therapie,
    /// Unrecognised code
    Unknown(u8),
}

impl From<u8> for CockpitType {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::Cardio,
            0x20 => Self::Fitness,
            0x30 => Self::VitaDeLuxe,
            0x40 => Self::Classic8008,
            0x50 => Self::Classic8080,
            0x60 => Self::Therapie,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for CockpitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cardio => write!(f, "Cardio"),
            Self::Fitness => write!(f, "Fitness"),
            Self::VitaDeLuxe => write!(f, "Vita De Luxe"),
            Self::Classic8008 => write!(f, "8008"),
            Self::Classic8080 => write!(f, "8080"),
            Self::Therapie => write!(f, "Therapie"),
            Self::Unknown(code) => write!(f, "unknown ({code:02X})"),
        }
    }
}

/// Serial number and cockpit type from a [`get_version`] response
///
/// Layout:
/// - Byte 0: opcode `0x73`
/// - Byte 1: bike number
/// - Bytes 2-9: serial number, ASCII
/// - Byte 10: cockpit type
pub fn parse_version(data: &[u8]) -> Result<(String, CockpitType)> {
    expect_opcode(data, Opcode::GetVersion)?;
    Ok((ascii_text(&data[2..10]), CockpitType::from(data[10])))
}

/// Training data from a [`run_data`] response
///
/// Layout:
/// - Byte 0: opcode `0x40`
/// - Byte 1: bike number
/// - Byte 2: program
/// - Byte 3: person slot
/// - Byte 4: pedalling flag (non-zero while pedalling)
/// - Byte 5: power (W / 5)
/// - Byte 6: cadence (rpm)
/// - Byte 7: speed (km/h)
/// - Bytes 8-9: distance (u16 little-endian, units of 100 m)
/// - Bytes 10-11: elapsed time (u16 little-endian, s)
/// - Bytes 12-13: energy (u16 little-endian, kJ)
/// - Byte 14: heart rate (bpm, 0 without a strap)
/// - Byte 15: heart rate zone
/// - Byte 16: gear
/// - Bytes 17-18: reserved
pub fn parse_run_data(data: &[u8]) -> Result<BikeTelemetry> {
    expect_opcode(data, Opcode::RunData)?;

    let mut buf = &data[4..];
    let pedalling = buf.get_u8() != 0;
    let power = f64::from(buf.get_u8()) * 5.0;
    let cadence = f64::from(buf.get_u8());
    let speed = f64::from(buf.get_u8());
    let distance = f64::from(buf.get_u16_le()) * 100.0;
    let time = f64::from(buf.get_u16_le());
    let energy = f64::from(buf.get_u16_le());
    let heartrate = f64::from(buf.get_u8());
    buf.advance(1);
    let gear = buf.get_u8();

    Ok(BikeTelemetry {
        cadence,
        power,
        speed,
        heartrate: Some(heartrate),
        distance_counter: distance,
        gear: (gear > 0).then_some(gear),
        time,
        is_pedalling: pedalling,
        energy: Some(energy),
        ..BikeTelemetry::default()
    })
}
