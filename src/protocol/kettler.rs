//! Kettler ergometer command set.
//!
//! Commands are two ASCII letters with optional decimal parameters. Setters
//! and `ST` answer with the tab-separated status line.

use crate::{
    error::{PedalError, Result},
    types::BikeTelemetry,
};

/// Lowest power the ergometer accepts (W)
pub const MIN_POWER: f64 = 25.0;

/// Highest power the ergometer accepts (W)
pub const MAX_POWER: f64 = 400.0;

/// Power resolution of the ergometer (W)
pub const POWER_STEP: f64 = 5.0;

/// Number of fields in a status line
pub const STATUS_FIELDS: usize = 8;

/// Kettler commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Enter PC command mode
    CommandMode,
    /// Reset the console
    Reset,
    /// Read the device identifier
    Identify,
    /// Read the firmware version
    Version,
    /// Read the status line
    Status,
    /// Set the target power
    SetPower,
}

impl Command {
    /// Two-letter mnemonic
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::CommandMode => "CM",
            Self::Reset => "RS",
            Self::Identify => "ID",
            Self::Version => "VE",
            Self::Status => "ST",
            Self::SetPower => "PW",
        }
    }
}

/// Enter PC command mode
#[must_use]
pub fn command_mode() -> String {
    Command::CommandMode.mnemonic().to_string()
}

/// Reset the console
#[must_use]
pub fn reset() -> String {
    Command::Reset.mnemonic().to_string()
}

/// Read the device identifier
#[must_use]
pub fn identify() -> String {
    Command::Identify.mnemonic().to_string()
}

/// Read the firmware version
#[must_use]
pub fn version() -> String {
    Command::Version.mnemonic().to_string()
}

/// Read the status line
#[must_use]
pub fn status() -> String {
    Command::Status.mnemonic().to_string()
}

/// Set the target power, rounded to 5 W within the ergometer range
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn set_power(power: f64) -> String {
    let power = ((power.clamp(MIN_POWER, MAX_POWER) / POWER_STEP).round() * POWER_STEP) as u16;
    format!("{}{power}", Command::SetPower.mnemonic())
}

/// Whether a `CM`/`RS` answer confirms the command
#[must_use]
pub fn is_acknowledged(line: &str) -> bool {
    matches!(line.trim(), "ACK" | "RUN")
}

fn field(value: &str, name: &str) -> Result<f64> {
    value
        .trim()
        .parse::<u32>()
        .map(f64::from)
        .map_err(|e| PedalError::ParseError(format!("invalid {name} {value:?}: {e}")))
}

fn elapsed(value: &str) -> Result<f64> {
    let (minutes, seconds) = value
        .trim()
        .split_once(':')
        .ok_or_else(|| PedalError::ParseError(format!("invalid time {value:?}")))?;
    Ok(field(minutes, "minutes")? * 60.0 + field(seconds, "seconds")?)
}

/// Parse a status line
///
/// Fields, tab-separated:
/// - 0: heart rate (bpm)
/// - 1: cadence (rpm)
/// - 2: speed (km/h × 10)
/// - 3: distance (units of 100 m)
/// - 4: requested power (W)
/// - 5: energy (kJ)
/// - 6: elapsed time, `mm:ss`
/// - 7: current power (W)
pub fn parse_status(line: &str) -> Result<BikeTelemetry> {
    let fields: Vec<&str> = line.trim().split('\t').collect();
    if fields.len() != STATUS_FIELDS {
        return Err(PedalError::ParseError(format!(
            "status line has {} fields, expected {STATUS_FIELDS}: {line:?}",
            fields.len()
        )));
    }

    let cadence = field(fields[1], "cadence")?;
    Ok(BikeTelemetry {
        heartrate: Some(field(fields[0], "heart rate")?),
        cadence,
        speed: field(fields[2], "speed")? / 10.0,
        distance_counter: field(fields[3], "distance")? * 100.0,
        requested_power: Some(field(fields[4], "requested power")?),
        energy: Some(field(fields[5], "energy")?),
        time: elapsed(fields[6])?,
        power: field(fields[7], "power")?,
        is_pedalling: cadence > 0.0,
        ..BikeTelemetry::default()
    })
}
