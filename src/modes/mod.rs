//! Cycling modes turn raw device telemetry into a consistent simulated ride
//! and turn client requests into device commands.
//!
//! Every mode implements [`CyclingMode`]. The fallible calculations
//! (`calculate_update_data`, `calculate_bike_update`) are wrapped by the
//! provided `update_data`/`send_bike_update`, which log failures and fall
//! back to a best-effort result so a bad sample never stops the polling loop.

mod classic;
mod erg;
mod power_meter;
mod ramp;
mod smart_trainer;

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};
use tokio::time::Instant;
use tracing::warn;

use crate::{
    error::{PedalError, Result},
    physics::PhysicsParams,
    types::{BikeTelemetry, BikeType, ControlRequest, DeviceCommand, UserSettings},
};

pub use classic::ClassicCyclingMode;
pub use erg::ErgCyclingMode;
pub use power_meter::PowerMeterCyclingMode;
pub use ramp::{
    GearDirection, ModeEvent, PowerLimits, PowerRamp, RampStep, RAMP_THRESHOLD_W, SEC_DELAY,
};
pub use smart_trainer::SmartTrainerCyclingMode;

/// Available cycling modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModeKind {
    /// Constant (or gear-derived) power, slope ignored
    Erg,
    /// Slope simulation with ramped power changes
    SmartTrainer,
    /// Trust device power, derive speed
    PowerMeter,
    /// Device computes its own physics, slope relayed
    Classic,
}

impl ModeKind {
    /// Display name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Erg => "ERG",
            Self::SmartTrainer => "SmartTrainer",
            Self::PowerMeter => "PowerMeter",
            Self::Classic => "Daum Classic",
        }
    }

    /// Build a fresh mode instance
    #[must_use]
    pub fn create(self, context: ModeContext) -> Box<dyn CyclingMode> {
        match self {
            Self::Erg => Box::new(ErgCyclingMode::new(context)),
            Self::SmartTrainer => Box::new(SmartTrainerCyclingMode::new(context)),
            Self::PowerMeter => Box::new(PowerMeterCyclingMode::new(context)),
            Self::Classic => Box::new(ClassicCyclingMode::new(context)),
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a mode needs to know about rider and device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeContext {
    /// Rider and bike weight
    pub user: UserSettings,
    /// Physical constants
    pub physics: PhysicsParams,
    /// Lowest power the device can apply (W)
    pub min_device_power: f64,
    /// Highest power the device can apply (W)
    pub max_device_power: f64,
}

impl ModeContext {
    /// Total mass used for physics (kg)
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.user.total_mass()
    }
}

impl Default for ModeContext {
    fn default() -> Self {
        Self {
            user: UserSettings::default(),
            physics: PhysicsParams::default(),
            min_device_power: 25.0,
            max_device_power: 800.0,
        }
    }
}

/// A setting value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Numeric setting
    Number(f64),
    /// Boolean setting
    Bool(bool),
    /// Free text or selected option
    Text(String),
}

impl SettingValue {
    /// Numeric view, parsing text when needed
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    /// Boolean view
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Text view
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Kind of a declared setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyType {
    /// Number with optional bounds
    Number,
    /// On/off switch
    Bool,
    /// One of a fixed list of options
    Select,
    /// Free text
    Text,
}

/// Default value in a static property table
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum DefaultValue {
    /// Numeric default
    Number(f64),
    /// Boolean default
    Bool(bool),
    /// Text default
    Text(&'static str),
}

impl From<DefaultValue> for SettingValue {
    fn from(value: DefaultValue) -> Self {
        match value {
            DefaultValue::Number(n) => Self::Number(n),
            DefaultValue::Bool(b) => Self::Bool(b),
            DefaultValue::Text(s) => Self::Text(s.to_string()),
        }
    }
}

/// Declared setting of a cycling mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CyclingModeProperty {
    /// Settings key
    pub key: &'static str,
    /// Display name
    pub name: &'static str,
    /// Help text
    pub description: &'static str,
    /// Value kind
    pub kind: PropertyType,
    /// Value used while unset
    pub default: DefaultValue,
    /// Lower bound for numbers
    pub min: Option<f64>,
    /// Upper bound for numbers
    pub max: Option<f64>,
    /// Allowed values for selections
    pub options: &'static [&'static str],
}

impl CyclingModeProperty {
    fn validate(&self, value: &SettingValue) -> Result<()> {
        let invalid = |reason: String| {
            Err(PedalError::InvalidArgument(format!(
                "setting {}: {reason}",
                self.key
            )))
        };

        match self.kind {
            PropertyType::Number => {
                let Some(n) = value.as_f64() else {
                    return invalid(format!("expected a number, got {value:?}"));
                };
                if self.min.is_some_and(|min| n < min) || self.max.is_some_and(|max| n > max) {
                    return invalid(format!(
                        "{n} outside {:?}..={:?}",
                        self.min, self.max
                    ));
                }
            }
            PropertyType::Bool => {
                if value.as_bool().is_none() {
                    return invalid(format!("expected a boolean, got {value:?}"));
                }
            }
            PropertyType::Select => match value.as_str() {
                Some(s) if self.options.contains(&s) => {}
                _ => return invalid(format!("expected one of {:?}", self.options)),
            },
            PropertyType::Text => {
                if value.as_str().is_none() {
                    return invalid(format!("expected text, got {value:?}"));
                }
            }
        }
        Ok(())
    }
}

/// Flat key → value store backing a mode's settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    values: HashMap<String, SettingValue>,
}

impl Settings {
    /// Explicitly set value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    /// Overwrite a value
    pub fn insert(&mut self, key: &str, value: SettingValue) {
        self.values.insert(key.to_string(), value);
    }
}

/// Bookkeeping shared by all modes
#[derive(Debug, Clone, Default)]
pub struct ModeState {
    /// Last enriched sample
    pub prev_data: Option<BikeTelemetry>,
    /// Last command handed out, replayed when nothing changed
    pub prev_request: Option<DeviceCommand>,
    /// When `update_data` last ran
    pub prev_update: Option<Instant>,
    /// Distance integrated from computed speed (m)
    pub distance_internal: f64,
}

impl ModeState {
    /// Seconds since the previous sample, never negative
    pub fn elapsed(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = self
            .prev_update
            .map_or(Duration::ZERO, |prev| now.saturating_duration_since(prev));
        self.prev_update = Some(now);
        elapsed.as_secs_f64()
    }

    /// Integrate `speed` (km/h) over `seconds` and return the total distance (m)
    pub fn advance(&mut self, speed: f64, seconds: f64) -> f64 {
        self.distance_internal += speed.max(0.0) / 3.6 * seconds;
        self.distance_internal
    }

    /// Forget everything but the distance ridden
    pub fn clear_request(&mut self) {
        self.prev_request = None;
    }
}

/// Per-adapter strategy that shapes telemetry and device commands
pub trait CyclingMode: Send {
    /// Which variant this is
    fn kind(&self) -> ModeKind;

    /// Display name
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Short explanation for users
    fn description(&self) -> &'static str;

    /// Declared settings
    fn properties(&self) -> &'static [CyclingModeProperty];

    /// Settings store
    fn settings(&self) -> &Settings;

    /// Mutable settings store
    fn settings_mut(&mut self) -> &mut Settings;

    /// Shared bookkeeping
    fn state(&self) -> &ModeState;

    /// Current value of a setting, falling back to the declared default
    fn get_setting(&self, key: &str) -> Option<SettingValue> {
        self.settings().get(key).cloned().or_else(|| {
            self.properties()
                .iter()
                .find(|p| p.key == key)
                .map(|p| p.default.into())
        })
    }

    /// Overwrite a setting after checking it against its declaration
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidArgument`] for unknown keys and values
    /// that violate the declared type, bounds or options.
    fn set_setting(&mut self, key: &str, value: SettingValue) -> Result<()> {
        let property = self
            .properties()
            .iter()
            .find(|p| p.key == key)
            .ok_or_else(|| PedalError::InvalidArgument(format!("unknown setting: {key}")))?;
        property.validate(&value)?;
        self.settings_mut().insert(key, value);
        Ok(())
    }

    /// Numeric setting with default
    fn setting_f64(&self, key: &str) -> f64 {
        self.get_setting(key)
            .and_then(|v| v.as_f64())
            .unwrap_or_default()
    }

    /// Bike type setting, defaulting to race
    fn bike_type(&self) -> BikeType {
        self.get_setting("bikeType")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or_default()
    }

    /// Command issued when training starts
    fn get_bike_init_request(&self) -> DeviceCommand;

    /// Enrich a raw sample; may fail
    ///
    /// # Errors
    ///
    /// Propagates physics errors for nonsensical samples.
    fn calculate_update_data(&mut self, data: &BikeTelemetry) -> Result<BikeTelemetry>;

    /// Turn a client request into a device command; may fail
    ///
    /// # Errors
    ///
    /// Propagates physics errors for nonsensical state.
    fn calculate_bike_update(&mut self, request: &ControlRequest) -> Result<DeviceCommand>;

    /// Enrich a raw sample, never failing
    ///
    /// On error the previous enriched sample is returned, or the raw sample
    /// when there is none yet.
    fn update_data(&mut self, data: &BikeTelemetry) -> BikeTelemetry {
        match self.calculate_update_data(data) {
            Ok(enriched) => enriched,
            Err(e) => {
                warn!(mode = self.name(), "update_data failed: {}", e);
                self.state()
                    .prev_data
                    .clone()
                    .unwrap_or_else(|| data.clone())
            }
        }
    }

    /// Turn a client request into a device command, never failing
    ///
    /// On error the previous command is replayed, or nothing is sent.
    fn send_bike_update(&mut self, request: &ControlRequest) -> DeviceCommand {
        match self.calculate_bike_update(request) {
            Ok(command) => command,
            Err(e) => {
                warn!(mode = self.name(), "send_bike_update failed: {}", e);
                self.state().prev_request.unwrap_or_default()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_builds_each_kind() {
        for kind in [
            ModeKind::Erg,
            ModeKind::SmartTrainer,
            ModeKind::PowerMeter,
            ModeKind::Classic,
        ] {
            let mode = kind.create(ModeContext::default());
            assert_eq!(mode.kind(), kind);
            assert_eq!(mode.name(), kind.name());
            assert!(!mode.description().is_empty());
        }
    }

    #[test]
    fn test_settings_fall_back_to_defaults() {
        let mut mode = ModeKind::Erg.create(ModeContext::default());
        assert_eq!(mode.get_setting("startPower"), Some(SettingValue::Number(50.0)));
        assert_eq!(mode.get_setting("nope"), None);

        mode.set_setting("startPower", SettingValue::Number(120.0))
            .unwrap();
        assert!((mode.setting_f64("startPower") - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_settings_are_validated() {
        let mut mode = ModeKind::Erg.create(ModeContext::default());
        assert!(mode
            .set_setting("startPower", SettingValue::Number(5000.0))
            .is_err());
        assert!(mode
            .set_setting("startPower", SettingValue::Bool(true))
            .is_err());
        assert!(mode
            .set_setting("bikeType", SettingValue::Text("tandem".into()))
            .is_err());
        assert!(mode
            .set_setting("unknown", SettingValue::Number(1.0))
            .is_err());

        mode.set_setting("bikeType", SettingValue::Text("mountain".into()))
            .unwrap();
        assert_eq!(mode.bike_type(), BikeType::Mountain);
    }

    #[test]
    fn test_setting_value_views() {
        assert_eq!(SettingValue::Text(" 12 ".into()).as_f64(), Some(12.0));
        assert_eq!(SettingValue::Bool(true).as_f64(), None);
        assert_eq!(SettingValue::Bool(false).as_bool(), Some(false));
        assert_eq!(SettingValue::Text("x".into()).as_str(), Some("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_state_elapsed_is_monotonic() {
        let mut state = ModeState::default();
        assert!(state.elapsed().abs() < f64::EPSILON);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!((state.elapsed() - 1.5).abs() < 1e-9);
        assert!(state.elapsed().abs() < 1e-9);

        assert!((state.advance(36.0, 10.0) - 100.0).abs() < 1e-9);
        assert!((state.advance(-5.0, 10.0) - 100.0).abs() < 1e-9);
    }
}
