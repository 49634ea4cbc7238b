use tracing::{debug, warn};

use super::{
    CyclingMode, CyclingModeProperty, DefaultValue, ModeContext, ModeEvent, ModeKind, ModeState,
    PowerLimits, PowerRamp, PropertyType, RampStep, Settings, SettingValue,
};
use crate::{
    error::{PedalError, Result},
    physics::{power_from_speed, speed_from_gear_and_cadence, GearSet, SpeedCache},
    types::{BikeTelemetry, ControlRequest, DeviceCommand},
};

static PROPERTIES: [CyclingModeProperty; 5] = [
    CyclingModeProperty {
        key: "bikeType",
        name: "Bike Type",
        description: "Gear model used to turn gear and cadence into speed",
        kind: PropertyType::Select,
        default: DefaultValue::Text("race"),
        min: None,
        max: None,
        options: &["race", "triathlon", "mountain"],
    },
    CyclingModeProperty {
        key: "startPower",
        name: "Starting Power",
        description: "Power applied when training starts (W)",
        kind: PropertyType::Number,
        default: DefaultValue::Number(50.0),
        min: Some(25.0),
        max: Some(800.0),
        options: &[],
    },
    CyclingModeProperty {
        key: "chainRings",
        name: "Chainrings",
        description: "Smallest and largest chainring, e.g. \"34-50\"; enables gear simulation together with the cassette",
        kind: PropertyType::Text,
        default: DefaultValue::Text(""),
        min: None,
        max: None,
        options: &[],
    },
    CyclingModeProperty {
        key: "cassetteRings",
        name: "Cassette",
        description: "Smallest and largest sprocket, e.g. \"11-28\"",
        kind: PropertyType::Text,
        default: DefaultValue::Text(""),
        min: None,
        max: None,
        options: &[],
    },
    CyclingModeProperty {
        key: "gearCount",
        name: "Gears",
        description: "Number of gear positions spread over the simulated drivetrain",
        kind: PropertyType::Number,
        default: DefaultValue::Number(28.0),
        min: Some(2.0),
        max: Some(40.0),
        options: &[],
    },
];

/// Parse `"min-max"` into an ascending tooth range
fn parse_range(value: &str) -> Option<(u16, u16)> {
    let (lo, hi) = value.split_once('-')?;
    let lo = lo.trim().parse().ok()?;
    let hi = hi.trim().parse().ok()?;
    (lo > 0 && lo < hi).then_some((lo, hi))
}

/// Slope simulation: the power target follows the power needed to hold the
/// rider's last speed on the simulated slope, ramped over a few cycles.
#[derive(Debug)]
pub struct SmartTrainerCyclingMode {
    context: ModeContext,
    settings: Settings,
    state: ModeState,
    event: ModeEvent,
    limits: PowerLimits,
    ramp: PowerRamp,
    cache: SpeedCache,
    slope: f64,
    gear_set: Option<GearSet>,
    last_step: Option<RampStep>,
}

impl SmartTrainerCyclingMode {
    /// Create in the uninitialized state
    #[must_use]
    pub fn new(context: ModeContext) -> Self {
        Self {
            context,
            settings: Settings::default(),
            state: ModeState::default(),
            event: ModeEvent::default(),
            limits: PowerLimits {
                min: Some(context.min_device_power),
                max: Some(context.max_device_power),
            },
            ramp: PowerRamp::default(),
            cache: SpeedCache::new(),
            slope: 0.0,
            gear_set: None,
            last_step: None,
        }
    }

    /// Simulated slope (%)
    #[must_use]
    pub const fn slope(&self) -> f64 {
        self.slope
    }

    /// Outcome of the latest ramp cycle
    #[must_use]
    pub const fn last_step(&self) -> Option<RampStep> {
        self.last_step
    }

    /// Whether chainring/cassette simulation is active
    #[must_use]
    pub const fn is_gear_simulation(&self) -> bool {
        self.gear_set.is_some()
    }

    fn rebuild_gear_set(&mut self) {
        let text = |key: &str| {
            self.get_setting(key)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        };
        let chainrings = parse_range(&text("chainRings"));
        let cassette = parse_range(&text("cassetteRings"));

        self.gear_set = match (chainrings, cassette) {
            (Some(chainrings), Some(cassette)) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let gears = self.setting_f64("gearCount").round() as u8;
                match GearSet::new(chainrings, cassette, gears) {
                    Ok(set) => Some(set),
                    Err(e) => {
                        warn!(mode = self.name(), "gear simulation disabled: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };
    }

    fn speed_for(&mut self, data: &BikeTelemetry) -> Result<f64> {
        if !data.is_pedalling {
            return Ok(0.0);
        }

        match data.gear {
            Some(gear) => Ok(self.gear_set.map_or_else(
                || speed_from_gear_and_cadence(gear, data.cadence, self.bike_type()),
                |set| set.speed(gear, data.cadence),
            )),
            None => self.cache.speed_from_power(
                self.context.mass(),
                data.power.max(0.0),
                self.slope,
                &self.context.physics,
            ),
        }
    }

    fn required_power(&self) -> Result<f64> {
        let speed = self
            .state
            .prev_data
            .as_ref()
            .filter(|data| data.is_pedalling)
            .map_or(0.0, |data| data.speed / 3.6);

        if speed <= 0.0 {
            return Ok(0.0);
        }
        power_from_speed(self.context.mass(), speed, self.slope, &self.context.physics)
    }
}

impl CyclingMode for SmartTrainerCyclingMode {
    fn kind(&self) -> ModeKind {
        ModeKind::SmartTrainer
    }

    fn description(&self) -> &'static str {
        "Simulates the power needed to hold the current speed on the slope sent by the app"
    }

    fn properties(&self) -> &'static [CyclingModeProperty] {
        &PROPERTIES
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    fn state(&self) -> &ModeState {
        &self.state
    }

    fn set_setting(&mut self, key: &str, value: SettingValue) -> Result<()> {
        let property = PROPERTIES
            .iter()
            .find(|p| p.key == key)
            .ok_or_else(|| PedalError::InvalidArgument(format!("unknown setting: {key}")))?;
        property.validate(&value)?;
        self.settings.insert(key, value);
        self.rebuild_gear_set();
        Ok(())
    }

    fn get_bike_init_request(&self) -> DeviceCommand {
        DeviceCommand::power(self.setting_f64("startPower"))
    }

    fn calculate_update_data(&mut self, data: &BikeTelemetry) -> Result<BikeTelemetry> {
        let seconds = self.state.elapsed();
        let mut enriched = data.clone();
        enriched.slope = self.slope;
        enriched.speed = self.speed_for(data)?;
        if !data.is_pedalling {
            enriched.power = 0.0;
            enriched.cadence = 0.0;
        }

        enriched.distance_internal = self.state.advance(enriched.speed, seconds);
        self.event.observe(self.state.prev_data.as_ref(), &enriched);
        self.state.prev_data = Some(enriched.clone());
        Ok(enriched)
    }

    fn calculate_bike_update(&mut self, request: &ControlRequest) -> Result<DeviceCommand> {
        if request.reset || request.is_empty() {
            self.state.clear_request();
            self.ramp.reset();
            self.event = ModeEvent::default();
            self.last_step = None;
            return Ok(DeviceCommand::default());
        }

        self.limits.update(request.min_power, request.max_power);

        if let Some(slope) = request.slope.filter(|s| s.is_finite()) {
            if (slope - self.slope).abs() > f64::EPSILON {
                self.slope = slope;
                self.event.slope_update = true;
            }
        }

        let step = match request.target_power {
            Some(power) if request.slope.is_none() => self.ramp.force(power, self.limits),
            _ => {
                if request.refresh
                    && !self.event.has_changes()
                    && !self.ramp.is_ramping()
                {
                    if let Some(prev) = self.state.prev_request {
                        return Ok(prev);
                    }
                }
                let required = self.required_power()?;
                self.ramp.step(required, self.limits)
            }
        };

        self.event.target_not_reached = self.ramp.target_not_reached();
        debug!(
            mode = self.name(),
            slope = self.slope,
            target = step.target_power,
            calculated = step.calculated_power,
            delta = step.delta,
            below_min = step.below_min,
            above_max = step.above_max,
            retry = self.event.target_not_reached,
            "bike update"
        );
        self.event.consume();
        self.last_step = Some(step);

        let command = DeviceCommand::power(step.target_power);
        self.state.prev_request = Some(command);
        Ok(command)
    }
}
