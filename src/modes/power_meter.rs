use super::{
    CyclingMode, CyclingModeProperty, ModeContext, ModeKind, ModeState, Settings,
};
use crate::{
    error::Result,
    physics::SpeedCache,
    types::{BikeTelemetry, ControlRequest, DeviceCommand},
};

/// Uses the device as a power meter: power and cadence are trusted, speed
/// follows from power on the last slope sent by the app. Nothing is ever
/// written back to the device.
#[derive(Debug)]
pub struct PowerMeterCyclingMode {
    context: ModeContext,
    settings: Settings,
    state: ModeState,
    cache: SpeedCache,
    slope: f64,
}

impl PowerMeterCyclingMode {
    /// Create in the uninitialized state
    #[must_use]
    pub fn new(context: ModeContext) -> Self {
        Self {
            context,
            settings: Settings::default(),
            state: ModeState::default(),
            cache: SpeedCache::new(),
            slope: 0.0,
        }
    }
}

impl CyclingMode for PowerMeterCyclingMode {
    fn kind(&self) -> ModeKind {
        ModeKind::PowerMeter
    }

    fn description(&self) -> &'static str {
        "Power and cadence are taken from the device, speed is calculated from power and slope"
    }

    fn properties(&self) -> &'static [CyclingModeProperty] {
        &[]
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

    fn get_bike_init_request(&self) -> DeviceCommand {
        DeviceCommand::default()
    }

    fn calculate_update_data(&mut self, data: &BikeTelemetry) -> Result<BikeTelemetry> {
        let seconds = self.state.elapsed();
        let mut enriched = data.clone();
        enriched.slope = self.slope;
        enriched.speed = if data.is_pedalling {
            self.cache.speed_from_power(
                self.context.mass(),
                data.power.max(0.0),
                self.slope,
                &self.context.physics,
            )?
        } else {
            0.0
        };

        enriched.distance_internal = self.state.advance(enriched.speed, seconds);
        self.state.prev_data = Some(enriched.clone());
        Ok(enriched)
    }

    fn calculate_bike_update(&mut self, request: &ControlRequest) -> Result<DeviceCommand> {
        if request.reset || request.is_empty() {
            self.state.clear_request();
            return Ok(DeviceCommand::default());
        }

        if let Some(slope) = request.slope.filter(|s| s.is_finite()) {
            self.slope = slope;
        }
        Ok(DeviceCommand::default())
    }
}
