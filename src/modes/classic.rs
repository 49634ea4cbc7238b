use super::{
    CyclingMode, CyclingModeProperty, DefaultValue, ModeContext, ModeKind, ModeState,
    PropertyType, Settings,
};
use crate::{
    error::Result,
    types::{BikeTelemetry, ControlRequest, DeviceCommand},
};

static PROPERTIES: [CyclingModeProperty; 1] = [CyclingModeProperty {
    key: "bikeType",
    name: "Bike Type",
    description: "Bike type configured on the cockpit",
    kind: PropertyType::Select,
    default: DefaultValue::Text("race"),
    min: None,
    max: None,
    options: &["race", "triathlon", "mountain"],
}];

/// The cockpit runs its own physics; only the slope is relayed.
#[derive(Debug)]
pub struct ClassicCyclingMode {
    settings: Settings,
    state: ModeState,
    slope: f64,
}

impl ClassicCyclingMode {
    /// Create in the uninitialized state
    ///
    /// The context is unused: the cockpit runs its own physics.
    #[must_use]
    pub fn new(_context: ModeContext) -> Self {
        Self {
            settings: Settings::default(),
            state: ModeState::default(),
            slope: 0.0,
        }
    }
}

impl CyclingMode for ClassicCyclingMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Classic
    }

    fn description(&self) -> &'static str {
        "The bike calculates speed and power itself; the app only sets the slope"
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

    fn get_bike_init_request(&self) -> DeviceCommand {
        DeviceCommand::slope(0.0)
    }

    fn calculate_update_data(&mut self, data: &BikeTelemetry) -> Result<BikeTelemetry> {
        self.state.elapsed();
        let mut enriched = data.clone();
        enriched.slope = self.slope;
        enriched.distance_internal = data.distance_counter;
        if !data.is_pedalling {
            enriched.speed = 0.0;
            enriched.power = 0.0;
        }

        self.state.distance_internal = enriched.distance_internal;
        self.state.prev_data = Some(enriched.clone());
        Ok(enriched)
    }

    fn calculate_bike_update(&mut self, request: &ControlRequest) -> Result<DeviceCommand> {
        if request.reset || request.is_empty() {
            self.state.clear_request();
            return Ok(DeviceCommand::default());
        }

        let command = if let Some(slope) = request.slope.filter(|s| s.is_finite()) {
            self.slope = slope;
            DeviceCommand::slope(slope)
        } else if request.refresh {
            self.state
                .prev_request
                .unwrap_or_else(|| DeviceCommand::slope(self.slope))
        } else {
            return Ok(DeviceCommand::default());
        };

        self.state.prev_request = Some(command);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::test_support::pedalling;

    #[tokio::test(start_paused = true)]
    async fn test_hardware_values_pass_through() {
        let mut mode = ClassicCyclingMode::new(ModeContext::default());
        let data = mode.update_data(&BikeTelemetry {
            speed: 31.5,
            distance_counter: 1200.0,
            slope: 7.0,
            ..pedalling(88.0, 180.0, Some(12))
        });

        assert!((data.speed - 31.5).abs() < f64::EPSILON);
        assert!((data.power - 180.0).abs() < f64::EPSILON);
        assert!((data.distance_internal - 1200.0).abs() < f64::EPSILON);
        assert!(data.slope.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_pedalling_zeroes_output() {
        let mut mode = ClassicCyclingMode::new(ModeContext::default());
        let data = mode.update_data(&BikeTelemetry {
            speed: 12.0,
            power: 25.0,
            ..BikeTelemetry::default()
        });
        assert!(data.speed.abs() < f64::EPSILON);
        assert!(data.power.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slope_is_relayed_and_replayed() {
        let mut mode = ClassicCyclingMode::new(ModeContext::default());
        assert_eq!(mode.get_bike_init_request(), DeviceCommand::slope(0.0));
        assert_eq!(
            mode.send_bike_update(&ControlRequest::refresh()),
            DeviceCommand::slope(0.0)
        );

        let command = mode.send_bike_update(&ControlRequest::slope(3.5));
        assert_eq!(command, DeviceCommand::slope(3.5));
        assert_eq!(mode.send_bike_update(&ControlRequest::refresh()), command);
        assert!(mode
            .send_bike_update(&ControlRequest::target_power(200.0))
            .is_empty());

        assert!(mode.send_bike_update(&ControlRequest::reset()).is_empty());
        assert_eq!(mode.state().prev_request, None);
    }
}
