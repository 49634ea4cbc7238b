use tracing::debug;

use super::{
    CyclingMode, CyclingModeProperty, DefaultValue, ModeContext, ModeEvent, ModeKind, ModeState,
    PowerLimits, PropertyType, Settings,
};
use crate::{
    error::Result,
    physics::{power_from_speed, speed_from_gear_and_cadence, SpeedCache},
    types::{BikeTelemetry, ControlRequest, DeviceCommand},
};

static PROPERTIES: [CyclingModeProperty; 2] = [
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
        description: "Power applied until the rider starts pedalling (W)",
        kind: PropertyType::Number,
        default: DefaultValue::Number(50.0),
        min: Some(25.0),
        max: Some(800.0),
        options: &[],
    },
];

/// Holds a power target; on bikes with a gear shifter the target follows
/// the power needed to ride the selected gear at the current cadence.
#[derive(Debug)]
pub struct ErgCyclingMode {
    context: ModeContext,
    settings: Settings,
    state: ModeState,
    event: ModeEvent,
    limits: PowerLimits,
    cache: SpeedCache,
    /// Last power target set by the client, kept across pedalling pauses
    client_target: Option<f64>,
}

impl ErgCyclingMode {
    /// Create in the uninitialized state
    #[must_use]
    pub fn new(context: ModeContext) -> Self {
        Self {
            context,
            settings: Settings::default(),
            state: ModeState::default(),
            event: ModeEvent::default(),
            limits: PowerLimits::default(),
            cache: SpeedCache::new(),
            client_target: None,
        }
    }

    fn start_power(&self) -> f64 {
        self.setting_f64("startPower")
    }

    fn clamp(&self, power: f64) -> f64 {
        let (power, _, _) = self.limits.apply(power);
        power.clamp(self.context.min_device_power, self.context.max_device_power)
    }

    /// Power needed to ride the current gear at the current cadence on the flat
    fn gear_power(&self) -> Result<Option<f64>> {
        let Some(data) = self.state.prev_data.as_ref() else {
            return Ok(None);
        };
        let Some(gear) = data.gear.filter(|_| data.is_pedalling) else {
            return Ok(None);
        };

        let speed = speed_from_gear_and_cadence(gear, data.cadence, self.bike_type());
        let power = power_from_speed(
            self.context.mass(),
            speed / 3.6,
            0.0,
            &self.context.physics,
        )?;
        Ok(Some(power))
    }

    fn recompute(&mut self) -> Result<DeviceCommand> {
        let pedalling = self
            .state
            .prev_data
            .as_ref()
            .is_some_and(|data| data.is_pedalling);

        let target = if pedalling {
            match self.gear_power()? {
                Some(power) => power,
                None => self.client_target.unwrap_or_else(|| self.start_power()),
            }
        } else {
            self.start_power()
        };

        Ok(DeviceCommand::power(self.clamp(target)))
    }
}

impl CyclingMode for ErgCyclingMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Erg
    }

    fn description(&self) -> &'static str {
        "Calculates speed based on power and cadence; power targets are set by the app or by gear and cadence"
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
        DeviceCommand::power(self.start_power())
    }

    fn calculate_update_data(&mut self, data: &BikeTelemetry) -> Result<BikeTelemetry> {
        let seconds = self.state.elapsed();
        let mut enriched = data.clone();
        enriched.slope = 0.0;

        if data.is_pedalling {
            enriched.speed = match data.gear {
                Some(gear) => speed_from_gear_and_cadence(gear, data.cadence, self.bike_type()),
                None => self.cache.speed_from_power(
                    self.context.mass(),
                    data.power.max(0.0),
                    0.0,
                    &self.context.physics,
                )?,
            };
        } else {
            enriched.speed = 0.0;
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
            self.event = ModeEvent::default();
            self.client_target = None;
            return Ok(DeviceCommand::default());
        }

        self.limits.update(request.min_power, request.max_power);

        let command = if let Some(power) = request.target_power {
            self.client_target = Some(power);
            DeviceCommand::power(self.clamp(power))
        } else if request.refresh {
            match self.state.prev_request {
                Some(prev) if self.event.gear_update.is_none() && !self.event.rpm_update => {
                    return Ok(prev);
                }
                _ => self.recompute()?,
            }
        } else if let Some(prev) = self.state.prev_request {
            // slope-only or bounds-only request; slope has no meaning here
            let power = self
                .client_target
                .or(prev.target_power)
                .unwrap_or_else(|| self.start_power());
            DeviceCommand::power(self.clamp(power))
        } else {
            self.recompute()?
        };

        debug!(mode = self.name(), ?command, event = ?self.event, "bike update");
        self.event.consume();
        self.state.prev_request = Some(command);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::test_support::pedalling;

    fn mode() -> ErgCyclingMode {
        ErgCyclingMode::new(ModeContext::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_after_pedalling_uses_gear_power() {
        let mut mode = mode();
        mode.update_data(&pedalling(90.0, 120.0, Some(10)));

        let command = mode.send_bike_update(&ControlRequest::refresh());
        let power = command.target_power.unwrap();
        assert!((power - 278.0).abs() < 1.5, "got {power}");
        assert_eq!(command.slope, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_without_pedalling_uses_start_power() {
        let mut mode = mode();
        mode.update_data(&BikeTelemetry::default());

        let command = mode.send_bike_update(&ControlRequest::refresh());
        assert_eq!(command, DeviceCommand::power(50.0));
        assert_eq!(mode.get_bike_init_request(), DeviceCommand::power(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_replays_until_an_event() {
        let mut mode = mode();
        mode.update_data(&pedalling(90.0, 200.0, Some(10)));

        let first = mode.send_bike_update(&ControlRequest::refresh());
        mode.update_data(&pedalling(90.0, 200.0, Some(10)));
        let second = mode.send_bike_update(&ControlRequest::refresh());
        let third = mode.send_bike_update(&ControlRequest::refresh());
        assert_eq!(first, second);
        assert_eq!(second, third);

        mode.update_data(&pedalling(90.0, 200.0, Some(12)));
        let shifted = mode.send_bike_update(&ControlRequest::refresh());
        assert!(shifted.target_power.unwrap() > first.target_power.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slope_is_discarded() {
        let mut mode = mode();
        let explicit = mode.send_bike_update(&ControlRequest::target_power(180.0));
        assert_eq!(explicit, DeviceCommand::power(180.0));

        let slope = mode.send_bike_update(&ControlRequest::slope(8.0));
        assert_eq!(slope, DeviceCommand::power(180.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_is_clamped_to_bounds() {
        let mut mode = mode();
        let request = ControlRequest {
            target_power: Some(500.0),
            max_power: Some(300.0),
            ..ControlRequest::default()
        };
        assert_eq!(mode.send_bike_update(&request), DeviceCommand::power(300.0));
        assert_eq!(
            mode.send_bike_update(&ControlRequest::target_power(5.0)),
            DeviceCommand::power(25.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_pedalling_collapses_to_start_power() {
        let mut mode = mode();
        mode.update_data(&pedalling(90.0, 200.0, Some(10)));
        mode.send_bike_update(&ControlRequest::refresh());

        mode.update_data(&BikeTelemetry::default());
        let command = mode.send_bike_update(&ControlRequest::refresh());
        assert_eq!(command, DeviceCommand::power(50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_target_survives_pedalling_pause() {
        let mut mode = mode();
        mode.update_data(&pedalling(90.0, 150.0, None));
        assert_eq!(
            mode.send_bike_update(&ControlRequest::target_power(150.0)),
            DeviceCommand::power(150.0)
        );

        mode.update_data(&BikeTelemetry::default());
        let stopped = mode.send_bike_update(&ControlRequest::refresh());
        assert_eq!(stopped, DeviceCommand::power(50.0));

        mode.update_data(&pedalling(90.0, 60.0, None));
        let resumed = mode.send_bike_update(&ControlRequest::refresh());
        assert_eq!(resumed, DeviceCommand::power(150.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state() {
        let mut mode = mode();
        mode.send_bike_update(&ControlRequest::target_power(200.0));

        assert!(mode.send_bike_update(&ControlRequest::reset()).is_empty());
        assert!(mode.send_bike_update(&ControlRequest::default()).is_empty());
        assert_eq!(mode.state().prev_request, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_data_without_gear_uses_power() {
        let mut mode = mode();
        mode.update_data(&pedalling(90.0, 100.0, None));
        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        let data = mode.update_data(&pedalling(90.0, 100.0, None));

        assert!(data.speed > 25.0 && data.speed < 32.0, "got {}", data.speed);
        assert!((data.distance_internal - data.speed / 3.6).abs() < 1e-9);
    }
}
