use crate::types::BikeTelemetry;

/// Cycles a power change is spread over
pub const SEC_DELAY: u8 = 3;
/// Changes up to this size (W) are applied at once
pub const RAMP_THRESHOLD_W: f64 = 10.0;

/// Direction of a gear shift
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GearDirection {
    /// Shifted to a harder gear
    Up,
    /// Shifted to an easier gear
    Down,
}

/// What changed since the last command was computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeEvent {
    /// Gear shift seen in telemetry
    pub gear_update: Option<GearDirection>,
    /// Cadence (to whole rpm) changed
    pub rpm_update: bool,
    /// Client changed the slope
    pub slope_update: bool,
    /// Consecutive cycles the power target lagged behind
    pub target_not_reached: u8,
}

impl ModeEvent {
    /// Accumulate changes between two consecutive samples
    pub fn observe(&mut self, previous: Option<&BikeTelemetry>, current: &BikeTelemetry) {
        let Some(previous) = previous else {
            self.rpm_update = true;
            return;
        };

        match (previous.gear, current.gear) {
            (Some(before), Some(after)) if after > before => {
                self.gear_update = Some(GearDirection::Up);
            }
            (Some(before), Some(after)) if after < before => {
                self.gear_update = Some(GearDirection::Down);
            }
            _ => {}
        }

        if previous.cadence.round() != current.cadence.round()
            || previous.is_pedalling != current.is_pedalling
        {
            self.rpm_update = true;
        }
    }

    /// Whether the rider or the client changed anything
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.gear_update.is_some() || self.rpm_update || self.slope_update
    }

    /// Mark the changes as handled
    pub fn consume(&mut self) {
        self.gear_update = None;
        self.rpm_update = false;
        self.slope_update = false;
    }
}

/// Client supplied power bounds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerLimits {
    /// Lower bound (W)
    pub min: Option<f64>,
    /// Upper bound (W)
    pub max: Option<f64>,
}

impl PowerLimits {
    /// Take over whichever bounds a request carries
    pub fn update(&mut self, min: Option<f64>, max: Option<f64>) {
        if min.is_some() {
            self.min = min;
        }
        if max.is_some() {
            self.max = max;
        }
    }

    /// Clamp `power`, reporting which bound was hit
    #[must_use]
    pub fn apply(&self, power: f64) -> (f64, bool, bool) {
        if let Some(min) = self.min.filter(|min| power < *min) {
            return (min, true, false);
        }
        if let Some(max) = self.max.filter(|max| power > *max) {
            return (max, false, true);
        }
        (power, false, false)
    }
}

/// Result of one ramp cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampStep {
    /// Power sent to the device this cycle (W)
    pub target_power: f64,
    /// Power the physics asks for (W)
    pub calculated_power: f64,
    /// `calculated_power` minus the previous target (W)
    pub delta: f64,
    /// Target was raised to the lower bound
    pub below_min: bool,
    /// Target was cut to the upper bound
    pub above_max: bool,
}

/// Spreads large power jumps over [`SEC_DELAY`] cycles
///
/// Each cycle that has not reached the required power moves by the remaining
/// difference divided by the cycles left, so a constant requirement is hit
/// exactly on the last cycle.
#[derive(Debug, Clone, Default)]
pub struct PowerRamp {
    current: Option<f64>,
    target_not_reached: u8,
}

impl PowerRamp {
    /// Power last handed out
    #[must_use]
    pub const fn current(&self) -> Option<f64> {
        self.current
    }

    /// Consecutive cycles the target lagged behind
    #[must_use]
    pub const fn target_not_reached(&self) -> u8 {
        self.target_not_reached
    }

    /// Whether a ramp is still running
    #[must_use]
    pub const fn is_ramping(&self) -> bool {
        self.target_not_reached > 0
    }

    /// Start over
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Jump to `power` without ramping
    pub fn force(&mut self, power: f64, limits: PowerLimits) -> RampStep {
        let delta = self.current.map_or(0.0, |current| power - current);
        self.settle(power, delta, limits)
    }

    /// Advance one cycle towards `required`
    pub fn step(&mut self, required: f64, limits: PowerLimits) -> RampStep {
        let Some(current) = self.current else {
            return self.settle(required, 0.0, limits);
        };

        let delta = required - current;
        if delta.abs() <= RAMP_THRESHOLD_W {
            return self.settle(required, delta, limits);
        }

        self.target_not_reached = (self.target_not_reached + 1).min(SEC_DELAY);
        let remaining = SEC_DELAY - self.target_not_reached + 1;
        if remaining <= 1 {
            return self.settle(required, delta, limits);
        }

        let target = current + delta / f64::from(remaining);
        let (target, below_min, above_max) = limits.apply(target);
        if below_min || above_max {
            self.target_not_reached = 0;
        }
        self.current = Some(target);

        RampStep {
            target_power: target,
            calculated_power: required,
            delta,
            below_min,
            above_max,
        }
    }

    fn settle(&mut self, required: f64, delta: f64, limits: PowerLimits) -> RampStep {
        let (target, below_min, above_max) = limits.apply(required);
        self.target_not_reached = 0;
        self.current = Some(target);

        RampStep {
            target_power: target,
            calculated_power: required,
            delta,
            below_min,
            above_max,
        }
    }
}
