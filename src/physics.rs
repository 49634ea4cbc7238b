//! Bicycle dynamics: speed ⇄ power.
//!
//! Steady-state power at speed `v` (m/s) is modelled as
//! `P = a·v + b·v³` with
//!
//! - `a = (slope/100 + Crr)·m·g` (gravity and rolling resistance)
//! - `b = 0.5·ρ·CdA + 2k` (aerodynamic drag plus wheel/drivetrain loss)
//!
//! Going from speed to power is closed-form. Going from power to speed
//! solves the depressed cubic `v³ + p·v + q = 0` with `p = a/b` and
//! `q = −P/b`, picking the branch by the sign of `p` and of the discriminant.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, f64::consts::PI};

use crate::{
    error::{PedalError, Result},
    types::BikeType,
};

/// Standard gravity (m/s²)
pub const G: f64 = 9.806_65;
/// Air density at sea level and 20 °C (kg/m³)
pub const RHO: f64 = 1.2041;
/// Rolling resistance coefficient
pub const CRR: f64 = 0.0036;
/// Wheel and drivetrain loss coefficient
pub const K_DRIVETRAIN: f64 = 0.010_90;
/// Wheel circumference used by the chainring/cassette model (m)
pub const WHEEL_CIRCUMFERENCE_M: f64 = 2.096;

/// Rider posture, which determines the drag area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RidingPosition {
    /// Aero bars, fully tucked
    Aero,
    /// Time-trial position
    #[default]
    Triathlon,
    /// Hands in the drops
    Drops,
    /// Hands on the brake hoods, upright
    BrakeHoods,
}

impl RidingPosition {
    /// Drag area Cd·A (m²)
    #[must_use]
    pub const fn cw_a(self) -> f64 {
        match self {
            Self::Aero => 0.22,
            Self::Triathlon => 0.25,
            Self::Drops => 0.30,
            Self::BrakeHoods => 0.35,
        }
    }
}

/// Physical constants, all overridable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicsParams {
    /// Gravity (m/s²)
    pub g: f64,
    /// Air density (kg/m³)
    pub rho: f64,
    /// Rolling resistance coefficient
    pub crr: f64,
    /// Wheel/drivetrain loss coefficient
    pub k: f64,
    /// Fixed drag area; disables the posture table and downhill blending
    pub cw_a: Option<f64>,
    /// Posture on flat and uphill terrain
    pub position: RidingPosition,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            g: G,
            rho: RHO,
            crr: CRR,
            k: K_DRIVETRAIN,
            cw_a: None,
            position: RidingPosition::default(),
        }
    }
}

impl PhysicsParams {
    /// Drag area at the given slope
    ///
    /// Riders sit up on descents: between −1 % and −5 % the drag area is
    /// blended linearly from the configured posture to the brake-hood
    /// posture, and stays there below −5 %.
    #[must_use]
    pub fn cw_a_for_slope(&self, slope: f64) -> f64 {
        if let Some(cw_a) = self.cw_a {
            return cw_a;
        }

        let base = self.position.cw_a();
        let upright = RidingPosition::BrakeHoods.cw_a();
        if slope >= -1.0 {
            base
        } else if slope <= -5.0 {
            upright
        } else {
            let fraction = (-1.0 - slope) / 4.0;
            base + (upright - base) * fraction
        }
    }

    fn coefficients(&self, mass: f64, slope: f64) -> (f64, f64) {
        let a = (slope / 100.0 + self.crr) * mass * self.g;
        let b = 0.5 * self.rho * self.cw_a_for_slope(slope) + 2.0 * self.k;
        (a, b)
    }

    fn cache_key(&self) -> [u64; 6] {
        [
            self.g.to_bits(),
            self.rho.to_bits(),
            self.crr.to_bits(),
            self.k.to_bits(),
            self.cw_a.map_or(0, f64::to_bits),
            self.position as u64,
        ]
    }
}

fn validate(mass: f64, power_or_speed: f64, what: &str) -> Result<()> {
    if !mass.is_finite() || mass < 0.0 {
        return Err(PedalError::InvalidArgument(format!(
            "mass must be a non-negative number, got {mass}"
        )));
    }
    if !power_or_speed.is_finite() || power_or_speed < 0.0 {
        return Err(PedalError::InvalidArgument(format!(
            "{what} must be a non-negative number, got {power_or_speed}"
        )));
    }
    Ok(())
}

fn sanitize_slope(slope: f64) -> f64 {
    if slope.is_finite() {
        slope
    } else {
        0.0
    }
}

/// Largest real root of `z³ + p·z + q = 0`
fn largest_cubic_root(p: f64, q: f64) -> f64 {
    if p == 0.0 {
        return (-q).cbrt();
    }

    if p < 0.0 {
        let discriminant = (q / 2.0).powi(2) + (p / 3.0).powi(3);
        let r = 2.0 * (-p / 3.0).sqrt();

        if discriminant <= 0.0 {
            // three real roots, k = 0 is the largest
            let arg = (3.0 * q / (2.0 * p) * (-3.0 / p).sqrt()).clamp(-1.0, 1.0);
            let phi = arg.acos() / 3.0;
            return (0..3)
                .map(|k| r * (phi - 2.0 * PI * f64::from(k) / 3.0).cos())
                .fold(f64::NEG_INFINITY, f64::max);
        }

        let arg = -3.0 * q.abs() / (2.0 * p) * (-3.0 / p).sqrt();
        return -q.signum() * r * (arg.acosh() / 3.0).cosh();
    }

    let arg = 3.0 * q / (2.0 * p) * (3.0 / p).sqrt();
    -2.0 * (p / 3.0).sqrt() * (arg.asinh() / 3.0).sinh()
}

/// Speed (km/h) a rider of total `mass` (kg) reaches with `power` (W) on `slope` (%)
///
/// Returns 0 when no positive speed satisfies the equation.
///
/// # Errors
///
/// Returns [`PedalError::InvalidArgument`] if mass or power is negative or not finite.
pub fn speed_from_power(mass: f64, power: f64, slope: f64, params: &PhysicsParams) -> Result<f64> {
    validate(mass, power, "power")?;
    let slope = sanitize_slope(slope);

    let (a, b) = params.coefficients(mass, slope);
    let v = largest_cubic_root(a / b, -power / b);

    if v.is_finite() && v > 0.0 {
        Ok(v * 3.6)
    } else {
        Ok(0.0)
    }
}

/// Power (W) needed to hold `speed` (m/s) on `slope` (%) with total `mass` (kg)
///
/// The result is negative on descents steep enough to accelerate the rider
/// without pedalling.
///
/// # Errors
///
/// Returns [`PedalError::InvalidArgument`] if mass or speed is negative or not finite.
pub fn power_from_speed(mass: f64, speed: f64, slope: f64, params: &PhysicsParams) -> Result<f64> {
    validate(mass, speed, "speed")?;
    let slope = sanitize_slope(slope);

    let (a, b) = params.coefficients(mass, slope);
    Ok(b * speed.powi(3) + a * speed)
}

/// Speed (km/h) of a Daum-style gear number at `rpm`
///
/// Empirical linear model: each gear adds a fixed step to the ratio, and one
/// crank revolution in gear 1 covers `length_rpm` centimetres times that ratio.
#[must_use]
pub fn speed_from_gear_and_cadence(gear: u8, rpm: f64, bike_type: BikeType) -> f64 {
    let step = f64::from(gear.max(1) - 1);
    let (length_rpm, gear_ratio) = match bike_type {
        BikeType::Mountain => (185.0, 0.67 + step * 0.1485),
        BikeType::Race | BikeType::Triathlon => (210.0, 1.76 + step * 0.2),
    };

    let distance_per_minute = rpm.max(0.0) * length_rpm * gear_ratio;
    distance_per_minute * 60.0 / 100_000.0
}

/// Chainring/cassette drivetrain spanning the ratios of a real bike
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GearSet {
    /// Smallest ratio (small chainring / largest sprocket)
    pub min_ratio: f64,
    /// Largest ratio (big chainring / smallest sprocket)
    pub max_ratio: f64,
    /// Number of gear positions spread evenly between the two
    pub gears: u8,
}

impl GearSet {
    /// Build from chainring and cassette tooth ranges
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidArgument`] unless both ranges are ascending
    /// and non-zero, and there are at least two gears.
    pub fn new(chainrings: (u16, u16), cassette: (u16, u16), gears: u8) -> Result<Self> {
        let valid = |(lo, hi): (u16, u16)| lo > 0 && lo < hi;
        if !valid(chainrings) || !valid(cassette) || gears < 2 {
            return Err(PedalError::InvalidArgument(format!(
                "invalid gear set: chainrings {chainrings:?}, cassette {cassette:?}, {gears} gears"
            )));
        }

        Ok(Self {
            min_ratio: f64::from(chainrings.0) / f64::from(cassette.1),
            max_ratio: f64::from(chainrings.1) / f64::from(cassette.0),
            gears,
        })
    }

    /// Ratio of a 1-based gear number, clamped into range
    #[must_use]
    pub fn ratio(&self, gear: u8) -> f64 {
        let gear = gear.clamp(1, self.gears);
        let step = (self.max_ratio - self.min_ratio) / f64::from(self.gears - 1);
        self.min_ratio + step * f64::from(gear - 1)
    }

    /// Speed (km/h) in `gear` at `rpm`
    #[must_use]
    pub fn speed(&self, gear: u8, rpm: f64) -> f64 {
        rpm.max(0.0) * self.ratio(gear) * WHEEL_CIRCUMFERENCE_M * 60.0 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SpeedKey {
    mass_dg: i64,
    power_w: i64,
    slope_permille: i64,
    params: [u64; 6],
}

/// Memo for [`speed_from_power`]
///
/// Inputs are quantised (mass 0.1 kg, power 1 W, slope 0.1 %) before both
/// lookup and computation, so a hit returns exactly what a miss would have.
#[derive(Debug, Default)]
pub struct SpeedCache {
    entries: HashMap<SpeedKey, f64>,
}

impl SpeedCache {
    const MAX_ENTRIES: usize = 4096;

    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached [`speed_from_power`] on quantised inputs
    ///
    /// # Errors
    ///
    /// Same as [`speed_from_power`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn speed_from_power(
        &mut self,
        mass: f64,
        power: f64,
        slope: f64,
        params: &PhysicsParams,
    ) -> Result<f64> {
        validate(mass, power, "power")?;

        let slope = sanitize_slope(slope);
        let key = SpeedKey {
            mass_dg: (mass * 10.0).round() as i64,
            power_w: power.round() as i64,
            slope_permille: (slope * 10.0).round() as i64,
            params: params.cache_key(),
        };

        if let Some(speed) = self.entries.get(&key) {
            return Ok(*speed);
        }

        #[allow(clippy::cast_precision_loss)]
        let speed = speed_from_power(
            key.mass_dg as f64 / 10.0,
            key.power_w as f64,
            key.slope_permille as f64 / 10.0,
            params,
        )?;

        if self.entries.len() >= Self::MAX_ENTRIES {
            self.entries.clear();
        }
        self.entries.insert(key, speed);
        Ok(speed)
    }

    /// Number of memoised results
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
