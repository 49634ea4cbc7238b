//! Device orchestration: per-protocol drivers and the [`DeviceAdapter`].

mod daum_classic;
mod daum_premium;
mod device;
mod kettler;

pub use daum_classic::DaumClassicDriver;
pub use daum_premium::DaumPremiumDriver;
pub use device::{
    AdapterStatus, DataCallback, DeviceAdapter, DisconnectCallback, ModeInfo, StartProps,
};
pub use kettler::KettlerDriver;

use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tokio::sync::watch;
use tracing::{error, warn};

use crate::{
    error::{PedalError, Result},
    modes::{ModeContext, ModeKind},
    physics::PhysicsParams,
    types::{BikeTelemetry, ConnectionState, DeviceCommand, DeviceInfo, Protocol, UserSettings},
};

/// Protocol-specific half of a [`DeviceAdapter`]
///
/// A driver owns the comms channel of one device and knows its command set.
/// It holds no cycling-mode state.
#[async_trait]
pub trait BikeDriver: Send + Sync {
    /// Wire protocol
    fn protocol(&self) -> Protocol;

    /// Transport path
    fn path(&self) -> &str;

    /// Cycling modes the device can run
    fn supported_modes(&self) -> &'static [ModeKind];

    /// Mode selected when the caller does not pick one
    fn default_mode(&self) -> ModeKind;

    /// Power range the device applies (W)
    fn power_range(&self) -> (f64, f64);

    /// Mode context for `user` on this device
    fn mode_context(&self, user: UserSettings) -> ModeContext {
        let (min_device_power, max_device_power) = self.power_range();
        ModeContext {
            user,
            physics: PhysicsParams::default(),
            min_device_power,
            max_device_power,
        }
    }

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Watch connection state changes
    fn subscribe(&self) -> watch::Receiver<ConnectionState>;

    /// Reject or accept traffic without touching the wire
    fn set_blocked(&self, blocked: bool);

    /// Open the channel if it is not open yet
    async fn connect(&self) -> Result<()>;

    /// Close the channel
    async fn disconnect(&self) -> Result<()>;

    /// Query identity (address, version, type)
    async fn identify(&self) -> Result<DeviceInfo>;

    /// Prepare the device for a session and apply the initial command
    async fn initialize(&self, user: &UserSettings, command: &DeviceCommand) -> Result<()>;

    /// Read one raw telemetry sample
    async fn read_telemetry(&self) -> Result<BikeTelemetry>;

    /// Transmit a power or slope command
    async fn apply(&self, command: &DeviceCommand) -> Result<()>;

    /// Select a gear on devices with a shifter
    async fn set_gear(&self, gear: u8) -> Result<()> {
        Err(PedalError::InvalidArgument(format!(
            "{} has no gear shifter (gear {gear})",
            self.protocol()
        )))
    }
}

/// Run `operation` up to `attempts` times, sleeping `delay` between failures
///
/// # Errors
///
/// When every attempt fails, returns [`PedalError::ConnectionFailed`] naming
/// `what` and the last underlying error.
pub async fn run_with_retries<T, F, Fut>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    warn!(
                        "{} failed on attempt {}/{}, retrying in {}ms: {}",
                        what,
                        attempt,
                        attempts,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    error!("{} failed after {} attempts", what, attempts);
    let cause = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
    Err(PedalError::ConnectionFailed(format!(
        "{what} failed after {attempts} attempts: {cause}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_ok;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = run_with_retries("probe", 5, Duration::from_millis(100), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PedalError::NotConnected)
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(assert_ok!(value), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_name_last_cause() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = run_with_retries("start", 3, Duration::from_millis(10), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PedalError::IllegalResponse("opcode 41".to_string()))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let message = result.unwrap_err().to_string();
        assert!(message.contains("start failed after 3 attempts"));
        assert!(message.contains("opcode 41"));
    }
}
