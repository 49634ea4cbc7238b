use futures::future::join_all;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{run_with_retries, BikeDriver};
use crate::{
    error::{PedalError, Result, TimeoutKind},
    modes::{CyclingMode, CyclingModeProperty, ModeKind, SettingValue},
    types::{
        BikeTelemetry, ConnectionParams, ConnectionState, ControlRequest, DeviceCommand,
        DeviceInfo, IgnoreFlags, NormalizedOutput, Protocol, SchedulerConfig, UserSettings,
    },
};

/// Receives every normalized sample delivered by the emit loop
pub type DataCallback = Arc<dyn Fn(&NormalizedOutput) + Send + Sync>;

/// Receives the connection state when the transport goes away mid-session
pub type DisconnectCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Options for [`DeviceAdapter::start`]
#[derive(Debug, Clone, Default)]
pub struct StartProps {
    /// Rider data; keeps the current settings when `None`
    pub user: Option<UserSettings>,
    /// Cycling mode; keeps the active mode when `None`
    pub mode: Option<ModeKind>,
    /// Output suppression; keeps the current flags when `None`
    pub ignore: Option<IgnoreFlags>,
}

/// Snapshot returned by [`DeviceAdapter::status`]
#[derive(Debug, Clone)]
pub struct AdapterStatus {
    /// Connection state of the channel
    pub state: ConnectionState,
    /// Whether the update loops are running
    pub running: bool,
    /// Whether the update loops are paused
    pub paused: bool,
    /// Name of the active cycling mode
    pub mode: &'static str,
    /// Last normalized sample
    pub last_output: Option<NormalizedOutput>,
}

/// Description of a cycling mode and its settings
#[derive(Debug, Clone)]
pub struct ModeInfo {
    /// Mode
    pub kind: ModeKind,
    /// Display name
    pub name: &'static str,
    /// One-line description
    pub description: &'static str,
    /// Declared settings
    pub properties: &'static [CyclingModeProperty],
}

impl ModeInfo {
    fn of(mode: &dyn CyclingMode) -> Self {
        Self {
            kind: mode.kind(),
            name: mode.name(),
            description: mode.description(),
            properties: mode.properties(),
        }
    }
}

#[derive(Debug, Default)]
struct Outbound {
    /// Next command for the device; a newer one overwrites it
    pending: Option<DeviceCommand>,
    last_queued: Option<DeviceCommand>,
}

struct Loops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    driver: Arc<dyn BikeDriver>,
    scheduler: SchedulerConfig,
    user: RwLock<UserSettings>,
    mode: Mutex<Box<dyn CyclingMode>>,
    ignore: RwLock<IgnoreFlags>,
    outbound: Mutex<Outbound>,
    latest: RwLock<Option<NormalizedOutput>>,
    on_data: RwLock<Option<DataCallback>>,
    on_disconnect: RwLock<Option<DisconnectCallback>>,
    paused: AtomicBool,
}

/// One physical bike, end to end
///
/// `DeviceAdapter` combines a protocol [`BikeDriver`] with the active
/// [`CyclingMode`]. After [`start`](Self::start) two loops run until
/// [`stop`](Self::stop):
///
/// - the **sync loop** sends the most recent queued command (older ones are
///   dropped), pulls a telemetry sample, runs it through the cycling mode and
///   stores the normalized result;
/// - the **emit loop** hands the stored result to the data callback and asks
///   the cycling mode for a refreshed command, queuing it when the target
///   changed.
///
/// Slow device I/O on the sync loop never delays data delivery. A sync tick
/// that comes due while the previous one is still running is skipped.
///
/// Errors inside a tick are logged and the loop carries on with the next
/// tick. A transport that closes underneath the session is reported once
/// through [`on_disconnect`](Self::on_disconnect); the following sync ticks
/// reconnect and re-initialize the device until it answers again.
///
/// # Examples
///
/// ```no_run
/// use pedalers::{
///     adapter::{DeviceAdapter, KettlerDriver, StartProps},
///     transport::{PortRegistry, TcpTransport},
///     types::ControlRequest,
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(TcpTransport::from_path("192.168.1.20:51955")?);
///     let adapter = DeviceAdapter::new(Arc::new(KettlerDriver::new(
///         transport,
///         PortRegistry::new(),
///     )));
///
///     let device = adapter.check().await?;
///     println!("Found {}", device.name);
///
///     adapter
///         .on_data(|data| println!("{:?} W at {:?} rpm", data.power, data.cadence))
///         .await;
///     adapter.start(StartProps::default()).await?;
///     adapter.send_update(&ControlRequest::target_power(150.0)).await;
///
///     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///     adapter.stop().await?;
///     Ok(())
/// }
/// ```
pub struct DeviceAdapter {
    shared: Arc<Shared>,
    params: ConnectionParams,
    device: RwLock<Option<DeviceInfo>>,
    loops: Mutex<Option<Loops>>,
}

impl DeviceAdapter {
    /// Create an adapter with the driver's default mode and default timing
    #[must_use]
    pub fn new(driver: Arc<dyn BikeDriver>) -> Self {
        let params = ConnectionParams::for_protocol(driver.protocol());
        Self::with_config(
            driver,
            params,
            SchedulerConfig::default(),
            UserSettings::default(),
        )
    }

    /// Create an adapter with explicit retry, scheduler and rider settings
    #[must_use]
    pub fn with_config(
        driver: Arc<dyn BikeDriver>,
        params: ConnectionParams,
        scheduler: SchedulerConfig,
        user: UserSettings,
    ) -> Self {
        let mode = driver.default_mode().create(driver.mode_context(user));
        Self {
            shared: Arc::new(Shared {
                driver,
                scheduler,
                user: RwLock::new(user),
                mode: Mutex::new(mode),
                ignore: RwLock::new(IgnoreFlags::default()),
                outbound: Mutex::new(Outbound::default()),
                latest: RwLock::new(None),
                on_data: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                paused: AtomicBool::new(false),
            }),
            params,
            device: RwLock::new(None),
            loops: Mutex::new(None),
        }
    }

    /// Transport path
    #[must_use]
    pub fn path(&self) -> &str {
        self.shared.driver.path()
    }

    /// Wire protocol
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.shared.driver.protocol()
    }

    /// Identity found by the last successful [`check`](Self::check)
    pub async fn device_info(&self) -> Option<DeviceInfo> {
        self.device.read().await.clone()
    }

    /// Register the data callback, replacing any previous one
    pub async fn on_data<F>(&self, callback: F)
    where
        F: Fn(&NormalizedOutput) + Send + Sync + 'static,
    {
        *self.shared.on_data.write().await = Some(Arc::new(callback));
    }

    /// Register the disconnect callback, replacing any previous one
    pub async fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        *self.shared.on_disconnect.write().await = Some(Arc::new(callback));
    }

    /// Open the channel if needed and identify the device
    ///
    /// The whole exchange is bounded by `check_timeout_ms`, independent of the
    /// per-command timeouts. On failure the channel is closed again so the
    /// port is free for the next probe.
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::Timeout`] with [`TimeoutKind::Check`] when
    /// identification does not finish in time, or the first comms error.
    pub async fn check(&self) -> Result<DeviceInfo> {
        let driver = &self.shared.driver;
        let timeout_ms = self.params.check_timeout_ms;

        let identified = time::timeout(Duration::from_millis(timeout_ms), async {
            driver.connect().await?;
            driver.identify().await
        })
        .await
        .unwrap_or(Err(PedalError::timeout(TimeoutKind::Check, timeout_ms)));

        match identified {
            Ok(device) => {
                info!("Found {} on {}", device.name, self.path());
                *self.device.write().await = Some(device.clone());
                Ok(device)
            }
            Err(e) => {
                warn!("Check of {} failed: {}", self.path(), e);
                if let Err(close) = driver.disconnect().await {
                    debug!("Closing {} after failed check: {}", self.path(), close);
                }
                Err(e)
            }
        }
    }

    /// Connect, initialize the device and start the update loops
    ///
    /// Connecting, the device initialization sequence and the first telemetry
    /// read are retried together up to `retry_attempts` times. Returns the
    /// first sample after it went through the cycling mode.
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::ConnectionFailed`] naming the last cause when all
    /// attempts fail, or [`PedalError::InvalidArgument`] when `props.mode` is
    /// not supported by the device.
    pub async fn start(&self, props: StartProps) -> Result<BikeTelemetry> {
        if let Some(ignore) = props.ignore {
            *self.shared.ignore.write().await = ignore;
        }
        if let Some(user) = props.user {
            *self.shared.user.write().await = user;
        }
        if props.user.is_some() || props.mode.is_some() {
            let kind = match props.mode {
                Some(kind) => kind,
                None => self.cycling_mode().await,
            };
            self.set_cycling_mode(kind).await?;
        }

        let user = *self.shared.user.read().await;
        let init = self.shared.mode.lock().await.get_bike_init_request();
        let driver = self.shared.driver.clone();

        let first = run_with_retries(
            &format!("Starting {}", self.path()),
            self.params.retry_attempts,
            Duration::from_millis(self.params.retry_delay_ms),
            || {
                let driver = driver.clone();
                async move {
                    driver.connect().await?;
                    driver.initialize(&user, &init).await?;
                    driver.read_telemetry().await
                }
            },
        )
        .await?;

        let data = self.shared.mode.lock().await.update_data(&first);
        self.shared.store(&data).await;
        {
            let mut outbound = self.shared.outbound.lock().await;
            outbound.pending = None;
            outbound.last_queued = (!init.is_empty()).then_some(init);
        }

        self.start_loops().await;
        info!("Started {} on {}", self.protocol(), self.path());
        Ok(data)
    }

    async fn start_loops(&self) {
        let mut loops = self.loops.lock().await;
        if let Some(previous) = loops.take() {
            previous.cancel.cancel();
        }

        self.shared.paused.store(false, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let sync = tokio::spawn(self.shared.clone().sync_loop(cancel.clone()));
        let emit = tokio::spawn(self.shared.clone().emit_loop(cancel.clone()));
        *loops = Some(Loops {
            cancel,
            handles: vec![sync, emit],
        });
    }

    /// Stop the update loops and close the channel
    ///
    /// The channel is blocked first, so a tick still in progress fails fast
    /// instead of writing to the device. Waiting for the loops is bounded by
    /// `stop_timeout_ms`; loops still running after that are aborted.
    ///
    /// # Errors
    ///
    /// Returns the error from closing the channel.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping {}", self.path());
        let driver = &self.shared.driver;
        driver.set_blocked(true);

        let loops = self.loops.lock().await.take();
        if let Some(loops) = loops {
            loops.cancel.cancel();
            let aborts: Vec<_> = loops.handles.iter().map(JoinHandle::abort_handle).collect();
            let stop_timeout = self.shared.scheduler.stop_timeout_ms;
            if time::timeout(Duration::from_millis(stop_timeout), join_all(loops.handles))
                .await
                .is_err()
            {
                warn!(
                    "Update loops of {} did not stop within {}ms, aborting",
                    self.path(),
                    stop_timeout
                );
                aborts.iter().for_each(|handle| handle.abort());
            }
        }

        let closed = driver.disconnect().await;
        driver.set_blocked(false);
        self.shared.outbound.lock().await.pending = None;
        closed
    }

    /// Suspend both loops without closing the connection
    pub fn pause(&self) {
        info!("Pausing {}", self.path());
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Resume paused loops
    pub fn resume(&self) {
        info!("Resuming {}", self.path());
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Whether the loops are paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Hand a client request to the cycling mode and queue its command
    ///
    /// Never waits for the device. The returned command is what the next sync
    /// tick sends, unless a newer request supersedes it first.
    pub async fn send_update(&self, request: &ControlRequest) -> DeviceCommand {
        let command = self.shared.mode.lock().await.send_bike_update(request);

        let mut outbound = self.shared.outbound.lock().await;
        if request.reset {
            outbound.pending = None;
            outbound.last_queued = None;
        }
        if !command.is_empty() {
            outbound.queue(command);
        }
        command
    }

    /// Select a gear on devices with a shifter
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidArgument`] for devices without gears, or
    /// the comms error.
    pub async fn set_gear(&self, gear: u8) -> Result<()> {
        self.shared.driver.set_gear(gear).await
    }

    /// Kind of the active cycling mode
    pub async fn cycling_mode(&self) -> ModeKind {
        self.shared.mode.lock().await.kind()
    }

    /// Replace the active cycling mode with a fresh instance of `kind`
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidArgument`] if the device does not support
    /// `kind`.
    pub async fn set_cycling_mode(&self, kind: ModeKind) -> Result<()> {
        let driver = &self.shared.driver;
        if !driver.supported_modes().contains(&kind) {
            return Err(PedalError::InvalidArgument(format!(
                "{} does not support {} mode",
                driver.protocol(),
                kind
            )));
        }

        let user = *self.shared.user.read().await;
        *self.shared.mode.lock().await = kind.create(driver.mode_context(user));
        self.shared.outbound.lock().await.last_queued = None;
        info!("{} switched to {} mode", self.path(), kind);
        Ok(())
    }

    /// Active cycling mode and its settings
    pub async fn cycling_mode_info(&self) -> ModeInfo {
        ModeInfo::of(self.shared.mode.lock().await.as_ref())
    }

    /// Every cycling mode the device supports
    pub async fn supported_modes(&self) -> Vec<ModeInfo> {
        let driver = &self.shared.driver;
        let context = driver.mode_context(*self.shared.user.read().await);
        driver
            .supported_modes()
            .iter()
            .map(|kind| ModeInfo::of(kind.create(context).as_ref()))
            .collect()
    }

    /// Read a setting of the active mode
    pub async fn mode_setting(&self, key: &str) -> Option<SettingValue> {
        self.shared.mode.lock().await.get_setting(key)
    }

    /// Change a setting of the active mode
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidArgument`] for unknown keys or values
    /// outside the declared range.
    pub async fn set_mode_setting(&self, key: &str, value: SettingValue) -> Result<()> {
        self.shared.mode.lock().await.set_setting(key, value)
    }

    /// Output suppression flags
    pub async fn ignore_flags(&self) -> IgnoreFlags {
        *self.shared.ignore.read().await
    }

    /// Change output suppression; `ignore_bike` also holds back commands
    pub async fn set_ignore_flags(&self, flags: IgnoreFlags) {
        *self.shared.ignore.write().await = flags;
    }

    /// Snapshot of connection, loop and mode state
    pub async fn status(&self) -> AdapterStatus {
        AdapterStatus {
            state: self.shared.driver.connection_state(),
            running: self.loops.lock().await.is_some(),
            paused: self.is_paused(),
            mode: self.shared.mode.lock().await.name(),
            last_output: self.shared.latest.read().await.clone(),
        }
    }
}

impl Outbound {
    fn queue(&mut self, command: DeviceCommand) {
        if let Some(superseded) = self.pending.replace(command) {
            debug!(?superseded, "Dropping superseded command");
        }
        self.last_queued = Some(command);
    }
}

impl Shared {
    async fn store(&self, data: &BikeTelemetry) {
        let ignore = *self.ignore.read().await;
        *self.latest.write().await = Some(NormalizedOutput::from_telemetry(data, ignore));
    }

    async fn sync_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = time::interval(Duration::from_millis(self.scheduler.sync_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // start() already pulled the first sample
        interval.tick().await;

        let mut state = self.driver.subscribe();
        let mut watching = true;
        let mut lost = false;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                changed = state.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let current = *state.borrow_and_update();
                    match current {
                        ConnectionState::Disconnected | ConnectionState::Error if !lost => {
                            lost = true;
                            self.notify_disconnect(current).await;
                        }
                        ConnectionState::Connected => lost = false,
                        _ => {}
                    }
                }
                // ticks run inline, so two of them never overlap
                _ = interval.tick() => self.sync_tick(&cancel).await,
            }
        }
        debug!("Sync loop of {} stopped", self.driver.path());
    }

    async fn sync_tick(&self, cancel: &CancellationToken) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.bike_sync(cancel).await {
            warn!(device = self.driver.path(), "Sync failed: {}", e);
        }
    }

    async fn bike_sync(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.driver.connection_state().is_connected() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.reconnect().await?;
        }

        let ignore = *self.ignore.read().await;
        if !ignore.ignore_bike {
            let command = self.outbound.lock().await.pending.take();
            if let Some(command) = command {
                if let Err(e) = self.driver.apply(&command).await {
                    warn!(
                        device = self.driver.path(),
                        ?command,
                        "Sending command failed: {}",
                        e
                    );
                }
            }
        }

        let raw = self.driver.read_telemetry().await?;
        let data = self.mode.lock().await.update_data(&raw);
        self.store(&data).await;
        Ok(())
    }

    /// Open the channel again and replay the device initialization
    async fn reconnect(&self) -> Result<()> {
        let path = self.driver.path();
        info!("Reconnecting to {}", path);
        self.driver.connect().await?;

        let user = *self.user.read().await;
        let last_queued = self.outbound.lock().await.last_queued;
        let command = match last_queued {
            Some(command) => command,
            None => self.mode.lock().await.get_bike_init_request(),
        };
        if let Err(e) = self.driver.initialize(&user, &command).await {
            // leave the channel closed so the next tick initializes again
            if let Err(close) = self.driver.disconnect().await {
                debug!("{} close after failed init: {}", path, close);
            }
            return Err(e);
        }

        info!("Reconnected to {}", path);
        Ok(())
    }

    async fn emit_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = time::interval(Duration::from_millis(self.scheduler.emit_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                _ = interval.tick() => self.emit_tick().await,
            }
        }
        debug!("Emit loop of {} stopped", self.driver.path());
    }

    async fn emit_tick(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }

        let output = self.latest.read().await.clone();
        let callback = self.on_data.read().await.clone();
        if let (Some(output), Some(callback)) = (output, callback) {
            callback(&output);
        }

        let command = self
            .mode
            .lock()
            .await
            .send_bike_update(&ControlRequest::refresh());
        if command.is_empty() {
            return;
        }

        let mut outbound = self.outbound.lock().await;
        if command.differs_from(outbound.last_queued.as_ref()) {
            debug!(?command, "Queuing refreshed command for {}", self.driver.path());
            outbound.queue(command);
        }
    }

    async fn notify_disconnect(&self, state: ConnectionState) {
        warn!("{} went {}", self.driver.path(), state);
        let callback = self.on_disconnect.read().await.clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }
}

impl Drop for DeviceAdapter {
    fn drop(&mut self) {
        if let Some(loops) = self.loops.get_mut().take() {
            loops.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::test_support::pedalling;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    };
    use tokio::sync::watch;
    use tokio_test::{assert_err, assert_ok};

    struct FakeDriver {
        state: watch::Sender<ConnectionState>,
        telemetry: StdMutex<BikeTelemetry>,
        applied: StdMutex<Vec<DeviceCommand>>,
        connects: AtomicUsize,
        fail_connects: AtomicUsize,
        reads: AtomicUsize,
        hang_identify: AtomicBool,
        blocked: AtomicBool,
    }

    impl FakeDriver {
        fn new(telemetry: BikeTelemetry) -> Arc<Self> {
            Arc::new(Self {
                state: watch::channel(ConnectionState::Idle).0,
                telemetry: StdMutex::new(telemetry),
                applied: StdMutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                fail_connects: AtomicUsize::new(0),
                reads: AtomicUsize::new(0),
                hang_identify: AtomicBool::new(false),
                blocked: AtomicBool::new(false),
            })
        }

        fn applied(&self) -> Vec<DeviceCommand> {
            self.applied.lock().unwrap().clone()
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BikeDriver for FakeDriver {
        fn protocol(&self) -> Protocol {
            Protocol::Kettler
        }

        fn path(&self) -> &str {
            "fake"
        }

        fn supported_modes(&self) -> &'static [ModeKind] {
            &[ModeKind::Erg, ModeKind::SmartTrainer, ModeKind::PowerMeter]
        }

        fn default_mode(&self) -> ModeKind {
            ModeKind::Erg
        }

        fn power_range(&self) -> (f64, f64) {
            (25.0, 800.0)
        }

        fn connection_state(&self) -> ConnectionState {
            *self.state.borrow()
        }

        fn subscribe(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }

        fn set_blocked(&self, blocked: bool) {
            self.blocked.store(blocked, Ordering::SeqCst);
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let failing = self.fail_connects.load(Ordering::SeqCst);
            if failing > 0 {
                self.fail_connects.store(failing - 1, Ordering::SeqCst);
                return Err(PedalError::Timeout {
                    kind: TimeoutKind::Open,
                    timeout_ms: 100,
                });
            }
            self.state.send_replace(ConnectionState::Connected);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.state.send_replace(ConnectionState::Disconnected);
            Ok(())
        }

        async fn identify(&self) -> Result<DeviceInfo> {
            if self.hang_identify.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(DeviceInfo::new(
                "Fake".to_string(),
                Protocol::Kettler,
                "fake".to_string(),
            ))
        }

        async fn initialize(&self, _user: &UserSettings, command: &DeviceCommand) -> Result<()> {
            self.apply(command).await
        }

        async fn read_telemetry(&self) -> Result<BikeTelemetry> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.telemetry.lock().unwrap().clone())
        }

        async fn apply(&self, command: &DeviceCommand) -> Result<()> {
            if self.blocked.load(Ordering::SeqCst) {
                return Err(PedalError::Blocked);
            }
            if !command.is_empty() {
                self.applied.lock().unwrap().push(*command);
            }
            Ok(())
        }
    }

    fn adapter(driver: &Arc<FakeDriver>) -> DeviceAdapter {
        let params = ConnectionParams {
            retry_attempts: 3,
            retry_delay_ms: 100,
            ..ConnectionParams::default()
        };
        DeviceAdapter::with_config(
            driver.clone(),
            params,
            SchedulerConfig::default(),
            UserSettings::default(),
        )
    }

    async fn collect_outputs(adapter: &DeviceAdapter) -> Arc<StdMutex<Vec<NormalizedOutput>>> {
        let outputs = Arc::new(StdMutex::new(Vec::new()));
        let sink = outputs.clone();
        adapter
            .on_data(move |data| sink.lock().unwrap().push(data.clone()))
            .await;
        outputs
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retries_then_delivers_data() {
        let driver = FakeDriver::new(pedalling(90.0, 150.0, None));
        driver.fail_connects.store(2, Ordering::SeqCst);
        let adapter = adapter(&driver);
        let outputs = collect_outputs(&adapter).await;

        let first = assert_ok!(adapter.start(StartProps::default()).await);
        assert_eq!(first.power, 150.0);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 3);
        assert_eq!(driver.applied(), vec![DeviceCommand::power(50.0)]);

        time::sleep(Duration::from_millis(3_500)).await;
        assert!(driver.reads() >= 4);
        {
            let outputs = outputs.lock().unwrap();
            assert!(outputs.len() >= 3);
            assert_eq!(outputs.last().unwrap().power, Some(150));
        }
        assert!(adapter.status().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_gives_up_after_retries() {
        let driver = FakeDriver::new(BikeTelemetry::default());
        driver.fail_connects.store(10, Ordering::SeqCst);
        let adapter = adapter(&driver);

        let error = assert_err!(adapter.start(StartProps::default()).await);
        assert!(error.to_string().contains("after 3 attempts"));
        assert!(error.to_string().contains("open timeout"));
        assert_eq!(driver.connects.load(Ordering::SeqCst), 3);
        assert!(!adapter.status().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_requests_are_coalesced() {
        let driver = FakeDriver::new(pedalling(90.0, 150.0, None));
        let adapter = adapter(&driver);
        assert_ok!(adapter.start(StartProps::default()).await);

        for power in [150.0, 175.0, 200.0] {
            adapter
                .send_update(&ControlRequest::target_power(power))
                .await;
        }

        time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(
            driver.applied(),
            vec![DeviceCommand::power(50.0), DeviceCommand::power(200.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_suspends_both_loops() {
        let driver = FakeDriver::new(pedalling(90.0, 150.0, None));
        let adapter = adapter(&driver);
        let outputs = collect_outputs(&adapter).await;
        assert_ok!(adapter.start(StartProps::default()).await);

        adapter.pause();
        let delivered = outputs.lock().unwrap().len();
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(driver.reads(), 1);
        assert_eq!(outputs.lock().unwrap().len(), delivered);
        assert!(adapter.status().await.paused);

        adapter.resume();
        time::sleep(Duration::from_millis(1_100)).await;
        assert!(driver.reads() > 1);
        assert!(outputs.lock().unwrap().len() > delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignore_bike_strips_output_and_holds_commands() {
        let mut sample = pedalling(90.0, 150.0, None);
        sample.heartrate = Some(120.0);
        let driver = FakeDriver::new(sample);
        let adapter = adapter(&driver);

        let props = StartProps {
            ignore: Some(IgnoreFlags {
                ignore_bike: true,
                ..IgnoreFlags::default()
            }),
            ..StartProps::default()
        };
        assert_ok!(adapter.start(props).await);
        for step in 0..500_u32 {
            adapter
                .send_update(&ControlRequest::target_power(f64::from(step % 100 + 101)))
                .await;
        }

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(driver.applied(), vec![DeviceCommand::power(50.0)]);
        assert_eq!(
            adapter.shared.outbound.lock().await.pending,
            Some(DeviceCommand::power(200.0))
        );
        let output = adapter.status().await.last_output.unwrap();
        assert_eq!(output.speed, None);
        assert_eq!(output.power, None);
        assert_eq!(output.heartrate, Some(120));

        adapter.set_ignore_flags(IgnoreFlags::default()).await;
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            driver.applied(),
            vec![DeviceCommand::power(50.0), DeviceCommand::power(200.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_loop_pushes_mode_changes() {
        let driver = FakeDriver::new(pedalling(90.0, 120.0, Some(10)));
        let adapter = adapter(&driver);
        assert_ok!(adapter.start(StartProps::default()).await);

        time::sleep(Duration::from_millis(1_500)).await;
        let applied = driver.applied();
        assert_eq!(applied.len(), 2);
        let power = applied[1].target_power.unwrap();
        assert!((power - 278.0).abs() < 1.5, "got {power}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_is_bounded() {
        let driver = FakeDriver::new(BikeTelemetry::default());
        driver.hang_identify.store(true, Ordering::SeqCst);
        let adapter = adapter(&driver);

        let error = assert_err!(adapter.check().await);
        assert!(matches!(
            error,
            PedalError::Timeout {
                kind: TimeoutKind::Check,
                ..
            }
        ));
        assert_eq!(driver.connection_state(), ConnectionState::Disconnected);
        assert!(adapter.device_info().await.is_none());

        driver.hang_identify.store(false, Ordering::SeqCst);
        let device = assert_ok!(adapter.check().await);
        assert_eq!(device.name, "Fake");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_is_reported_and_reconnected() {
        let driver = FakeDriver::new(pedalling(90.0, 150.0, None));
        let adapter = adapter(&driver);
        let reported = Arc::new(StdMutex::new(Vec::new()));
        let sink = reported.clone();
        adapter
            .on_disconnect(move |state| sink.lock().unwrap().push(state))
            .await;
        assert_ok!(adapter.start(StartProps::default()).await);

        time::sleep(Duration::from_millis(10)).await;
        driver.fail_connects.store(2, Ordering::SeqCst);
        driver.state.send_replace(ConnectionState::Disconnected);
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*reported.lock().unwrap(), vec![ConnectionState::Disconnected]);

        let connects = driver.connects.load(Ordering::SeqCst);
        let reads = driver.reads();

        // two refused attempts, then the device answers on the third tick
        time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(driver.connects.load(Ordering::SeqCst), connects + 2);
        assert_eq!(driver.reads(), reads);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(driver.connects.load(Ordering::SeqCst), connects + 3);
        assert!(driver.reads() > reads);
        assert_eq!(driver.connection_state(), ConnectionState::Connected);
        assert_eq!(
            driver.applied(),
            vec![DeviceCommand::power(50.0), DeviceCommand::power(50.0)]
        );
        assert_eq!(reported.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_session() {
        let driver = FakeDriver::new(pedalling(90.0, 150.0, None));
        let adapter = adapter(&driver);
        assert_ok!(adapter.start(StartProps::default()).await);

        assert_ok!(adapter.stop().await);
        let status = adapter.status().await;
        assert!(!status.running);
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!driver.blocked.load(Ordering::SeqCst));

        let reads = driver.reads();
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(driver.reads(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_selection() {
        let driver = FakeDriver::new(BikeTelemetry::default());
        let adapter = adapter(&driver);
        assert_eq!(adapter.cycling_mode().await, ModeKind::Erg);

        assert!(matches!(
            adapter.set_cycling_mode(ModeKind::Classic).await,
            Err(PedalError::InvalidArgument(_))
        ));
        assert_ok!(adapter.set_cycling_mode(ModeKind::SmartTrainer).await);

        let info = adapter.cycling_mode_info().await;
        assert_eq!(info.name, "SmartTrainer");
        assert!(info.properties.iter().any(|p| p.key == "chainRings"));
        assert_eq!(adapter.supported_modes().await.len(), 3);

        assert_ok!(
            adapter
                .set_mode_setting("startPower", SettingValue::Number(120.0))
                .await
        );
        assert_eq!(
            adapter.mode_setting("startPower").await,
            Some(SettingValue::Number(120.0))
        );
        assert_err!(
            adapter
                .set_mode_setting("startPower", SettingValue::Number(5_000.0))
                .await
        );
    }
}
