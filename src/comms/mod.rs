//! Half-duplex command/response channel over a byte transport.
//!
//! A [`CommsChannel`] owns one transport and a background worker task. Callers
//! `send` requests; the worker queues them FIFO and dispatches one at a time
//! on a fixed tick, so whatever arrives next on the wire belongs to the
//! request in flight. Framing is delegated to a [`FrameCodec`].

pub mod classic;
pub mod kettler;
pub mod premium;

use bytes::BytesMut;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
    time::{interval, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{PedalError, Result, TimeoutKind},
    transport::{
        PortClaim, PortRegistry, Transport, TransportEvent, TransportLink, TransportWriter,
    },
    types::{ConnectionParams, ConnectionState, TimeoutConfig},
};

pub use classic::{ClassicCodec, ClassicRequest};
pub use kettler::KettlerCodec;
pub use premium::{PremiumCodec, PremiumFrame, PremiumRequest};

/// What a codec found in the receive buffer
#[derive(Debug)]
pub enum FrameEvent<R> {
    /// Positive acknowledgement of the last write
    Ack,
    /// Negative acknowledgement; the request should be written again
    Nak,
    /// Complete, valid response
    Response(R),
    /// Damaged frame; the peer is asked to send it again
    Corrupt(PedalError),
    /// Frame that cannot belong to the request in flight
    Illegal(PedalError),
}

/// Wire framing of one protocol flavour
pub trait FrameCodec: Send + 'static {
    /// Request handed to [`CommsChannel::send`]
    type Request: fmt::Debug + Send + 'static;
    /// Parsed response
    type Response: fmt::Debug + Send + 'static;

    /// Serialize `request` and remember what the response must look like
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidArgument`] for requests that cannot be framed.
    fn encode(&mut self, request: &Self::Request, dst: &mut BytesMut) -> Result<()>;

    /// Take the next event out of `src`, or `None` if more bytes are needed
    fn decode(&mut self, src: &mut BytesMut) -> Option<FrameEvent<Self::Response>>;

    /// Whether an ACK byte precedes each response
    fn expects_ack(&self) -> bool {
        false
    }

    /// Bytes written back after a valid response
    fn accept_reply(&self) -> Option<&'static [u8]> {
        None
    }

    /// Bytes written back after a corrupt response
    fn reject_reply(&self) -> Option<&'static [u8]> {
        None
    }
}

struct Job<C: FrameCodec> {
    request: C::Request,
    timeout_ms: Option<u64>,
    reply: oneshot::Sender<Result<C::Response>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingAck,
    AwaitingResponse,
}

struct Slot<C: FrameCodec> {
    job: Job<C>,
    frame: BytesMut,
    phase: Phase,
    deadline: Instant,
    retries_left: u32,
    started: Instant,
}

struct Session<C: FrameCodec> {
    jobs: mpsc::UnboundedSender<Job<C>>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    _claim: PortClaim,
}

/// Command/response engine for one transport
///
/// # Examples
///
/// ```no_run
/// use pedalers::{
///     comms::{CommsChannel, KettlerCodec},
///     transport::{PortRegistry, TcpTransport},
///     types::{ConnectionParams, Protocol, TimeoutConfig},
/// };
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let channel = CommsChannel::<KettlerCodec>::new(
///         Arc::new(TcpTransport::new("192.168.1.20", 51955)),
///         PortRegistry::new(),
///         ConnectionParams::for_protocol(Protocol::Kettler),
///         TimeoutConfig::kettler(),
///     );
///
///     channel.open().await?;
///     let status = channel.send("ST".to_string()).await?;
///     println!("{status}");
///     channel.close().await?;
///     Ok(())
/// }
/// ```
pub struct CommsChannel<C: FrameCodec> {
    transport: Arc<dyn Transport>,
    registry: PortRegistry,
    params: ConnectionParams,
    config: TimeoutConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    session: RwLock<Option<Session<C>>>,
    lifecycle: Mutex<()>,
    blocked: AtomicBool,
}

impl<C: FrameCodec + Default> CommsChannel<C> {
    /// Create a closed channel
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: PortRegistry,
        params: ConnectionParams,
        config: TimeoutConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            transport,
            registry,
            params,
            config,
            state: Arc::new(state),
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
            blocked: AtomicBool::new(false),
        }
    }

    /// Transport path
    #[must_use]
    pub fn path(&self) -> &str {
        self.transport.path()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes, including a transport closing on its own
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether commands can be sent
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Reject all traffic without touching the wire, e.g. during shutdown
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Whether the channel rejects traffic
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {} -> {}", self.path(), previous, state);
        }
    }

    /// Open the transport and start the worker
    ///
    /// Returns at once when already connected. Concurrent callers wait for
    /// the attempt in progress instead of opening the transport twice.
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::PortInUse`] if another channel holds the path,
    /// [`PedalError::Timeout`] with [`TimeoutKind::Open`] if the transport does
    /// not open in time, or the transport's own error.
    pub async fn open(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let stale = self.session.write().await.take();
        if let Some(stale) = stale {
            stale.cancel.cancel();
            let _ = stale.worker.await;
        }

        self.set_state(ConnectionState::Connecting);
        let claim = match self.registry.claim(self.path()) {
            Ok(claim) => claim,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let open_timeout = self.params.open_timeout_ms;
        let link = match timeout(Duration::from_millis(open_timeout), self.transport.open()).await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!("Opening {} failed: {}", self.path(), e);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                warn!("Opening {} timed out after {}ms", self.path(), open_timeout);
                self.set_state(ConnectionState::Disconnected);
                return Err(PedalError::timeout(TimeoutKind::Open, open_timeout));
            }
        };

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = Worker::<C>::new(
            self.path().to_string(),
            link,
            jobs_rx,
            cancel.clone(),
            Arc::clone(&self.state),
            self.config.clone(),
        );
        let worker = tokio::spawn(worker.run());

        *self.session.write().await = Some(Session {
            jobs: jobs_tx,
            cancel,
            worker,
            _claim: claim,
        });
        self.set_state(ConnectionState::Connected);
        info!("{} opened", self.path());
        Ok(())
    }

    /// Stop the worker, reject pending requests and close the transport
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::Timeout`] with [`TimeoutKind::Close`] if the
    /// worker does not finish within the close timeout; the port is released
    /// either way.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };

        self.set_state(ConnectionState::Disconnecting);
        session.cancel.cancel();

        let close_timeout = self.params.close_timeout_ms;
        let mut worker = session.worker;
        let result = match timeout(Duration::from_millis(close_timeout), &mut worker).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Closing {} timed out after {}ms", self.path(), close_timeout);
                worker.abort();
                Err(PedalError::timeout(TimeoutKind::Close, close_timeout))
            }
        };

        self.set_state(ConnectionState::Disconnected);
        info!("{} closed", self.path());
        result
    }

    /// Send a request with the flavour's default timeouts
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::Blocked`] or [`PedalError::NotConnected`] without
    /// touching the wire, [`PedalError::Timeout`] if the device does not
    /// answer in time, or a protocol error for damaged or foreign responses.
    pub async fn send(&self, request: C::Request) -> Result<C::Response> {
        self.dispatch(request, None).await
    }

    /// Send a request with a custom response timeout
    ///
    /// # Errors
    ///
    /// Same as [`CommsChannel::send`].
    pub async fn send_with_timeout(
        &self,
        request: C::Request,
        timeout_ms: u64,
    ) -> Result<C::Response> {
        self.dispatch(request, Some(timeout_ms)).await
    }

    async fn dispatch(&self, request: C::Request, timeout_ms: Option<u64>) -> Result<C::Response> {
        if self.is_blocked() {
            return Err(PedalError::Blocked);
        }
        if !self.is_connected() {
            return Err(PedalError::NotConnected);
        }

        let jobs = self
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.jobs.clone())
            .ok_or(PedalError::NotConnected)?;

        let (reply, response) = oneshot::channel();
        jobs.send(Job {
            request,
            timeout_ms,
            reply,
        })
        .map_err(|_| PedalError::NotConnected)?;

        response.await.map_err(|_| PedalError::Disconnected)?
    }
}

impl<C: FrameCodec> fmt::Debug for CommsChannel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommsChannel")
            .field("path", &self.transport.path())
            .field("state", &*self.state.borrow())
            .field("blocked", &self.blocked.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct Worker<C: FrameCodec> {
    path: String,
    codec: C,
    writer: Box<dyn TransportWriter>,
    events: mpsc::Receiver<TransportEvent>,
    jobs: mpsc::UnboundedReceiver<Job<C>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ConnectionState>>,
    config: TimeoutConfig,
    queue: VecDeque<Job<C>>,
    slot: Option<Slot<C>>,
    buffer: BytesMut,
}

impl<C: FrameCodec + Default> Worker<C> {
    fn new(
        path: String,
        link: TransportLink,
        jobs: mpsc::UnboundedReceiver<Job<C>>,
        cancel: CancellationToken,
        state: Arc<watch::Sender<ConnectionState>>,
        config: TimeoutConfig,
    ) -> Self {
        Self {
            path,
            codec: C::default(),
            writer: link.writer,
            events: link.events,
            jobs,
            cancel,
            state,
            config,
            queue: VecDeque::new(),
            slot: None,
            buffer: BytesMut::with_capacity(256),
        }
    }

    async fn run(mut self) {
        let mut tick = interval(Duration::from_millis(self.config.dispatch_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            let deadline = self.slot.as_ref().map(|slot| slot.deadline);

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break PedalError::Disconnected,

                event = self.events.recv() => match event {
                    Some(TransportEvent::Data(data)) => {
                        debug!("{} <- {:02X?}", self.path, &data[..]);
                        self.buffer.extend_from_slice(&data);
                        self.process().await;
                    }
                    Some(TransportEvent::Closed) | None => {
                        warn!("{} closed by peer", self.path);
                        self.state.send_replace(ConnectionState::Disconnected);
                        break PedalError::Disconnected;
                    }
                    Some(TransportEvent::Error(e)) => {
                        error!("{} failed: {}", self.path, e);
                        self.state.send_replace(ConnectionState::Error);
                        break PedalError::ConnectionFailed(e);
                    }
                },

                job = self.jobs.recv() => match job {
                    Some(job) => self.queue.push_back(job),
                    None => break PedalError::Disconnected,
                },

                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire();
                }

                _ = tick.tick() => {
                    if self.slot.is_none() {
                        self.dispatch_next().await;
                    }
                }
            }
        };

        self.shutdown(&exit).await;
    }

    async fn dispatch_next(&mut self) {
        while let Some(job) = self.queue.pop_front() {
            if job.reply.is_closed() {
                continue;
            }

            let mut frame = BytesMut::new();
            if let Err(e) = self.codec.encode(&job.request, &mut frame) {
                let _ = job.reply.send(Err(e));
                continue;
            }

            self.buffer.clear();
            debug!("{} -> {:02X?} ({:?})", self.path, &frame[..], job.request);
            if let Err(e) = self.writer.write(&frame).await {
                warn!("{} write failed: {}", self.path, e);
                let _ = job.reply.send(Err(e));
                continue;
            }

            let now = Instant::now();
            let (phase, wait_ms) = if self.codec.expects_ack() {
                (Phase::AwaitingAck, self.config.ack_timeout_ms)
            } else {
                (
                    Phase::AwaitingResponse,
                    job.timeout_ms.unwrap_or(self.config.response_timeout_ms),
                )
            };

            self.slot = Some(Slot {
                job,
                frame,
                phase,
                deadline: now + Duration::from_millis(wait_ms),
                retries_left: self.config.max_nak_retries,
                started: now,
            });
            return;
        }
    }

    fn response_deadline(&self, job: &Job<C>) -> Instant {
        Instant::now()
            + Duration::from_millis(job.timeout_ms.unwrap_or(self.config.response_timeout_ms))
    }

    async fn process(&mut self) {
        while let Some(event) = self.codec.decode(&mut self.buffer) {
            let Some(mut slot) = self.slot.take() else {
                debug!("{} dropping unsolicited {:?}", self.path, event);
                self.buffer.clear();
                return;
            };

            match event {
                FrameEvent::Ack => {
                    if slot.phase == Phase::AwaitingAck {
                        slot.phase = Phase::AwaitingResponse;
                        slot.deadline = self.response_deadline(&slot.job);
                    }
                    self.slot = Some(slot);
                }
                FrameEvent::Nak => {
                    if slot.retries_left == 0 {
                        Self::finish(
                            slot,
                            Err(PedalError::IllegalResponse("NAK received".to_string())),
                        );
                        continue;
                    }
                    slot.retries_left -= 1;
                    debug!("{} NAK, resending ({} retries left)", self.path, slot.retries_left);
                    if let Err(e) = self.writer.write(&slot.frame).await {
                        Self::finish(slot, Err(e));
                        continue;
                    }
                    slot.phase = Phase::AwaitingAck;
                    slot.deadline =
                        Instant::now() + Duration::from_millis(self.config.ack_timeout_ms);
                    self.slot = Some(slot);
                }
                FrameEvent::Response(response) => {
                    if let Some(reply) = self.codec.accept_reply() {
                        if let Err(e) = self.writer.write(reply).await {
                            warn!("{} failed to acknowledge response: {}", self.path, e);
                        }
                    }
                    self.buffer.clear();
                    Self::finish(slot, Ok(response));
                }
                FrameEvent::Corrupt(e) => {
                    warn!("{} corrupt response: {}", self.path, e);
                    if let Some(reply) = self.codec.reject_reply() {
                        if let Err(e) = self.writer.write(reply).await {
                            warn!("{} failed to reject response: {}", self.path, e);
                        }
                    }
                    if slot.retries_left == 0 {
                        Self::finish(slot, Err(PedalError::IllegalResponse(e.to_string())));
                        continue;
                    }
                    slot.retries_left -= 1;
                    slot.phase = Phase::AwaitingResponse;
                    slot.deadline = self.response_deadline(&slot.job);
                    self.slot = Some(slot);
                }
                FrameEvent::Illegal(e) => {
                    warn!("{} illegal response: {}", self.path, e);
                    self.buffer.clear();
                    Self::finish(slot, Err(e));
                }
            }
        }
    }

    fn expire(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        let (kind, waited) = match slot.phase {
            Phase::AwaitingAck => (TimeoutKind::Ack, self.config.ack_timeout_ms),
            Phase::AwaitingResponse => (
                TimeoutKind::Response,
                slot.job.timeout_ms.unwrap_or(self.config.response_timeout_ms),
            ),
        };
        warn!("{} {:?}: {} timeout", self.path, slot.job.request, kind);
        self.buffer.clear();
        Self::finish(slot, Err(PedalError::timeout(kind, waited)));
    }

    fn finish(slot: Slot<C>, result: Result<C::Response>) {
        debug!(
            "request {:?} done after {:?}",
            slot.job.request,
            slot.started.elapsed()
        );
        let _ = slot.job.reply.send(result);
    }

    async fn shutdown(mut self, reason: &PedalError) {
        let rejected = usize::from(self.slot.is_some()) + self.queue.len();
        if rejected > 0 {
            info!("{} rejecting {} pending request(s): {}", self.path, rejected, reason);
        }

        let reject = || match reason {
            PedalError::ConnectionFailed(e) => PedalError::ConnectionFailed(e.clone()),
            _ => PedalError::Disconnected,
        };
        if let Some(slot) = self.slot.take() {
            let _ = slot.job.reply.send(Err(reject()));
        }
        for job in self.queue.drain(..) {
            let _ = job.reply.send(Err(reject()));
        }
        self.jobs.close();
        while let Ok(job) = self.jobs.try_recv() {
            let _ = job.reply.send(Err(reject()));
        }

        if let Err(e) = self.writer.close().await {
            debug!("{} close: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{Peer, ScriptedTransport};
    use tokio_test::{assert_err, assert_ok};

    fn classic_channel(path: &str) -> (Arc<CommsChannel<ClassicCodec>>, Peer, PortRegistry) {
        let (transport, peer) = ScriptedTransport::new(path);
        let registry = PortRegistry::new();
        let channel = CommsChannel::new(
            transport,
            registry.clone(),
            ConnectionParams::default(),
            TimeoutConfig::classic(),
        );
        (Arc::new(channel), peer, registry)
    }

    fn premium_channel() -> (Arc<CommsChannel<PremiumCodec>>, Peer) {
        let (transport, peer) = ScriptedTransport::new("premium");
        let channel = CommsChannel::new(
            transport,
            PortRegistry::new(),
            ConnectionParams::default(),
            TimeoutConfig::premium(),
        );
        (Arc::new(channel), peer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let (channel, _peer, _) = classic_channel("tty0");
        assert!(matches!(
            channel.send(ClassicRequest::new(vec![0x11], 2)).await,
            Err(PedalError::NotConnected)
        ));

        assert_ok!(channel.open().await);
        channel.set_blocked(true);
        assert!(matches!(
            channel.send(ClassicRequest::new(vec![0x11], 2)).await,
            Err(PedalError::Blocked)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_is_idempotent_and_claims_port() {
        let (channel, _peer, registry) = classic_channel("tty1");
        let (a, b) = tokio::join!(channel.open(), channel.open());
        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(channel.state(), ConnectionState::Connected);
        assert!(registry.is_in_use("tty1"));

        let other = CommsChannel::<ClassicCodec>::new(
            ScriptedTransport::new("tty1").0,
            registry.clone(),
            ConnectionParams::default(),
            TimeoutConfig::classic(),
        );
        assert!(matches!(other.open().await, Err(PedalError::PortInUse(_))));
        drop(other);

        assert_ok!(channel.close().await);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(!registry.is_in_use("tty1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_request_in_flight() {
        let (channel, mut peer, _) = classic_channel("tty2");
        channel.open().await.unwrap();

        let first = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(ClassicRequest::new(vec![0x11], 2)).await }
        });
        let second = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(ClassicRequest::new(vec![0x73, 0x00], 3)).await }
        });

        assert_eq!(&peer.next_write().await[..], &[0x11]);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(peer.written.try_recv().is_err());

        peer.reply(&[0x11, 0x05]).await;
        assert_eq!(&first.await.unwrap().unwrap()[..], &[0x11, 0x05]);

        assert_eq!(&peer.next_write().await[..], &[0x73, 0x00]);
        peer.reply(&[0x73]).await;
        peer.reply(&[0x00, 0x2A]).await;
        assert_eq!(&second.await.unwrap().unwrap()[..], &[0x73, 0x00, 0x2A]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_frees_slot() {
        let (channel, mut peer, _) = classic_channel("tty3");
        channel.open().await.unwrap();

        let err = channel
            .send(ClassicRequest::new(vec![0x40, 0x00], 19))
            .await
            .unwrap_err();
        assert!(err.is_timeout(Some(TimeoutKind::Response)));
        peer.next_write().await;

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(ClassicRequest::new(vec![0x11], 2)).await }
        });
        assert_eq!(&peer.next_write().await[..], &[0x11]);
        peer.reply(&[0x11, 0x00]).await;
        assert_ok!(pending.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opcode_mismatch_is_illegal() {
        let (channel, mut peer, _) = classic_channel("tty4");
        channel.open().await.unwrap();

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(ClassicRequest::new(vec![0x10, 0x00], 3)).await }
        });
        peer.next_write().await;
        peer.reply(&[0x40, 0x00, 0x01]).await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, PedalError::IllegalResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checksum_error_waits_for_retransmission() {
        let (channel, mut peer) = premium_channel();
        channel.open().await.unwrap();

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(PremiumRequest::new(*b"V00", Vec::new())).await }
        });
        let written = peer.next_write().await;
        assert_eq!(&written[..], &premium::build_frame(*b"V00", &[])[..]);

        let mut corrupt = premium::build_frame(*b"V00", b"201").to_vec();
        let len = corrupt.len();
        corrupt[len - 2] = b'0' + (corrupt[len - 2] - b'0' + 1) % 10;
        peer.reply(&[premium::ACK]).await;
        peer.reply(&corrupt).await;

        assert_eq!(&peer.next_write().await[..], &[premium::NAK]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pending.is_finished());

        peer.reply(&premium::build_frame(*b"V00", b"201")).await;
        assert_eq!(&peer.next_write().await[..], &[premium::ACK]);

        let frame = pending.await.unwrap().unwrap();
        assert_eq!(&frame.command, b"V00");
        assert_eq!(&frame.payload[..], b"201");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out() {
        let (channel, _peer) = premium_channel();
        channel.open().await.unwrap();

        let err = assert_err!(channel.send(PremiumRequest::new(*b"Y00", Vec::new())).await);
        assert!(err.is_timeout(Some(TimeoutKind::Ack)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_triggers_resend() {
        let (channel, mut peer) = premium_channel();
        channel.open().await.unwrap();

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(PremiumRequest::new(*b"Y00", Vec::new())).await }
        });
        let first = peer.next_write().await;
        peer.reply(&[premium::NAK]).await;
        assert_eq!(peer.next_write().await, first);

        peer.reply(&[premium::ACK]).await;
        peer.reply(&premium::build_frame(*b"Y00", b"0")).await;
        assert_ok!(pending.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_pending_requests() {
        let (channel, mut peer, _) = classic_channel("tty5");
        channel.open().await.unwrap();

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send(ClassicRequest::new(vec![0x40, 0x00], 19)).await }
        });
        peer.next_write().await;

        assert_ok!(channel.close().await);
        assert!(matches!(
            pending.await.unwrap(),
            Err(PedalError::Disconnected)
        ));
        assert!(matches!(
            channel.send(ClassicRequest::new(vec![0x11], 2)).await,
            Err(PedalError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_marks_disconnected() {
        let (channel, peer, registry) = classic_channel("tty6");
        let mut state = channel.subscribe();
        channel.open().await.unwrap();

        peer.events.send(TransportEvent::Closed).await.unwrap();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(!channel.is_connected());

        assert_ok!(channel.close().await);
        assert!(!registry.is_in_use("tty6"));
    }
}
