//! Byte transports the comms channel runs on.
//!
//! A [`Transport`] knows how to open one path (a serial port, `host:port`,
//! ...). Opening yields a [`TransportLink`]: a writer half and a stream of
//! [`TransportEvent`]s carrying received bytes and close/error notifications.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PedalError, Result};

/// Capacity of the event channel between reader task and comms worker
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something that happened on an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived
    Data(Bytes),
    /// The remote end closed the link
    Closed,
    /// The link failed
    Error(String),
}

/// Writing half of an open transport
#[async_trait]
pub trait TransportWriter: Send {
    /// Write all of `data`
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Close the link; the event stream ends afterwards
    async fn close(&mut self) -> Result<()>;
}

/// An open transport
pub struct TransportLink {
    /// Outbound half
    pub writer: Box<dyn TransportWriter>,
    /// Inbound events
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLink").finish_non_exhaustive()
    }
}

/// Binding that opens one transport path
#[async_trait]
pub trait Transport: Send + Sync {
    /// Path identifying the port, used for the in-use registry
    fn path(&self) -> &str;

    /// Open the link
    async fn open(&self) -> Result<TransportLink>;
}

/// TCP binding, typically a serial-to-network bridge in front of the bike
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
    path: String,
}

impl TcpTransport {
    /// Create a binding for `host:port`
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let path = format!("{host}:{port}");
        Self { host, port, path }
    }

    /// Parse a `host:port` path
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::InvalidArgument`] if the path has no valid port.
    pub fn from_path(path: &str) -> Result<Self> {
        let (host, port) = path
            .rsplit_once(':')
            .ok_or_else(|| PedalError::InvalidArgument(format!("missing port in {path}")))?;
        let port = port
            .parse()
            .map_err(|e| PedalError::InvalidArgument(format!("invalid port in {path}: {e}")))?;
        if host.is_empty() {
            return Err(PedalError::InvalidArgument(format!("missing host in {path}")));
        }
        Ok(Self::new(host, port))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn path(&self) -> &str {
        &self.path
    }

    async fn open(&self) -> Result<TransportLink> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| PedalError::ConnectionFailed(format!("{}: {e}", self.path)))?;
        stream.set_nodelay(true)?;
        info!("Opened TCP link to {}", self.path);

        let (mut reader, writer) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let path = self.path.clone();

        tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(1024);
            loop {
                let read = tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    read = reader.read_buf(&mut buffer) => read,
                };

                let event = match read {
                    Ok(0) => TransportEvent::Closed,
                    Ok(_) => TransportEvent::Data(buffer.split().freeze()),
                    Err(e) => TransportEvent::Error(e.to_string()),
                };
                let done = !matches!(event, TransportEvent::Data(_));
                if events_tx.send(event).await.is_err() || done {
                    break;
                }
            }
            debug!("TCP reader for {} stopped", path);
        });

        Ok(TransportLink {
            writer: Box::new(TcpWriter { writer, cancel }),
            events: events_rx,
        })
    }
}

struct TcpWriter {
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
}

#[async_trait]
impl TransportWriter for TcpWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Registry of transport paths held open by a connection
///
/// Cloning shares the registry. Scanners consult it to skip ports that are
/// in use, and channels claim their path for as long as they are open.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl PortRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` until the returned guard is dropped
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::PortInUse`] if the path is already claimed.
    pub fn claim(&self, path: &str) -> Result<PortClaim> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.to_string()) {
            warn!("Port {} is already in use", path);
            return Err(PedalError::PortInUse(path.to_string()));
        }

        Ok(PortClaim {
            registry: self.clone(),
            path: path.to_string(),
        })
    }

    /// Whether `path` is currently claimed
    #[must_use]
    pub fn is_in_use(&self, path: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    /// All claimed paths, sorted
    #[must_use]
    pub fn in_use(&self) -> Vec<String> {
        let mut paths: Vec<_> = self
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    fn release(&self, path: &str) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }
}

/// Claim on a transport path, released on drop
#[derive(Debug)]
pub struct PortClaim {
    registry: PortRegistry,
    path: String,
}

impl PortClaim {
    /// Claimed path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport whose far end is driven by the test.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test side of a [`ScriptedTransport`]
    pub struct Peer {
        pub written: mpsc::UnboundedReceiver<Bytes>,
        pub events: mpsc::Sender<TransportEvent>,
    }

    impl Peer {
        pub async fn reply(&self, data: &[u8]) {
            self.events
                .send(TransportEvent::Data(Bytes::copy_from_slice(data)))
                .await
                .unwrap();
        }

        pub async fn next_write(&mut self) -> Bytes {
            self.written.recv().await.unwrap()
        }
    }

    pub struct ScriptedTransport {
        path: String,
        link: Mutex<Option<TransportLink>>,
        pub opens: AtomicUsize,
        pub fail_opens: AtomicUsize,
    }

    struct ScriptedWriter {
        written: mpsc::UnboundedSender<Bytes>,
    }

    #[async_trait]
    impl TransportWriter for ScriptedWriter {
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            self.written
                .send(Bytes::copy_from_slice(data))
                .map_err(|_| PedalError::Disconnected)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    impl ScriptedTransport {
        pub fn new(path: &str) -> (Arc<Self>, Peer) {
            let (written_tx, written_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let link = TransportLink {
                writer: Box::new(ScriptedWriter {
                    written: written_tx,
                }),
                events: events_rx,
            };

            let transport = Arc::new(Self {
                path: path.to_string(),
                link: Mutex::new(Some(link)),
                opens: AtomicUsize::new(0),
                fail_opens: AtomicUsize::new(0),
            });
            let peer = Peer {
                written: written_rx,
                events: events_tx,
            };
            (transport, peer)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn path(&self) -> &str {
            &self.path
        }

        async fn open(&self) -> Result<TransportLink> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let failing = self.fail_opens.load(Ordering::SeqCst);
            if failing > 0 {
                self.fail_opens.store(failing - 1, Ordering::SeqCst);
                return Err(PedalError::ConnectionFailed("scripted failure".into()));
            }
            self.link
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| PedalError::ConnectionFailed("already opened".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_port_claims_are_exclusive() {
        let registry = PortRegistry::new();
        let claim = registry.claim("/dev/ttyUSB0").unwrap();
        assert_eq!(claim.path(), "/dev/ttyUSB0");
        assert!(registry.is_in_use("/dev/ttyUSB0"));

        let second = registry.clone().claim("/dev/ttyUSB0");
        assert!(matches!(second, Err(PedalError::PortInUse(_))));

        drop(claim);
        assert!(!registry.is_in_use("/dev/ttyUSB0"));
        assert!(registry.claim("/dev/ttyUSB0").is_ok());
    }

    #[test]
    fn test_tcp_path_parsing() {
        let transport = TcpTransport::from_path("192.168.1.20:51955").unwrap();
        assert_eq!(transport.path(), "192.168.1.20:51955");
        assert!(TcpTransport::from_path("nohost").is_err());
        assert!(TcpTransport::from_path(":80").is_err());
        assert!(TcpTransport::from_path("host:http").is_err());
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ST\r\n");
            socket.write_all(b"ok\r\n").await.unwrap();
        });

        let transport = TcpTransport::new("127.0.0.1", port);
        let mut link = transport.open().await.unwrap();
        link.writer.write(b"ST\r\n").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            match link.events.recv().await.unwrap() {
                TransportEvent::Data(data) => received.extend_from_slice(&data),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(received, b"ok\r\n");

        server.await.unwrap();
        assert_eq!(link.events.recv().await, Some(TransportEvent::Closed));
        let _ = link.writer.close().await;
    }
}
