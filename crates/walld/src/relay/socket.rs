//! Relay client for the standalone broker (`walld broker`).
//!
//! Publishing shares one lazily-opened connection. Publishes are pipelined:
//! frames are written one at a time under a write lock, and a reader task
//! matches each `Ack{seq}` to the publish waiting on it, so any number of
//! publishes can be in flight on the link. Every subscription opens its own
//! connection, which is closed when the subscription is dropped.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` outside tests
//! - A failed link is discarded and reopened on the next call

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use wall_protocol::{decode_frame, encode_frame, BrokerMessage, ClientMessage, ProtocolVersion};

use super::{Relay, RelayError, RelayMessage, RelaySubscription};

/// Upper bound on connect, handshake and publish round trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Line-oriented reader for broker frames.
struct FrameReader {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl FrameReader {
    async fn recv(&mut self) -> Result<BrokerMessage, RelayError> {
        self.line.clear();
        let bytes_read = self
            .reader
            .read_line(&mut self.line)
            .await
            .map_err(|e| RelayError::Io(e.to_string()))?;
        if bytes_read == 0 {
            return Err(RelayError::Closed);
        }
        decode_frame(&self.line).map_err(|e| RelayError::Protocol(e.to_string()))
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, msg: &ClientMessage) -> Result<(), RelayError> {
    let frame = encode_frame(msg).map_err(|e| RelayError::Protocol(e.to_string()))?;
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| RelayError::Io(e.to_string()))?;
    writer.flush().await.map_err(|e| RelayError::Io(e.to_string()))
}

/// One handshaken connection to the broker.
struct BrokerLink {
    frames: FrameReader,
    writer: OwnedWriteHalf,
}

impl BrokerLink {
    async fn open(socket_path: &Path, client_id: String) -> Result<Self, RelayError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            RelayError::Unavailable(format!("{}: {e}", socket_path.display()))
        })?;
        let (reader, writer) = stream.into_split();
        let mut link = Self {
            frames: FrameReader {
                reader: BufReader::new(reader),
                line: String::new(),
            },
            writer,
        };

        link.send(&ClientMessage::connect(Some(client_id))).await?;
        match link.recv().await? {
            BrokerMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(RelayError::Protocol(format!(
                        "broker speaks {protocol_version}, we speak {}",
                        ProtocolVersion::CURRENT
                    )));
                }
                debug!(client_id, "Broker handshake complete");
                Ok(link)
            }
            BrokerMessage::Rejected { reason, .. } => Err(RelayError::Protocol(reason)),
            other => Err(RelayError::Protocol(format!(
                "unexpected response to connect: {other:?}"
            ))),
        }
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), RelayError> {
        write_frame(&mut self.writer, msg).await
    }

    async fn recv(&mut self) -> Result<BrokerMessage, RelayError> {
        self.frames.recv().await
    }
}

// ============================================================================
// Publisher link
// ============================================================================

/// Publishes waiting for their ack, keyed by sequence number.
type PendingAcks = parking_lot::Mutex<HashMap<u64, oneshot::Sender<usize>>>;

/// The shared publishing connection.
struct PublishLink {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<PendingAcks>,
    alive: Arc<AtomicBool>,
    ack_reader: JoinHandle<()>,
}

impl PublishLink {
    fn new(link: BrokerLink) -> Self {
        let BrokerLink { frames, writer } = link;
        let pending = Arc::new(PendingAcks::default());
        let alive = Arc::new(AtomicBool::new(true));
        let ack_reader = tokio::spawn(route_acks(
            frames,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));
        Self {
            writer: Mutex::new(writer),
            pending,
            alive,
            ack_reader,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Sends one publish and waits for its ack. Returns the receiver count
    /// the broker reported.
    async fn publish(&self, seq: u64, msg: &ClientMessage) -> Result<usize, RelayError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().insert(seq, ack_tx);
        // The ack reader marks the link dead before it clears `pending`.
        if !self.is_alive() {
            self.pending.lock().remove(&seq);
            return Err(RelayError::Closed);
        }

        let result = async {
            write_frame(&mut *self.writer.lock().await, msg).await?;
            ack_rx.await.map_err(|_| RelayError::Closed)
        }
        .await;

        if result.is_err() {
            self.pending.lock().remove(&seq);
        }
        result
    }
}

impl Drop for PublishLink {
    fn drop(&mut self) {
        self.ack_reader.abort();
    }
}

/// Reads acks until the link fails, then fails every waiting publish.
async fn route_acks(mut frames: FrameReader, pending: Arc<PendingAcks>, alive: Arc<AtomicBool>) {
    loop {
        match frames.recv().await {
            Ok(BrokerMessage::Ack { seq, receivers }) => {
                match pending.lock().remove(&seq) {
                    Some(waiter) => {
                        let _ = waiter.send(receivers);
                    }
                    None => debug!(seq, "Ack for a publish nobody is waiting on"),
                }
            }
            Ok(BrokerMessage::Error { message, .. }) => {
                warn!(error = %message, "Broker reported an error on the publish link");
            }
            Ok(other) => debug!(?other, "Ignoring broker frame on publish link"),
            Err(e) => {
                debug!(error = %e, "Publish link closed");
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with an error.
    pending.lock().clear();
}

// ============================================================================
// Relay
// ============================================================================

/// Relay that talks to a broker over a Unix socket.
pub struct SocketRelay {
    socket_path: PathBuf,
    publisher: Mutex<Option<Arc<PublishLink>>>,
    seq: AtomicU64,
    links_opened: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl SocketRelay {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            publisher: Mutex::new(None),
            seq: AtomicU64::new(0),
            links_opened: AtomicU64::new(0),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn next_client_id(&self, role: &str) -> String {
        let n = self.links_opened.fetch_add(1, Ordering::Relaxed);
        format!("walld-{}-{role}-{n}", std::process::id())
    }

    async fn open_link(&self, role: &str) -> Result<BrokerLink, RelayError> {
        let client_id = self.next_client_id(role);
        let opening = BrokerLink::open(&self.socket_path, client_id);
        let result = match timeout(REQUEST_TIMEOUT, opening).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Unavailable("broker handshake timed out".to_string())),
        };
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    /// The live publish link, opened if there is none. The lock is held only
    /// while looking up or opening the link, never across a publish.
    async fn publish_link(&self) -> Result<Arc<PublishLink>, RelayError> {
        let mut current = self.publisher.lock().await;
        if let Some(link) = current.as_ref().filter(|link| link.is_alive()) {
            return Ok(Arc::clone(link));
        }

        let link = Arc::new(PublishLink::new(self.open_link("pub").await?));
        *current = Some(Arc::clone(&link));
        Ok(link)
    }

    /// Drops `failed` if it is still the current link.
    async fn discard(&self, failed: &Arc<PublishLink>) {
        let mut current = self.publisher.lock().await;
        if current.as_ref().is_some_and(|link| Arc::ptr_eq(link, failed)) {
            *current = None;
        }
    }
}

#[async_trait]
impl Relay for SocketRelay {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), RelayError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let msg = ClientMessage::publish(seq, channel, payload);

        let link = self
            .publish_link()
            .await
            .map_err(|e| RelayError::Publish(e.to_string()))?;

        let outcome = match timeout(REQUEST_TIMEOUT, link.publish(seq, &msg)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Publish(format!("no ack for seq {seq}"))),
        };

        match outcome {
            Ok(receivers) => {
                debug!(channel, seq, receivers, "Published to broker");
                Ok(())
            }
            Err(e) => {
                // A timed-out write may have left half a frame on the link.
                self.discard(&link).await;
                self.connected.store(false, Ordering::SeqCst);
                warn!(channel, seq, error = %e, "Publish to broker failed");
                Err(match e {
                    RelayError::Publish(_) => e,
                    other => RelayError::Publish(other.to_string()),
                })
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, RelayError> {
        let mut link = self
            .open_link("sub")
            .await
            .map_err(|e| RelayError::Subscribe(e.to_string()))?;

        link.send(&ClientMessage::subscribe(channel))
            .await
            .map_err(|e| RelayError::Subscribe(e.to_string()))?;
        let confirmed: Result<(), RelayError> = timeout(REQUEST_TIMEOUT, async {
            loop {
                match link.recv().await? {
                    BrokerMessage::Subscribed { channel: ch } if ch == channel => return Ok(()),
                    BrokerMessage::Error { message, .. } => return Err(RelayError::Subscribe(message)),
                    other => debug!(?other, "Ignoring broker frame while awaiting subscription"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| Err(RelayError::Subscribe("no subscription confirmation".to_string())));

        if let Err(e) = confirmed {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(channel, socket = %self.socket_path.display(), "Subscribed via broker");

        let connected = Arc::clone(&self.connected);
        let stream = futures::stream::unfold(Some(link), move |state| {
            let connected = Arc::clone(&connected);
            async move {
                let mut link = state?;
                loop {
                    match link.recv().await {
                        Ok(BrokerMessage::Message { channel, payload }) => {
                            return Some((Ok(RelayMessage { channel, payload }), Some(link)));
                        }
                        Ok(BrokerMessage::Error { message, .. }) => {
                            return Some((Err(RelayError::Protocol(message)), Some(link)));
                        }
                        Ok(other) => debug!(?other, "Ignoring broker frame on subscription"),
                        Err(e) => {
                            connected.store(false, Ordering::SeqCst);
                            // Emit the failure once, then end the stream.
                            return Some((Err(e), None));
                        }
                    }
                }
            }
        });

        Ok(RelaySubscription::new(channel, stream.boxed()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_broker_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let relay = SocketRelay::new(dir.path().join("absent.sock"));

        let err = relay.publish("photos", "{}".to_string()).await.unwrap_err();
        assert!(matches!(err, RelayError::Publish(_)));
        assert!(!relay.is_connected());

        let err = relay.subscribe("photos").await.unwrap_err();
        assert!(matches!(err, RelayError::Subscribe(_)));
    }

    use tokio::net::UnixListener;
    use wall_protocol::MessageType;

    /// Accepts one client, completes the handshake and hands back the link.
    async fn accept_client(listener: &UnixListener) -> (FrameLines, OwnedWriteHalf) {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = FrameLines(BufReader::new(reader));

        let client_id = match lines.next().await.message {
            MessageType::Connect { client_id } => client_id,
            other => panic!("expected connect, got {other:?}"),
        };
        let reply = encode_frame(&BrokerMessage::connected(client_id.unwrap_or_default())).unwrap();
        writer.write_all(reply.as_bytes()).await.unwrap();
        (lines, writer)
    }

    struct FrameLines(BufReader<OwnedReadHalf>);

    impl FrameLines {
        async fn next(&mut self) -> ClientMessage {
            let mut line = String::new();
            self.0.read_line(&mut line).await.unwrap();
            decode_frame(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_publishes_share_the_link_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let listener = UnixListener::bind(&path).unwrap();

        // Reads both publishes before acking either, then acks newest first.
        let broker = tokio::spawn(async move {
            let (mut lines, mut writer) = accept_client(&listener).await;
            let mut seqs = Vec::new();
            for _ in 0..2 {
                match lines.next().await.message {
                    MessageType::Publish { seq, .. } => seqs.push(seq),
                    other => panic!("expected publish, got {other:?}"),
                }
            }
            for seq in seqs.iter().rev() {
                let ack = encode_frame(&BrokerMessage::ack(*seq, 1)).unwrap();
                writer.write_all(ack.as_bytes()).await.unwrap();
            }
            seqs
        });

        let relay = SocketRelay::new(&path);
        let (first, second) = timeout(Duration::from_secs(2), async {
            tokio::join!(
                relay.publish("photos", "one".to_string()),
                relay.publish("photos", "two".to_string())
            )
        })
        .await
        .expect("publishes were serialized behind each other's ack");
        first.unwrap();
        second.unwrap();

        let mut seqs = broker.await.unwrap();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![0, 1]);
        assert!(relay.is_connected());
    }

    #[tokio::test]
    async fn test_closed_link_fails_publish_and_is_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let broker = tokio::spawn(async move {
            // First client: handshake, read the publish, hang up.
            let (mut lines, writer) = accept_client(&listener).await;
            lines.next().await;
            drop((lines, writer));

            // Second client: ack normally.
            let (mut lines, mut writer) = accept_client(&listener).await;
            let MessageType::Publish { seq, .. } = lines.next().await.message else {
                panic!("expected publish");
            };
            let ack = encode_frame(&BrokerMessage::ack(seq, 0)).unwrap();
            writer.write_all(ack.as_bytes()).await.unwrap();
        });

        let relay = SocketRelay::new(&path);
        // Fails as soon as the link drops, well inside the request timeout.
        let err = timeout(Duration::from_secs(2), relay.publish("photos", "lost".to_string()))
            .await
            .expect("publish hung on a closed link")
            .unwrap_err();
        assert!(matches!(err, RelayError::Publish(_)));
        assert!(!relay.is_connected());

        relay.publish("photos", "again".to_string()).await.unwrap();
        assert!(relay.is_connected());
        broker.await.unwrap();
    }
}
