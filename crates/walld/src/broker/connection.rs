//! Per-client handler for the relay broker.
//!
//! Each client connection gets its own `BrokerConnection` that:
//! - Performs protocol version negotiation
//! - Queues `Publish` frames for the channel's subscribers and acks them
//! - Adds and removes the client from channel subscriber sets
//!
//! Everything written to the client, replies and fanned-out messages alike,
//! goes through one bounded outbound queue drained by a writer task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use wall_protocol::{
    decode_frame, encode_frame, BrokerMessage, ClientMessage, MessageType, ProtocolVersion,
    MAX_FRAME_SIZE,
};

use super::{fanout, remove_subscriber, ChannelMap};

/// Sending side of a client's outbound frame queue
pub type SubscriberQueue = mpsc::Sender<Arc<str>>;

/// Frames buffered per client before fan-out starts dropping for it
pub const OUTBOUND_BUFFER: usize = 1024;

/// Read timeout for clients with no subscriptions (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BrokerConnection {
    reader: BufReader<OwnedReadHalf>,

    /// Shared with the channel map for fan-out
    outbound: SubscriberQueue,

    channels: ChannelMap,

    /// Assigned after handshake
    client_id: Option<String>,

    /// Channels this client subscribes to
    subscriptions: HashSet<String>,

    connection_number: u64,
}

impl BrokerConnection {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        channels: ChannelMap,
        connection_number: u64,
    ) -> Self {
        let (outbound, frames) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(write_outbound(writer, frames, connection_number));

        Self {
            reader: BufReader::new(reader),
            outbound,
            channels,
            client_id: None,
            subscriptions: HashSet::new(),
            connection_number,
        }
    }

    /// Performs the handshake, then processes frames until the client
    /// leaves. Returns the client id if the handshake succeeded.
    pub async fn run(mut self) -> Option<String> {
        debug!(connection = self.connection_number, "New broker client");

        if let Err(e) = self.handle_handshake().await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            return None;
        }
        info!(client_id = ?self.client_id, "Broker client connected");

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        remove_subscriber(&self.channels, self.connection_number).await;
        info!(client_id = ?self.client_id, "Broker client disconnected");
        self.client_id
    }

    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(WRITE_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                broker_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(&BrokerMessage::rejected(&format!(
                "Protocol version {} not compatible with broker version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned.clone());
                self.send_message(&BrokerMessage::connected(assigned)).await
            }
            other => {
                self.send_message(&BrokerMessage::error("Expected Connect message for handshake"))
                    .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Subscribers are legitimately silent; only idle publishers time out.
            let read = if self.subscriptions.is_empty() {
                match timeout(READ_TIMEOUT, self.read_message()).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(client_id = ?self.client_id, "Connection timed out");
                        return Err(ConnectionError::Timeout);
                    }
                }
            } else {
                self.read_message().await
            };

            let msg = match read {
                Ok(msg) => msg,
                Err(ConnectionError::Eof) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Err(ConnectionError::ParseError(reason)) => {
                    // A malformed frame is the client's problem, not the link's.
                    self.send_message(&BrokerMessage::error_with_code(&reason, "parse_error"))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => {
                    error!(client_id = ?self.client_id, error = %e, "Error handling message");
                    let _ = self.send_message(&BrokerMessage::error(&e.to_string())).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(&BrokerMessage::error("Already connected"))
                    .await?;
            }

            MessageType::Publish {
                seq,
                channel,
                payload,
            } => {
                // Acked on receipt; subscribers' writers deliver on their own.
                let receivers = fanout(&self.channels, &channel, &payload).await;
                debug!(client_id = ?self.client_id, channel = %channel, seq, receivers, "Published");
                self.send_message(&BrokerMessage::ack(seq, receivers)).await?;
            }

            MessageType::Subscribe { channel } => {
                self.channels
                    .write()
                    .await
                    .entry(channel.clone())
                    .or_default()
                    .insert(self.connection_number, self.outbound.clone());
                self.subscriptions.insert(channel.clone());
                debug!(client_id = ?self.client_id, channel = %channel, "Client subscribed");
                self.send_message(&BrokerMessage::subscribed(channel)).await?;
            }

            MessageType::Unsubscribe { channel } => {
                let mut map = self.channels.write().await;
                if let Some(subscribers) = map.get_mut(&channel) {
                    subscribers.remove(&self.connection_number);
                    if subscribers.is_empty() {
                        map.remove(&channel);
                    }
                }
                drop(map);
                self.subscriptions.remove(&channel);
                debug!(client_id = ?self.client_id, channel = %channel, "Client unsubscribed");
            }

            MessageType::Ping { seq } => {
                self.send_message(&BrokerMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_FRAME_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        decode_frame(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))
    }

    async fn send_message(&self, msg: &BrokerMessage) -> Result<(), ConnectionError> {
        let frame = encode_frame(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        match timeout(WRITE_TIMEOUT, self.outbound.send(Arc::from(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Io("client writer closed".to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

/// Drains a client's outbound queue onto its socket. Stops at the first
/// failed or timed-out write, which closes the queue for every sender.
async fn write_outbound(
    writer: OwnedWriteHalf,
    mut frames: mpsc::Receiver<Arc<str>>,
    connection_number: u64,
) {
    let mut writer = BufWriter::new(writer);

    while let Some(frame) = frames.recv().await {
        let result = timeout(WRITE_TIMEOUT, async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = connection_number, error = %e, "Client write failed");
                return;
            }
            Err(_) => {
                warn!(connection = connection_number, "Client write timed out");
                return;
            }
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: MAX_FRAME_SIZE + 1,
            max: MAX_FRAME_SIZE,
        };
        assert!(err.to_string().contains("Message too large"));
    }
}
