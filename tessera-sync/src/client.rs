//! WebSocket client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Room membership and snapshot requests
//! - Operation submission with a per-client monotonic timestamp
//! - Presence signals
//!
//! Every server message is forwarded unchanged to the application through
//! the event receiver. `Welcome` is also consumed here to learn the
//! server-assigned connection id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::operation::{now_millis, Operation, OperationFrame};
use crate::presence::PresenceSignal;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::value::Value;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The sync client.
pub struct SyncClient {
    /// Attribution for operations and presence
    actor: String,

    server_url: String,

    state: Arc<RwLock<ConnectionState>>,

    /// Server-assigned id, known once `Welcome` arrives
    connection_id: Arc<RwLock<Option<Uuid>>>,

    /// Last timestamp handed out by [`SyncClient::operation`]
    last_timestamp: AtomicU64,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    event_rx: Option<mpsc::Receiver<ServerMessage>>,
    event_tx: mpsc::Sender<ServerMessage>,
}

impl SyncClient {
    pub fn new(actor: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            actor: actor.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: Arc::new(RwLock::new(None)),
            last_timestamp: AtomicU64::new(0),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.event_rx.take()
    }

    /// Connect to the server and identify as this client's actor.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode server messages and hand them to the application
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if let ServerMessage::Welcome { connection_id: id } = &server_msg {
                                *connection_id.write().await = Some(*id);
                            }
                            if event_tx.send(server_msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
        });

        *self.state.write().await = ConnectionState::Connected;
        self.send(&ClientMessage::Identify {
            actor: self.actor.clone(),
        })
        .await
    }

    /// Close the connection. Pending outgoing messages are flushed first.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Build an operation attributed to this client.
    ///
    /// Timestamps are wall-clock milliseconds but never repeat or go
    /// backwards within one client, so a client's own successive writes to
    /// a field always win over each other in submission order.
    pub fn operation(
        &self,
        entity_id: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Operation {
        Operation::new(entity_id, field, value, self.actor.clone(), self.next_timestamp())
    }

    fn next_timestamp(&self) -> u64 {
        let now = now_millis();
        let mut last = self.last_timestamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_timestamp.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    pub async fn join(&self, entity_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::JoinRoom {
            entity_id: entity_id.into(),
        })
        .await
    }

    pub async fn leave(&self, entity_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::LeaveRoom {
            entity_id: entity_id.into(),
        })
        .await
    }

    /// Submit an operation. The outcome arrives as `Ack` or `Rejected`.
    pub async fn submit(&self, op: &Operation) -> Result<(), ProtocolError> {
        self.submit_frame(op.to_frame()).await
    }

    /// Submit a raw frame, which the server validates.
    pub async fn submit_frame(&self, frame: OperationFrame) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Submit(frame)).await
    }

    pub async fn request_state(&self, entity_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::RequestState {
            entity_id: entity_id.into(),
        })
        .await
    }

    /// Send a presence signal. Silently dropped when offline.
    pub async fn send_presence(
        &self,
        entity_id: impl Into<String>,
        signal: PresenceSignal,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(&ClientMessage::Presence {
            entity_id: entity_id.into(),
            signal,
        })
        .await
    }

    /// Send an application-level ping; the server answers `Pong`.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let encoded = msg.encode()?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Server-assigned connection id, once the `Welcome` has been read.
    pub async fn connection_id(&self) -> Option<Uuid> {
        *self.connection_id.read().await
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
