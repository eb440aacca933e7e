//! TCP client for connecting to an authority.
//!
//! [`NetClient::connect`] opens the socket, waits for the `AssignId`
//! greeting, and then runs the connection like any other: decoded messages
//! land on an inbound queue that the mirror drains on its own schedule.
//! State changes are broadcast via a [`watch`] channel so any number of
//! consumers can react without polling.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::connection::{LinkClosed, NetEvent, Outbound, spawn_connection};
use crate::framing::{FrameConfig, FrameError, read_frame};
use crate::ids::ConnectionId;
use crate::messages::{Message, MessageError, PROTOCOL_VERSION};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening the socket or waiting for the greeting.
    Connecting,
    /// Handshake finished, messages flow both ways.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Configuration for [`NetClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the authority.
    pub server_addr: String,
    /// Upper bound on socket connect plus handshake.
    pub connect_timeout: Duration,
    pub frame: FrameConfig,
    pub inbound_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".to_owned(),
            connect_timeout: Duration::from_secs(5),
            frame: FrameConfig::default(),
            inbound_queue_capacity: 1024,
        }
    }
}

/// Why a connection attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no handshake within {0:?}")]
    Timeout(Duration),

    /// The first message was not a connection-id assignment.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol version mismatch: local {local}, server {remote}")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("framing error during handshake: {0}")]
    Frame(#[from] FrameError),

    #[error("malformed handshake message: {0}")]
    Message(#[from] MessageError),
}

/// Handle to a connected authority session.
pub struct NetClient {
    connection_id: ConnectionId,
    outbound: Outbound,
    events: mpsc::Receiver<NetEvent>,
    state: Arc<ConnectionStateWatch>,
}

impl NetClient {
    /// Connect to the configured server and complete the handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ConnectError> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let attempt = async {
            let stream = TcpStream::connect(config.server_addr.as_str()).await?;
            stream.set_nodelay(true)?;
            Self::handshake(stream, config, Arc::clone(&state)).await
        };

        let result = match tokio::time::timeout(config.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(config.connect_timeout)),
        };
        if result.is_err() {
            state.set(ConnectionState::Disconnected);
        }
        result
    }

    /// Run the handshake over any byte stream and start the connection tasks.
    pub async fn over_stream<S>(stream: S, config: &ClientConfig) -> Result<Self, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);
        let result = Self::handshake(stream, config, Arc::clone(&state)).await;
        if result.is_err() {
            state.set(ConnectionState::Disconnected);
        }
        result
    }

    async fn handshake<S>(
        stream: S,
        config: &ClientConfig,
        state: Arc<ConnectionStateWatch>,
    ) -> Result<Self, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);

        let greeting = loop {
            let frame = read_frame(&mut reader, &config.frame).await?;
            if !frame.is_empty() {
                break Message::decode(&frame)?;
            }
        };
        let connection_id = match greeting {
            Message::AssignId {
                protocol_version,
                connection_id,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ConnectError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                connection_id
            }
            other => {
                return Err(ConnectError::Handshake(format!(
                    "expected AssignId, got {:?}",
                    other.tag()
                )));
            }
        };

        let (events_tx, events) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let outbound = spawn_connection(
            connection_id,
            reader,
            writer,
            config.frame.clone(),
            config.inbound_queue_capacity,
            events_tx,
        );
        state.set(ConnectionState::Connected);
        tracing::info!(connection = ?connection_id, "connected to server");

        Ok(Self {
            connection_id,
            outbound,
            events,
            state,
        })
    }

    /// The id the server assigned to this client.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    pub fn send(&self, message: Message) -> Result<(), LinkClosed> {
        self.outbound.send(message)
    }

    /// Take the next inbound event if one is ready.
    pub fn try_next_event(&mut self) -> Option<NetEvent> {
        let event = self.events.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    /// Wait for the next inbound event. `None` once the connection is gone
    /// and every event has been taken.
    pub async fn next_event(&mut self) -> Option<NetEvent> {
        let event = self.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    fn observe(&self, event: &NetEvent) {
        if let NetEvent::Disconnected(_, reason) = event {
            tracing::info!(%reason, "disconnected from server");
            self.state.set(ConnectionState::Disconnected);
        }
    }

    /// Close the connection. State becomes [`ConnectionState::Disconnected`]
    /// immediately.
    pub fn disconnect(&self) {
        self.outbound.close();
        self.state.set(ConnectionState::Disconnected);
    }
}
