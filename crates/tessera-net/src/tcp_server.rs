//! TCP server that accepts connections and hands them to the authority.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc, watch};

use crate::connection::{NetEvent, Outbound, spawn_accepted};
use crate::framing::FrameConfig;
use crate::ids::{ConnectionId, MAX_CONNECTION_ID};
use crate::messages::{Message, PROTOCOL_VERSION};

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
///
/// Ids start at 0 and are never reused within a server session. Once
/// [`MAX_CONNECTION_ID`] has been handed out the generator is exhausted.
pub struct IdGenerator {
    next: AtomicU32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// A generator whose first id is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Return the next unique [`ConnectionId`], or `None` once ids run out.
    pub fn next_id(&self) -> Option<ConnectionId> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next <= MAX_CONNECTION_ID).then(|| next + 1)
            })
            .ok()
            .map(ConnectionId)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when the connection map is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection limit of {0} reached")]
pub struct ConnectionLimitReached(pub usize);

/// Why an incoming stream was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    LimitReached(#[from] ConnectionLimitReached),

    #[error("connection ids exhausted")]
    IdsExhausted,
}

/// Live connections keyed by [`ConnectionId`].
///
/// Links whose writer has exited are pruned lazily, so the count only covers
/// connections that can still be written to.
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, Outbound>>,
    max_connections: usize,
}

impl ConnectionMap {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Fail if one more connection would exceed the limit.
    pub async fn check_capacity(&self) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        map.retain(|_, link| !link.is_closed());
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached(self.max_connections));
        }
        Ok(())
    }

    /// Track a connection. Returns `Err` if the map is at capacity.
    pub async fn insert(&self, link: Outbound) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        map.retain(|_, link| !link.is_closed());
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached(self.max_connections));
        }
        map.insert(link.id(), link);
        Ok(())
    }

    pub async fn remove(&self, id: &ConnectionId) -> Option<Outbound> {
        self.inner.write().await.remove(id)
    }

    /// Number of connections that are still open.
    pub async fn len(&self) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|link| !link.is_closed()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and forget every connection.
    pub async fn close_all(&self) {
        let mut map = self.inner.write().await;
        for link in map.values() {
            link.close();
        }
        map.clear();
    }
}

/// Configuration for [`NetServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `127.0.0.1:7000`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 32.
    pub max_connections: usize,
    /// Framing limits applied to every connection.
    pub frame: FrameConfig,
    /// Capacity of the inbound event queue shared by all connections, and of
    /// each connection's outbound queue.
    pub inbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            max_connections: 32,
            frame: FrameConfig::default(),
            inbound_queue_capacity: 1024,
        }
    }
}

/// TCP server that accepts connections and manages their lifecycle.
///
/// Every accepted stream gets a fresh [`ConnectionId`], is greeted with
/// `AssignId`, and is then reported on the event queue returned by
/// [`NetServer::new`].
pub struct NetServer {
    config: ServerConfig,
    /// Active connection map (public for test inspection).
    pub connections: Arc<ConnectionMap>,
    id_gen: Arc<IdGenerator>,
    events: mpsc::Sender<NetEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NetServer {
    /// Create a server and the queue its connections report to.
    pub fn new(config: ServerConfig) -> (Self, mpsc::Receiver<NetEvent>) {
        let (events, events_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            id_gen: Arc::new(IdGenerator::new()),
            config,
            events,
            shutdown_tx,
            shutdown_rx,
        };
        (server, events_rx)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "server listening");
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    ///
    /// Returns once [`NetServer::shutdown`] is called. All connections are
    /// closed on the way out.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "could not set TCP_NODELAY");
                    }
                    match self.accept_stream(stream).await {
                        Ok(id) => tracing::info!(connection = ?id, peer = %peer_addr, "accepted connection"),
                        Err(e) => tracing::warn!(peer = %peer_addr, error = %e, "rejecting connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("server shutting down");
                        break;
                    }
                }
            }
        }

        self.connections.close_all().await;
        Ok(())
    }

    /// Adopt an already-established stream as a new connection.
    ///
    /// Works for any byte stream, so tests can drive the server over
    /// in-memory pipes.
    pub async fn accept_stream<S>(&self, stream: S) -> Result<ConnectionId, AcceptError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.connections.check_capacity().await?;

        let id = self.id_gen.next_id().ok_or(AcceptError::IdsExhausted)?;
        let (reader, writer) = tokio::io::split(stream);
        let greeting = Message::AssignId {
            protocol_version: PROTOCOL_VERSION,
            connection_id: id,
        };
        let link = spawn_accepted(
            id,
            reader,
            writer,
            self.config.frame.clone(),
            self.config.inbound_queue_capacity,
            self.events.clone(),
            greeting,
        );
        if let Err(e) = self.connections.insert(link.clone()).await {
            link.close();
            return Err(e.into());
        }
        Ok(id)
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}
