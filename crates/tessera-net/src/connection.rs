//! Per-connection framing and dispatch, shared by server and client.
//!
//! Each connection runs two tasks:
//!
//! - a **reader** that blocks on the stream, decodes frames into [`Message`]s
//!   and forwards them to the owning manager's inbound queue;
//! - a **writer** that drains a bounded outbound queue and writes frames.
//!
//! Decoding happens on the network side; *applying* messages is the manager's
//! job on its own tick. Either task failing tears down both and reports a
//! single [`NetEvent::Disconnected`] carrying the reason. A peer that stops
//! reading until its outbound queue fills up is closed as lagging.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::ids::ConnectionId;
use crate::messages::{Message, MessageError};

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream.
    PeerClosed,
    /// This side closed the connection on purpose.
    Local,
    /// The server is shutting down.
    Shutdown,
    /// The peer sent something that breaks the protocol.
    Protocol(String),
    /// A socket read or write failed.
    Transport(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed the connection"),
            DisconnectReason::Local => write!(f, "closed locally"),
            DisconnectReason::Shutdown => write!(f, "server shutdown"),
            DisconnectReason::Protocol(why) => write!(f, "protocol violation: {why}"),
            DisconnectReason::Transport(why) => write!(f, "transport failure: {why}"),
        }
    }
}

/// Returned when sending on a connection whose writer has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection {0:?} is closed")]
pub struct LinkClosed(pub ConnectionId);

/// Something that happened on a connection, delivered to the manager's queue.
#[derive(Debug)]
pub enum NetEvent {
    /// A connection completed its handshake (server side only).
    Connected(Outbound),
    /// A decoded message arrived.
    Message(ConnectionId, Message),
    /// The connection is gone. Reported exactly once per connection.
    Disconnected(ConnectionId, DisconnectReason),
}

/// Reason reported for a connection closed because its queue overflowed.
pub const LAGGING_REASON: &str = "outbound queue full, peer is not reading";

/// Cloneable sending half of a connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    id: ConnectionId,
    tx: mpsc::Sender<Message>,
    shutdown: Arc<watch::Sender<bool>>,
    lagging: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
}

impl Outbound {
    /// The connection this handle writes to.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message for the writer task. Never blocks.
    ///
    /// A full queue closes the connection; the disconnect is reported as a
    /// transport failure.
    pub fn send(&self, message: Message) -> Result<(), LinkClosed> {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.lagging.swap(true, Ordering::AcqRel) {
                    tracing::warn!(connection = ?self.id, capacity = self.tx.max_capacity(), "outbound queue full, closing connection");
                }
                self.close();
                Err(LinkClosed(self.id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(LinkClosed(self.id)),
        }
    }

    /// Number of messages accepted by [`Outbound::send`] so far.
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stop both tasks. Messages already queued may be dropped.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Whether the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Reports the disconnect for a connection at most once, whichever task notices first.
struct CloseReporter {
    id: ConnectionId,
    reported: AtomicBool,
    lagging: Arc<AtomicBool>,
    events: mpsc::Sender<NetEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl CloseReporter {
    async fn report(&self, reason: DisconnectReason) {
        let _ = self.shutdown.send(true);
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = match reason {
            DisconnectReason::Local if self.lagging.load(Ordering::Acquire) => {
                DisconnectReason::Transport(LAGGING_REASON.to_string())
            }
            other => other,
        };
        match &reason {
            DisconnectReason::Protocol(_) | DisconnectReason::Transport(_) => {
                tracing::warn!(connection = ?self.id, %reason, "connection torn down");
            }
            _ => tracing::debug!(connection = ?self.id, %reason, "connection closed"),
        }
        let _ = self.events.send(NetEvent::Disconnected(self.id, reason)).await;
    }
}

fn reason_for_frame_error(err: FrameError) -> DisconnectReason {
    match err {
        FrameError::ConnectionClosed => DisconnectReason::PeerClosed,
        FrameError::FrameTooLarge { .. } => DisconnectReason::Protocol(err.to_string()),
        FrameError::Io(e) => DisconnectReason::Transport(e.to_string()),
    }
}

fn reason_for_message_error(err: MessageError) -> DisconnectReason {
    DisconnectReason::Protocol(err.to_string())
}

/// Start the reader and writer tasks for an already-handshaken stream.
///
/// Decoded messages and the final disconnect go to `events`. The returned
/// [`Outbound`] feeds the writer through a queue of `queue_capacity` messages.
pub fn spawn_connection<R, W>(
    id: ConnectionId,
    reader: R,
    writer: W,
    config: FrameConfig,
    queue_capacity: usize,
    events: mpsc::Sender<NetEvent>,
) -> Outbound
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    start_link(id, reader, writer, config, queue_capacity, events, None)
}

/// Start a freshly accepted connection.
///
/// `greeting` is queued ahead of anything else the manager sends, and the
/// reader announces [`NetEvent::Connected`] before forwarding any inbound
/// message, so the manager always learns about the link first.
pub fn spawn_accepted<R, W>(
    id: ConnectionId,
    reader: R,
    writer: W,
    config: FrameConfig,
    queue_capacity: usize,
    events: mpsc::Sender<NetEvent>,
    greeting: Message,
) -> Outbound
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    start_link(id, reader, writer, config, queue_capacity, events, Some(greeting))
}

fn start_link<R, W>(
    id: ConnectionId,
    reader: R,
    writer: W,
    config: FrameConfig,
    queue_capacity: usize,
    events: mpsc::Sender<NetEvent>,
    greeting: Option<Message>,
) -> Outbound
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    // One extra slot so the greeting never counts against the caller's budget.
    let (tx, rx) = mpsc::channel(queue_capacity.max(1) + 1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);
    let lagging = Arc::new(AtomicBool::new(false));
    let reporter = Arc::new(CloseReporter {
        id,
        reported: AtomicBool::new(false),
        lagging: Arc::clone(&lagging),
        events: events.clone(),
        shutdown: Arc::clone(&shutdown),
    });

    let outbound = Outbound {
        id,
        tx,
        shutdown,
        lagging,
        sent: Arc::new(AtomicU64::new(0)),
    };

    let announce = match greeting {
        Some(greeting) => {
            // The receiver is still alive here, so this cannot fail.
            let _ = outbound.send(greeting);
            Some(outbound.clone())
        }
        None => None,
    };

    tokio::spawn(read_loop(
        id,
        reader,
        config.clone(),
        events,
        announce,
        shutdown_rx.clone(),
        Arc::clone(&reporter),
    ));
    tokio::spawn(write_loop(id, writer, config, rx, shutdown_rx, reporter));

    outbound
}

async fn read_loop<R: AsyncRead + Unpin>(
    id: ConnectionId,
    mut reader: R,
    config: FrameConfig,
    events: mpsc::Sender<NetEvent>,
    announce: Option<Outbound>,
    mut shutdown_rx: watch::Receiver<bool>,
    reporter: Arc<CloseReporter>,
) {
    if let Some(outbound) = announce
        && events.send(NetEvent::Connected(outbound)).await.is_err()
    {
        reporter.report(DisconnectReason::Local).await;
        return;
    }
    let reason = loop {
        if *shutdown_rx.borrow() {
            break DisconnectReason::Local;
        }
        tokio::select! {
            result = read_frame(&mut reader, &config) => {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) => break reason_for_frame_error(e),
                };
                if frame.is_empty() {
                    continue;
                }
                let message = match Message::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => break reason_for_message_error(e),
                };
                tracing::trace!(connection = ?id, tag = ?message.tag(), "received");
                if events.send(NetEvent::Message(id, message)).await.is_err() {
                    // Manager dropped its queue; nobody is listening.
                    break DisconnectReason::Local;
                }
            }
            _ = shutdown_rx.changed() => {
                break DisconnectReason::Local;
            }
        }
    };
    reporter.report(reason).await;
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    mut writer: W,
    config: FrameConfig,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
    reporter: Arc<CloseReporter>,
) {
    let reason = loop {
        if *shutdown_rx.borrow() {
            break DisconnectReason::Local;
        }
        tokio::select! {
            next = rx.recv() => {
                let Some(message) = next else {
                    break DisconnectReason::Local;
                };
                let frame = match message.encode() {
                    Ok(frame) => frame,
                    Err(e) => break DisconnectReason::Protocol(format!("unencodable {:?}: {e}", message.tag())),
                };
                if let Err(e) = write_frame(&mut writer, &frame, &config).await {
                    break match e {
                        FrameError::FrameTooLarge { .. } => DisconnectReason::Protocol(e.to_string()),
                        other => DisconnectReason::Transport(other.to_string()),
                    };
                }
                tracing::trace!(connection = ?id, tag = ?message.tag(), bytes = frame.len(), "sent");
            }
            _ = shutdown_rx.changed() => {
                break DisconnectReason::Local;
            }
        }
    };
    // Dropping the receiver makes further `Outbound::send` calls fail.
    drop(rx);
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
    reporter.report(reason).await;
}
