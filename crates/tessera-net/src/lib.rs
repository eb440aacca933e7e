//! Transport for object replication: ids, the binary wire codec, message
//! framing, and TCP connection lifecycle for both ends.

pub mod connection;
pub mod framing;
pub mod ids;
pub mod messages;
pub mod tcp_client;
pub mod tcp_server;
pub mod wire;

pub use connection::{
    DisconnectReason, LAGGING_REASON, LinkClosed, NetEvent, Outbound, spawn_connection,
};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use ids::{ConnectionId, FieldId, MAX_CONNECTION_ID, ObjectId, Owner, RequestId};
pub use messages::{
    Batches, FIELD_UPDATE_OVERHEAD, FULL_SNAPSHOT_OVERHEAD, FieldUpdate, FrameBudget, Message,
    MessageError, MessageTag, PROTOCOL_VERSION, SPAWN_OVERHEAD, SpawnRecord,
};
pub use tcp_client::{ClientConfig, ConnectError, ConnectionState, ConnectionStateWatch, NetClient};
pub use tcp_server::{
    AcceptError, ConnectionLimitReached, ConnectionMap, IdGenerator, NetServer, ServerConfig,
};
pub use wire::{FieldKind, FieldValue, WireError, WireReader, WireWriter};
