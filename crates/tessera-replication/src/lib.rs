//! Server-authoritative object replication.
//!
//! The server runs an [`AuthorityManager`] holding the canonical
//! [`ReplicatedObject`]s; each client runs a [`MirrorManager`] holding
//! read-only shadows. Objects are built from a shared [`TemplateRegistry`]
//! out of [`NetworkBehaviour`]s, whose [`SyncVar`] fields flow server to
//! client and whose request channels flow owning client to server.

pub mod authority;
pub mod behaviour;
pub mod error;
pub mod field;
pub mod manager;
pub mod mirror;
pub mod object;
pub mod request;
pub mod template;
pub mod tick;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use authority::{AuthorityManager, MAX_UPDATES_PER_MESSAGE, ServerListener};
pub use behaviour::{InitContext, NetworkBehaviour};
pub use error::{FieldError, ProtocolViolation, RequestError, SpawnError};
pub use field::{
    FieldCodec, FieldRole, NetValue, SyncBool, SyncField, SyncInt, SyncString, SyncValue, SyncVar,
};
pub use manager::{NetworkManager, ObjectRef};
pub use mirror::{ClientListener, MirrorManager};
pub use object::{ObjectTable, ReplicatedObject, Side};
pub use request::{RequestHandle, RequestPayload};
pub use template::{TemplateRegistry, TemplateRegistryBuilder};
pub use tick::{MAX_CATCH_UP_TICKS, TickSchedule};
