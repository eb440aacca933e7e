//! Error types for the replication layer.

use tessera_net::{FieldKind, LinkClosed, ObjectId, Owner, RequestId};

/// Errors raised by a single synchronized field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// Client code tried to write a field that only the server may change.
    #[error("synchronized fields are read-only on a mirror")]
    MirrorWrite,

    /// An authoritative field was asked to take a value from the wire.
    #[error("authoritative fields are never overwritten from the wire")]
    AuthorityApply,

    /// The field was used before its object attached it.
    #[error("field is not attached to a replicated object")]
    Detached,

    /// The encoded value carries a different kind than the field declares.
    #[error("field kind mismatch: declared {expected:?}, received {found:?}")]
    KindMismatch { expected: FieldKind, found: FieldKind },

    /// A user value could not be serialized or deserialized.
    #[error("field value codec error: {0}")]
    Codec(String),
}

/// Why a spawn was refused. No partial object is ever created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("unknown template {0:?}")]
    UnknownTemplate(String),

    #[error("template {template:?} declares {count} fields, more than a field id can address")]
    TooManyFields { template: String, count: usize },

    #[error("template {template:?} registers more requests than a request id can address")]
    TooManyRequests { template: String },

    #[error("object id space exhausted")]
    IdsExhausted,

    /// The initial state would not fit in one frame, so no client could ever
    /// receive the object.
    #[error("template {template:?} encodes to {size} bytes, over the {max} byte frame limit")]
    TooLarge {
        template: String,
        size: usize,
        max: usize,
    },

    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Why a request invocation did not run.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The local side does not own the target object.
    #[error("object {object:?} is owned by {owner}, not by this side")]
    NotOwner { object: ObjectId, owner: Owner },

    #[error("unknown object {0:?}")]
    UnknownObject(ObjectId),

    #[error("object {object:?} has no request {request:?}")]
    UnknownRequest { object: ObjectId, request: RequestId },

    /// The handle's payload type differs from the registered one.
    #[error("payload type does not match request {request:?} on object {object:?}")]
    PayloadMismatch { object: ObjectId, request: RequestId },

    /// The handler's behaviour is not where it was registered.
    #[error("request {request:?} on object {object:?} lost its behaviour")]
    BehaviourMismatch { object: ObjectId, request: RequestId },

    #[error("payload codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// The link dropped while the request was being written. The connection
    /// has been torn down.
    #[error(transparent)]
    LinkClosed(#[from] LinkClosed),

    /// The mirror has already disconnected.
    #[error("not connected")]
    NotConnected,
}

impl RequestError {
    /// Whether a peer sending this request broke the protocol, as opposed to
    /// a rejection that the sender can recover from.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            RequestError::UnknownObject(_)
                | RequestError::UnknownRequest { .. }
                | RequestError::Codec(_)
        )
    }
}

/// An inbound message that cannot be applied without corrupting state.
///
/// Carried into [`tessera_net::DisconnectReason::Protocol`] when the
/// connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProtocolViolation(pub String);

impl From<FieldError> for ProtocolViolation {
    fn from(err: FieldError) -> Self {
        ProtocolViolation(err.to_string())
    }
}
