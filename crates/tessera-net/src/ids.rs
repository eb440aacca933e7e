//! Identifiers carried on the wire.

use crate::wire::WireError;

/// Connection identifier assigned by the server at handshake. Never negative;
/// the first accepted connection gets 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

/// Session-unique identifier of a replicated object, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

/// Position of a field in its object's field layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(pub u16);

/// Request channel index within one object, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u16);

/// Who may act on an object: the server itself, or one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Owned outright by the server.
    Server,
    /// Owned by the client on this connection.
    Client(ConnectionId),
}

/// Wire value of [`Owner::Server`].
pub const SERVER_OWNER_WIRE: i32 = -1;

/// Largest connection id the signed owner encoding can carry.
pub const MAX_CONNECTION_ID: u32 = i32::MAX as u32;

impl Owner {
    /// Encode as the signed wire integer (`-1` for the server).
    pub fn to_wire(self) -> Result<i32, WireError> {
        match self {
            Owner::Server => Ok(SERVER_OWNER_WIRE),
            Owner::Client(ConnectionId(id)) => {
                i32::try_from(id).map_err(|_| WireError::ConnectionIdOutOfRange(id))
            }
        }
    }

    /// Decode the signed wire integer.
    pub fn from_wire(raw: i32) -> Result<Self, WireError> {
        match raw {
            SERVER_OWNER_WIRE => Ok(Owner::Server),
            id if id >= 0 => Ok(Owner::Client(ConnectionId(id.unsigned_abs()))),
            other => Err(WireError::InvalidOwner(other)),
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Server => write!(f, "server"),
            Owner::Client(id) => write!(f, "connection {}", id.0),
        }
    }
}
