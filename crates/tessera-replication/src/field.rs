//! Synchronized fields: dirty-tracked values replicated server to client.
//!
//! A [`SyncVar`] starts [`FieldRole::Detached`] inside a freshly built
//! behaviour. When the owning object attaches it, the field becomes either
//! [`FieldRole::Authority`] (server: writes mark it dirty, the next flush
//! ships it) or [`FieldRole::Mirror`] (client: local writes are rejected, only
//! decoded diffs change it).

use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_net::{FieldKind, FieldValue};

use crate::error::FieldError;

/// Which side of the link a field lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Not yet attached to an object. Writes set the initial value.
    Detached,
    /// Canonical copy on the server.
    Authority,
    /// Read-only shadow on a client.
    Mirror,
}

/// Conversion between a Rust value and its kind-tagged wire form.
///
/// Implemented for `bool`, `i32`, `String`, and [`NetValue<T>`] for any
/// serde type. There is no implicit coercion: a value is only accepted from
/// the wire when its kind tag matches [`FieldCodec::KIND`].
pub trait FieldCodec: Sized + Send + 'static {
    const KIND: FieldKind;

    fn encode_field(&self) -> Result<FieldValue, FieldError>;

    fn decode_field(value: &FieldValue) -> Result<Self, FieldError>;
}

fn mismatch<T: FieldCodec>(value: &FieldValue) -> FieldError {
    FieldError::KindMismatch {
        expected: T::KIND,
        found: value.kind(),
    }
}

impl FieldCodec for bool {
    const KIND: FieldKind = FieldKind::Bool;

    fn encode_field(&self) -> Result<FieldValue, FieldError> {
        Ok(FieldValue::Bool(*self))
    }

    fn decode_field(value: &FieldValue) -> Result<Self, FieldError> {
        match value {
            FieldValue::Bool(b) => Ok(*b),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

impl FieldCodec for i32 {
    const KIND: FieldKind = FieldKind::Int;

    fn encode_field(&self) -> Result<FieldValue, FieldError> {
        Ok(FieldValue::Int(*self))
    }

    fn decode_field(value: &FieldValue) -> Result<Self, FieldError> {
        match value {
            FieldValue::Int(v) => Ok(*v),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

impl FieldCodec for String {
    const KIND: FieldKind = FieldKind::Str;

    fn encode_field(&self) -> Result<FieldValue, FieldError> {
        Ok(FieldValue::Str(self.clone()))
    }

    fn decode_field(value: &FieldValue) -> Result<Self, FieldError> {
        match value {
            FieldValue::Str(s) => Ok(s.clone()),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

/// A user-defined value carried as a [`FieldKind::Value`] field, serialized
/// with postcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NetValue<T>(pub T);

impl<T> NetValue<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for NetValue<T> {
    fn from(value: T) -> Self {
        NetValue(value)
    }
}

impl<T> Deref for NetValue<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for NetValue<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> FieldCodec for NetValue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    const KIND: FieldKind = FieldKind::Value;

    fn encode_field(&self) -> Result<FieldValue, FieldError> {
        postcard::to_allocvec(&self.0)
            .map(FieldValue::Value)
            .map_err(|e| FieldError::Codec(e.to_string()))
    }

    fn decode_field(value: &FieldValue) -> Result<Self, FieldError> {
        match value {
            FieldValue::Value(bytes) => postcard::from_bytes(bytes)
                .map(NetValue)
                .map_err(|e| FieldError::Codec(e.to_string())),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

type ChangeCallback<T> = Box<dyn FnMut(&T) + Send>;

/// A single replicated value.
pub struct SyncVar<T: FieldCodec> {
    value: T,
    dirty: bool,
    role: FieldRole,
    on_change: Option<ChangeCallback<T>>,
}

pub type SyncBool = SyncVar<bool>;
pub type SyncInt = SyncVar<i32>;
pub type SyncString = SyncVar<String>;
pub type SyncValue<T> = SyncVar<NetValue<T>>;

impl<T: FieldCodec> SyncVar<T> {
    pub fn new(initial: impl Into<T>) -> Self {
        Self {
            value: initial.into(),
            dirty: false,
            role: FieldRole::Detached,
            on_change: None,
        }
    }

    /// Builder form of [`SyncVar::on_change`].
    pub fn with_on_change(mut self, callback: impl FnMut(&T) + Send + 'static) -> Self {
        self.on_change = Some(Box::new(callback));
        self
    }

    /// Install the change callback. Fires after every server-side write and
    /// after every applied diff on a mirror.
    pub fn on_change(&mut self, callback: impl FnMut(&T) + Send + 'static) {
        self.on_change = Some(Box::new(callback));
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn role(&self) -> FieldRole {
        self.role
    }

    /// Write a new value.
    ///
    /// On a mirror the write is dropped with a warning. Use
    /// [`SyncVar::try_set`] to observe the rejection.
    pub fn set(&mut self, value: impl Into<T>) {
        if let Err(e) = self.try_set(value) {
            tracing::warn!(kind = ?T::KIND, error = %e, "rejected field write");
        }
    }

    pub fn try_set(&mut self, value: impl Into<T>) -> Result<(), FieldError> {
        match self.role {
            FieldRole::Mirror => Err(FieldError::MirrorWrite),
            FieldRole::Detached => {
                self.value = value.into();
                Ok(())
            }
            FieldRole::Authority => {
                self.value = value.into();
                self.dirty = true;
                self.notify();
                Ok(())
            }
        }
    }

    fn notify(&mut self) {
        if let Some(callback) = self.on_change.as_mut() {
            callback(&self.value);
        }
    }
}

impl<T: FieldCodec + Default> Default for SyncVar<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: FieldCodec + fmt::Debug> fmt::Debug for SyncVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncVar")
            .field("value", &self.value)
            .field("dirty", &self.dirty)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Type-erased view of a field, used by the object to walk its layout.
pub trait SyncField: Send {
    fn kind(&self) -> FieldKind;

    fn role(&self) -> FieldRole;

    /// Bind the field to one side. Clears any pending dirty state.
    fn attach(&mut self, role: FieldRole);

    fn is_dirty(&self) -> bool;

    /// Encode the current value regardless of dirtiness.
    fn snapshot(&self) -> Result<FieldValue, FieldError>;

    /// Encode and clear the dirty flag, or `None` if unchanged since the
    /// last flush.
    fn take_if_dirty(&mut self) -> Result<Option<FieldValue>, FieldError>;

    /// Decode a value received from the server and fire the change callback.
    fn apply(&mut self, value: &FieldValue) -> Result<(), FieldError>;
}

impl<T: FieldCodec> SyncField for SyncVar<T> {
    fn kind(&self) -> FieldKind {
        T::KIND
    }

    fn role(&self) -> FieldRole {
        self.role
    }

    fn attach(&mut self, role: FieldRole) {
        self.role = role;
        self.dirty = false;
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn snapshot(&self) -> Result<FieldValue, FieldError> {
        self.value.encode_field()
    }

    fn take_if_dirty(&mut self) -> Result<Option<FieldValue>, FieldError> {
        if !self.dirty {
            return Ok(None);
        }
        let encoded = self.value.encode_field()?;
        self.dirty = false;
        Ok(Some(encoded))
    }

    fn apply(&mut self, value: &FieldValue) -> Result<(), FieldError> {
        match self.role {
            FieldRole::Mirror => {}
            FieldRole::Authority => return Err(FieldError::AuthorityApply),
            FieldRole::Detached => return Err(FieldError::Detached),
        }
        if value.kind() != T::KIND {
            return Err(mismatch::<T>(value));
        }
        self.value = T::decode_field(value)?;
        self.notify();
        Ok(())
    }
}
