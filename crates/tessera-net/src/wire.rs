//! Explicit big-endian byte codec shared by every message kind.
//!
//! There is no schema discovery: each value is written by a dedicated routine
//! and read back by its mirror. Field values carry a one-byte kind tag so the
//! receiver can check the declared kind before applying anything.
//!
//! ```text
//! FieldValue := kind:u8 payload
//!   0x01 Bool   u8 (0 | 1)
//!   0x02 Int    i32
//!   0x03 Str    u32 length + UTF-8 bytes
//!   0x04 Value  u32 length + opaque bytes (postcard-encoded by the owner)
//! ```

/// Errors raised while decoding (or, for oversized lengths, encoding) wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The input ended before the value was complete.
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the decoder asked for.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// A field value started with a tag that names no field kind.
    #[error("unknown field kind tag {0:#04x}")]
    UnknownFieldKind(u8),

    /// A frame started with a tag that names no message kind.
    #[error("unknown message tag {0:#04x}")]
    UnknownMessageTag(u8),

    /// A boolean byte other than 0 or 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    /// A negative owner other than the server marker.
    #[error("invalid owner {0}")]
    InvalidOwner(i32),

    /// A connection id too large for the signed owner encoding.
    #[error("connection id {0} does not fit the owner encoding")]
    ConnectionIdOutOfRange(u32),

    /// String bytes were not UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A length does not fit its prefix.
    #[error("{what} length {len} exceeds {max}")]
    TooLong {
        /// What was being written.
        what: &'static str,
        /// Actual length.
        len: usize,
        /// Largest encodable length.
        max: usize,
    },
}

/// Declared kind of a synchronized field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// One byte, 0 or 1.
    Bool,
    /// Signed 32-bit integer.
    Int,
    /// Length-prefixed UTF-8 string.
    Str,
    /// Length-prefixed user-serialized value.
    Value,
}

impl FieldKind {
    /// Wire tag for this kind.
    pub fn tag(self) -> u8 {
        match self {
            FieldKind::Bool => 0x01,
            FieldKind::Int => 0x02,
            FieldKind::Str => 0x03,
            FieldKind::Value => 0x04,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0x01 => Ok(FieldKind::Bool),
            0x02 => Ok(FieldKind::Int),
            0x03 => Ok(FieldKind::Str),
            0x04 => Ok(FieldKind::Value),
            other => Err(WireError::UnknownFieldKind(other)),
        }
    }
}

/// A decoded, kind-tagged field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Boolean field.
    Bool(bool),
    /// Integer field.
    Int(i32),
    /// String field.
    Str(String),
    /// User-defined value, already serialized.
    Value(Vec<u8>),
}

impl FieldValue {
    /// Kind of this value.
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::Int(_) => FieldKind::Int,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Value(_) => FieldKind::Value,
        }
    }

    /// Bytes [`FieldValue::encode`] writes, kind tag included.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            FieldValue::Bool(_) => 1,
            FieldValue::Int(_) => 4,
            FieldValue::Str(s) => 4 + s.len(),
            FieldValue::Value(bytes) => 4 + bytes.len(),
        }
    }

    /// Append `kind tag + payload` to `w`.
    pub fn encode(&self, w: &mut WireWriter) -> Result<(), WireError> {
        w.write_u8(self.kind().tag());
        match self {
            FieldValue::Bool(b) => w.write_bool(*b),
            FieldValue::Int(v) => w.write_i32(*v),
            FieldValue::Str(s) => w.write_str(s)?,
            FieldValue::Value(bytes) => w.write_bytes(bytes)?,
        }
        Ok(())
    }

    /// Read `kind tag + payload` from `r`.
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(match FieldKind::from_tag(r.read_u8()?)? {
            FieldKind::Bool => FieldValue::Bool(r.read_bool()?),
            FieldKind::Int => FieldValue::Int(r.read_i32()?),
            FieldKind::Str => FieldValue::Str(r.read_str()?),
            FieldKind::Value => FieldValue::Value(r.read_bytes()?.to_vec()),
        })
    }
}

/// Growable big-endian output buffer.
#[derive(Debug, Default, Clone)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer, returning its buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// `u16` length prefix, then the bytes. For short names.
    pub fn write_short_str(&mut self, s: &str) -> Result<(), WireError> {
        let len = u16::try_from(s.len()).map_err(|_| WireError::TooLong {
            what: "short string",
            len: s.len(),
            max: u16::MAX as usize,
        })?;
        self.write_u16(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    /// `u32` length prefix, then the UTF-8 bytes.
    pub fn write_str(&mut self, s: &str) -> Result<(), WireError> {
        self.write_bytes(s.as_bytes())
    }

    /// `u32` length prefix, then the raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let len = u32::try_from(bytes.len()).map_err(|_| WireError::TooLong {
            what: "byte string",
            len: bytes.len(),
            max: u32::MAX as usize,
        })?;
        self.write_u32(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

/// Cursor over a borrowed big-endian input buffer.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    /// Counterpart of [`WireWriter::write_short_str`].
    pub fn read_short_str(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Counterpart of [`WireWriter::write_str`].
    pub fn read_str(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Counterpart of [`WireWriter::write_bytes`]. Borrows from the input.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}
