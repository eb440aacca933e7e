//! Replication message kinds and their frame encoding.
//!
//! A frame is `tag:u8` followed by the body for that tag. State flows server
//! to client (`AssignId`, `FullSnapshot`, `Spawn`, `Destroy`, `FieldUpdate`);
//! intent flows client to server (`ClientRequest`).

use crate::ids::{ConnectionId, FieldId, ObjectId, Owner, RequestId};
use crate::wire::{FieldValue, WireError, WireReader, WireWriter};

/// Wire-protocol version announced in [`Message::AssignId`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame bytes of a `FullSnapshot` before its first record: tag and count.
pub const FULL_SNAPSHOT_OVERHEAD: usize = 1 + 4;

/// Frame bytes of a `Spawn` besides its record: the tag.
pub const SPAWN_OVERHEAD: usize = 1;

/// Frame bytes of a `FieldUpdate` before its first update: tag and count.
pub const FIELD_UPDATE_OVERHEAD: usize = 1 + 2;

/// Leading byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
    /// Connection id assignment, first frame on every connection.
    AssignId = 0x01,
    /// Every live object, sent once right after the handshake.
    FullSnapshot = 0x02,
    /// One new object.
    Spawn = 0x03,
    /// One object removed.
    Destroy = 0x04,
    /// A batch of changed field values.
    FieldUpdate = 0x05,
    /// Client-to-server request invocation.
    ClientRequest = 0x06,
}

impl TryFrom<u8> for MessageTag {
    type Error = WireError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0x01 => MessageTag::AssignId,
            0x02 => MessageTag::FullSnapshot,
            0x03 => MessageTag::Spawn,
            0x04 => MessageTag::Destroy,
            0x05 => MessageTag::FieldUpdate,
            0x06 => MessageTag::ClientRequest,
            other => return Err(WireError::UnknownMessageTag(other)),
        })
    }
}

/// Everything a client needs to build the shadow of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    /// Server-assigned id.
    pub object_id: ObjectId,
    /// Template both sides instantiate.
    pub template: String,
    /// Owning side.
    pub owner: Owner,
    /// Current value of every field, in layout order.
    pub fields: Vec<FieldValue>,
}

/// One changed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    /// Object the field belongs to.
    pub object_id: ObjectId,
    /// Position in the object's field layout.
    pub field_id: FieldId,
    /// New value.
    pub value: FieldValue,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake: the server tells the client who it is.
    AssignId {
        /// Server's [`PROTOCOL_VERSION`].
        protocol_version: u8,
        /// The id assigned to this connection.
        connection_id: ConnectionId,
    },
    /// Every live object with every field value.
    FullSnapshot(Vec<SpawnRecord>),
    /// A new object.
    Spawn(SpawnRecord),
    /// An object to drop.
    Destroy(ObjectId),
    /// Field diffs flushed in one replication tick.
    FieldUpdate(Vec<FieldUpdate>),
    /// A request invocation, payload already serialized.
    ClientRequest {
        /// Target object.
        object_id: ObjectId,
        /// Request channel within the object.
        request_id: RequestId,
        /// Serialized request payload.
        payload: Vec<u8>,
    },
}

/// Errors that can occur while decoding a frame into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// The frame had no tag byte.
    #[error("empty frame, no message tag")]
    EmptyFrame,

    /// The frame body was malformed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The body decoded but bytes were left over.
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
}

fn too_many(what: &'static str, len: usize, max: usize) -> WireError {
    WireError::TooLong { what, len, max }
}

impl SpawnRecord {
    /// Bytes this record takes inside a `Spawn` or `FullSnapshot` frame.
    pub fn encoded_len(&self) -> usize {
        4 + 2 + self.template.len() + 4 + 2
            + self.fields.iter().map(FieldValue::encoded_len).sum::<usize>()
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), WireError> {
        w.write_u32(self.object_id.0);
        w.write_short_str(&self.template)?;
        w.write_i32(self.owner.to_wire()?);
        let count = u16::try_from(self.fields.len())
            .map_err(|_| too_many("field list", self.fields.len(), u16::MAX as usize))?;
        w.write_u16(count);
        for value in &self.fields {
            value.encode(w)?;
        }
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let object_id = ObjectId(r.read_u32()?);
        let template = r.read_short_str()?;
        let owner = Owner::from_wire(r.read_i32()?)?;
        let count = r.read_u16()? as usize;
        let fields = (0..count)
            .map(|_| FieldValue::decode(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            object_id,
            template,
            owner,
            fields,
        })
    }
}

impl FieldUpdate {
    /// Bytes this update takes inside a `FieldUpdate` frame.
    pub fn encoded_len(&self) -> usize {
        4 + 2 + self.value.encoded_len()
    }
}

/// Packs items into batches whose frames stay within a size limit.
///
/// Sizes are computed up front from `encoded_len`, so nothing is encoded
/// twice. An item too large to fit even alone is set aside for the caller
/// to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
    max_frame_size: usize,
}

/// Result of [`FrameBudget::split`].
#[derive(Debug)]
pub struct Batches<T> {
    /// Batches in input order, none of them empty.
    pub batches: Vec<Vec<T>>,
    /// Items that cannot be framed at all under the limit.
    pub oversized: Vec<T>,
}

impl FrameBudget {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: max_frame_size as usize,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Whether a frame of `overhead` fixed bytes plus one `item_len` item fits.
    pub fn fits(&self, overhead: usize, item_len: usize) -> bool {
        overhead.saturating_add(item_len) <= self.max_frame_size
    }

    /// Split `items` into batches of at most `max_items` whose frames, each
    /// `overhead` bytes plus the sum of their items, fit the limit.
    pub fn split<T>(
        &self,
        items: impl IntoIterator<Item = T>,
        overhead: usize,
        max_items: usize,
        encoded_len: impl Fn(&T) -> usize,
    ) -> Batches<T> {
        let max_items = max_items.max(1);
        let mut batches = Vec::new();
        let mut oversized = Vec::new();
        let mut current = Vec::new();
        let mut used = overhead;
        for item in items {
            let len = encoded_len(&item);
            if !self.fits(overhead, len) {
                oversized.push(item);
                continue;
            }
            if !current.is_empty()
                && (current.len() == max_items || used + len > self.max_frame_size)
            {
                batches.push(std::mem::take(&mut current));
                used = overhead;
            }
            used += len;
            current.push(item);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        Batches { batches, oversized }
    }
}

impl Message {
    /// Tag this message is framed with.
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::AssignId { .. } => MessageTag::AssignId,
            Message::FullSnapshot(_) => MessageTag::FullSnapshot,
            Message::Spawn(_) => MessageTag::Spawn,
            Message::Destroy(_) => MessageTag::Destroy,
            Message::FieldUpdate(_) => MessageTag::FieldUpdate,
            Message::ClientRequest { .. } => MessageTag::ClientRequest,
        }
    }

    /// Encode into frame contents (tag + body).
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = WireWriter::with_capacity(32);
        w.write_u8(self.tag() as u8);
        match self {
            Message::AssignId {
                protocol_version,
                connection_id,
            } => {
                w.write_u8(*protocol_version);
                w.write_u32(connection_id.0);
            }
            Message::FullSnapshot(records) => {
                let count = u32::try_from(records.len())
                    .map_err(|_| too_many("snapshot", records.len(), u32::MAX as usize))?;
                w.write_u32(count);
                for record in records {
                    record.encode(&mut w)?;
                }
            }
            Message::Spawn(record) => record.encode(&mut w)?,
            Message::Destroy(id) => w.write_u32(id.0),
            Message::FieldUpdate(updates) => {
                let count = u16::try_from(updates.len())
                    .map_err(|_| too_many("update batch", updates.len(), u16::MAX as usize))?;
                w.write_u16(count);
                for update in updates {
                    w.write_u32(update.object_id.0);
                    w.write_u16(update.field_id.0);
                    update.value.encode(&mut w)?;
                }
            }
            Message::ClientRequest {
                object_id,
                request_id,
                payload,
            } => {
                w.write_u32(object_id.0);
                w.write_u16(request_id.0);
                w.write_bytes(payload)?;
            }
        }
        Ok(w.into_bytes())
    }

    /// Decode frame contents (tag + body). The whole frame must be consumed.
    pub fn decode(frame: &[u8]) -> Result<Self, MessageError> {
        let (&tag, body) = frame.split_first().ok_or(MessageError::EmptyFrame)?;
        let mut r = WireReader::new(body);

        let message = match MessageTag::try_from(tag)? {
            MessageTag::AssignId => Message::AssignId {
                protocol_version: r.read_u8()?,
                connection_id: ConnectionId(r.read_u32()?),
            },
            MessageTag::FullSnapshot => {
                let count = r.read_u32()? as usize;
                // Each record is at least 12 bytes; don't trust the count for allocation.
                let mut records = Vec::with_capacity(count.min(r.remaining() / 12));
                for _ in 0..count {
                    records.push(SpawnRecord::decode(&mut r)?);
                }
                Message::FullSnapshot(records)
            }
            MessageTag::Spawn => Message::Spawn(SpawnRecord::decode(&mut r)?),
            MessageTag::Destroy => Message::Destroy(ObjectId(r.read_u32()?)),
            MessageTag::FieldUpdate => {
                let count = r.read_u16()? as usize;
                let mut updates = Vec::with_capacity(count);
                for _ in 0..count {
                    updates.push(FieldUpdate {
                        object_id: ObjectId(r.read_u32()?),
                        field_id: FieldId(r.read_u16()?),
                        value: FieldValue::decode(&mut r)?,
                    });
                }
                Message::FieldUpdate(updates)
            }
            MessageTag::ClientRequest => Message::ClientRequest {
                object_id: ObjectId(r.read_u32()?),
                request_id: RequestId(r.read_u16()?),
                payload: r.read_bytes()?.to_vec(),
            },
        };

        if !r.is_empty() {
            return Err(MessageError::TrailingBytes(r.remaining()));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capital_record() -> SpawnRecord {
        SpawnRecord {
            object_id: ObjectId(3),
            template: "capital".to_string(),
            owner: Owner::Client(ConnectionId(7)),
            fields: vec![
                FieldValue::Bool(false),
                FieldValue::Str("Hello World".to_string()),
                FieldValue::Int(0),
            ],
        }
    }

    #[test]
    fn test_destroy_layout() {
        let bytes = Message::Destroy(ObjectId(0x0102_0304)).encode().unwrap();
        assert_eq!(bytes, vec![0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_assign_id_layout() {
        let msg = Message::AssignId {
            protocol_version: PROTOCOL_VERSION,
            connection_id: ConnectionId(7),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, vec![0x01, PROTOCOL_VERSION, 0, 0, 0, 7]);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_spawn_layout_starts_with_id_template_owner() {
        let bytes = Message::Spawn(capital_record()).encode().unwrap();
        assert_eq!(bytes[0], MessageTag::Spawn as u8);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 3]);
        assert_eq!(&bytes[5..7], &[0, 7]);
        assert_eq!(&bytes[7..14], b"capital");
        assert_eq!(&bytes[14..18], &[0, 0, 0, 7]);
        assert_eq!(&bytes[18..20], &[0, 3]);
    }

    #[test]
    fn test_server_owned_spawn_decodes() {
        let mut record = capital_record();
        record.owner = Owner::Server;
        let msg = Message::FullSnapshot(vec![record, capital_record()]);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_field_update_batch_decodes() {
        let msg = Message::FieldUpdate(vec![
            FieldUpdate {
                object_id: ObjectId(3),
                field_id: FieldId(0),
                value: FieldValue::Bool(true),
            },
            FieldUpdate {
                object_id: ObjectId(3),
                field_id: FieldId(1),
                value: FieldValue::Str("Goodbye World".into()),
            },
        ]);
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_client_request_carries_opaque_payload() {
        let msg = Message::ClientRequest {
            object_id: ObjectId(1),
            request_id: RequestId(2),
            payload: vec![0xDE, 0xAD],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes, vec![0x06, 0, 0, 0, 1, 0, 2, 0, 0, 0, 2, 0xDE, 0xAD]);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(
            Message::decode(&[0x42, 0, 0]),
            Err(MessageError::Wire(WireError::UnknownMessageTag(0x42)))
        );
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert_eq!(Message::decode(&[]), Err(MessageError::EmptyFrame));
    }

    #[test]
    fn test_unknown_field_kind_inside_update_rejected() {
        // One update: object 1, field 0, kind 0x09.
        let frame = [0x05, 0, 1, 0, 0, 0, 1, 0, 0, 0x09, 0];
        assert_eq!(
            Message::decode(&frame),
            Err(MessageError::Wire(WireError::UnknownFieldKind(0x09)))
        );
    }

    #[test]
    fn test_overheads_match_encoded_frames() {
        let record = capital_record();
        let spawn = Message::Spawn(record.clone()).encode().unwrap();
        assert_eq!(spawn.len(), SPAWN_OVERHEAD + record.encoded_len());

        let snapshot = Message::FullSnapshot(vec![record.clone(), record.clone()])
            .encode()
            .unwrap();
        assert_eq!(snapshot.len(), FULL_SNAPSHOT_OVERHEAD + 2 * record.encoded_len());

        let update = FieldUpdate {
            object_id: ObjectId(3),
            field_id: FieldId(1),
            value: FieldValue::Value(vec![1, 2, 3]),
        };
        let frame = Message::FieldUpdate(vec![update.clone()]).encode().unwrap();
        assert_eq!(frame.len(), FIELD_UPDATE_OVERHEAD + update.encoded_len());
    }

    #[test]
    fn test_budget_splits_by_size_and_sets_aside_oversized() {
        let budget = FrameBudget::new(20);
        // Overhead 5: items of 6 bytes pack two per frame (5 + 12 = 17).
        let split = budget.split([6usize, 6, 6, 30, 6, 15], 5, usize::MAX, |len| *len);
        assert_eq!(split.batches, vec![vec![6, 6], vec![6, 6], vec![15]]);
        assert_eq!(split.oversized, vec![30]);
        for batch in &split.batches {
            assert!(5 + batch.iter().sum::<usize>() <= budget.max_frame_size());
        }
    }

    #[test]
    fn test_budget_caps_items_per_batch() {
        let budget = FrameBudget::new(1_000);
        let split = budget.split(0..5u32, 3, 2, |_| 1);
        assert_eq!(split.batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert!(split.oversized.is_empty());
    }

    #[test]
    fn test_oversized_owner_id_fails_encoding() {
        let mut record = capital_record();
        record.owner = Owner::Client(ConnectionId(u32::MAX));
        assert_eq!(
            Message::Spawn(record).encode(),
            Err(WireError::ConnectionIdOutOfRange(u32::MAX))
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Message::Destroy(ObjectId(1)).encode().unwrap();
        bytes.push(0);
        assert_eq!(Message::decode(&bytes), Err(MessageError::TrailingBytes(1)));
    }

    #[test]
    fn test_huge_snapshot_count_does_not_preallocate() {
        // Claims u32::MAX records but carries none.
        let frame = [0x02, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            Message::decode(&frame),
            Err(MessageError::Wire(WireError::Truncated { .. }))
        ));
    }
}
