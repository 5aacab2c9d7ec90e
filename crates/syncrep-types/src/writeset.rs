//! Write-set container and wire format.
//!
//! A write set is what a transaction replicates: the certification keys it
//! touched plus an opaque data payload the application knows how to apply.
//! The wire layout is:
//!
//! ```text
//! ws_version  u8
//! key_version u8
//! flags       u32 LE
//! source_id   16 bytes
//! trx_id      u64 LE
//! last_seen   i64 LE
//! key count   ULEB128
//!   per key: access u8, key wire form (per key_version)
//! data length ULEB128
//! data bytes
//! ```
//!
//! Write-set versions below [`MIN_SHARED_KEY_VERSION`] predate shared key
//! access; their keys always decode as exclusive.

use crate::encoding::{
    append_u32_le, append_u64_le, read_u32_le, read_u64_le, uleb128_decode, uleb128_encode,
    DecodeError,
};
use crate::ids::{NodeId, Seqno, TrxFlags, TrxId};
use crate::key::{Key, KeyError, KeyVersion};

/// Current write-set format version.
pub const WRITE_SET_VERSION: u8 = 4;
/// First write-set version carrying per-key access flags.
pub const MIN_SHARED_KEY_VERSION: u8 = 4;

/// How a key participates in conflict detection.
///
/// Two shared references to the same key do not conflict; any pairing
/// involving an exclusive reference does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum KeyAccess {
    Exclusive = 0,
    Shared = 1,
}

impl KeyAccess {
    const fn from_raw(raw: u8) -> Result<Self, WriteSetError> {
        match raw {
            0 => Ok(Self::Exclusive),
            1 => Ok(Self::Shared),
            other => Err(WriteSetError::BadKeyAccess { raw: other }),
        }
    }
}

/// A key together with its access mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key: Key,
    pub access: KeyAccess,
}

/// Error constructing or decoding a write set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteSetError {
    #[error("unsupported write-set version: {version}")]
    BadVersion { version: u8 },
    #[error("unknown key access byte: {raw}")]
    BadKeyAccess { raw: u8 },
    #[error("key version mismatch: write set is {expected:?}, key is {actual:?}")]
    KeyVersionMismatch {
        expected: KeyVersion,
        actual: KeyVersion,
    },
    #[error("write set of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// The replicated unit: certification keys plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSet {
    version: u8,
    key_version: KeyVersion,
    flags: TrxFlags,
    source_id: NodeId,
    trx_id: TrxId,
    last_seen_seqno: Seqno,
    keys: Vec<KeyRecord>,
    data: Vec<u8>,
    /// Cap on the gathered size; appends past it are rejected. Not part of
    /// the wire form.
    max_size: usize,
}

impl WriteSet {
    #[must_use]
    pub fn new(key_version: KeyVersion, source_id: NodeId, trx_id: TrxId) -> Self {
        Self {
            version: WRITE_SET_VERSION,
            key_version,
            flags: TrxFlags::empty(),
            source_id,
            trx_id,
            last_seen_seqno: Seqno::UNDEFINED,
            keys: Vec::new(),
            data: Vec::new(),
            max_size: usize::MAX,
        }
    }

    /// Cap the gathered size of this write set. Appends that would push the
    /// wire form past `max_size` are rejected.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Append a key, rejecting version mismatches and size overruns up front
    /// so the canonical form stored in the certification index is uniform
    /// per write set.
    pub fn append_key(&mut self, key: Key, access: KeyAccess) -> Result<(), WriteSetError> {
        if key.version() != self.key_version {
            return Err(WriteSetError::KeyVersionMismatch {
                expected: self.key_version,
                actual: key.version(),
            });
        }
        self.keys.push(KeyRecord { key, access });
        let size = self.serial_size();
        if size > self.max_size {
            self.keys.pop();
            return Err(WriteSetError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    pub fn append_data(&mut self, data: &[u8]) -> Result<(), WriteSetError> {
        let prev_len = self.data.len();
        self.data.extend_from_slice(data);
        let size = self.serial_size();
        if size > self.max_size {
            self.data.truncate(prev_len);
            return Err(WriteSetError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    pub fn set_flags(&mut self, flags: TrxFlags) {
        self.flags = flags;
    }

    /// Record the certification window lower bound at replication time.
    pub fn set_last_seen_seqno(&mut self, seqno: Seqno) {
        self.last_seen_seqno = seqno;
    }

    #[inline]
    #[must_use]
    pub const fn last_seen_seqno(&self) -> Seqno {
        self.last_seen_seqno
    }

    #[inline]
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    #[inline]
    #[must_use]
    pub const fn key_version(&self) -> KeyVersion {
        self.key_version
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> TrxFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn source_id(&self) -> NodeId {
        self.source_id
    }

    #[inline]
    #[must_use]
    pub const fn trx_id(&self) -> TrxId {
        self.trx_id
    }

    #[must_use]
    pub fn keys(&self) -> &[KeyRecord] {
        &self.keys
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.data.is_empty()
    }

    /// Whether this write set's version supports shared key access.
    #[must_use]
    pub const fn supports_shared_keys(&self) -> bool {
        self.version >= MIN_SHARED_KEY_VERSION
    }

    /// Size of the gathered wire form in bytes.
    #[must_use]
    pub fn serial_size(&self) -> usize {
        let mut size = 1 + 1 + 4 + 16 + 8 + 8;
        size += crate::encoding::uleb128_size(self.keys.len() as u64);
        for record in &self.keys {
            size += 1 + record.key.serial_size();
        }
        size += crate::encoding::uleb128_size(self.data.len() as u64);
        size + self.data.len()
    }

    /// Produce the wire form.
    #[must_use]
    pub fn gather(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serial_size());
        buf.push(self.version);
        buf.push(self.key_version as u8);
        append_u32_le(&mut buf, self.flags.bits());
        buf.extend_from_slice(self.source_id.uuid().as_bytes());
        append_u64_le(&mut buf, self.trx_id.get());
        append_u64_le(&mut buf, self.last_seen_seqno.get() as u64);
        uleb128_encode(self.keys.len() as u64, &mut buf);
        for record in &self.keys {
            buf.push(record.access as u8);
            record.key.serialize(&mut buf);
        }
        uleb128_encode(self.data.len() as u64, &mut buf);
        buf.extend_from_slice(&self.data);
        debug_assert_eq!(buf.len(), self.serial_size());
        buf
    }

    /// Decode a wire-form write set.
    pub fn unserialize(buf: &[u8]) -> Result<Self, WriteSetError> {
        let Some(&version) = buf.first() else {
            return Err(DecodeError::ShortRead { offset: 0, need: 1 }.into());
        };
        if version == 0 || version > WRITE_SET_VERSION {
            return Err(WriteSetError::BadVersion { version });
        }
        let Some(&raw_key_version) = buf.get(1) else {
            return Err(DecodeError::ShortRead { offset: 1, need: 1 }.into());
        };
        let key_version = KeyVersion::from_raw(raw_key_version)?;
        let (flag_bits, offset) = read_u32_le(buf, 2)?;
        let end = offset + 16;
        let Some(uuid_bytes) = buf.get(offset..end) else {
            return Err(DecodeError::ShortRead {
                offset,
                need: end - buf.len(),
            }
            .into());
        };
        let mut raw_uuid = [0_u8; 16];
        raw_uuid.copy_from_slice(uuid_bytes);
        let source_id = NodeId::from_uuid(uuid::Uuid::from_bytes(raw_uuid));
        let (raw_trx_id, offset) = read_u64_le(buf, end)?;
        let (raw_last_seen, offset) = read_u64_le(buf, offset)?;

        let (key_count, mut offset) = uleb128_decode(buf, offset)?;
        let mut keys = Vec::with_capacity(key_count as usize);
        for _ in 0..key_count {
            let access = if version >= MIN_SHARED_KEY_VERSION {
                let Some(&raw) = buf.get(offset) else {
                    return Err(DecodeError::ShortRead { offset, need: 1 }.into());
                };
                offset += 1;
                KeyAccess::from_raw(raw)?
            } else {
                KeyAccess::Exclusive
            };
            let (key, next) = Key::deserialize(key_version, buf, offset)?;
            offset = next;
            keys.push(KeyRecord { key, access });
        }
        let (data_len, offset) = uleb128_decode(buf, offset)?;
        let end = offset + data_len as usize;
        let Some(data) = buf.get(offset..end) else {
            return Err(DecodeError::ShortRead {
                offset,
                need: end - buf.len(),
            }
            .into());
        };

        Ok(Self {
            version,
            key_version,
            flags: TrxFlags::from_bits(flag_bits),
            source_id,
            trx_id: TrxId::new(raw_trx_id),
            last_seen_seqno: Seqno::new(raw_last_seen as i64),
            keys,
            data: data.to_vec(),
            max_size: usize::MAX,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WriteSet {
        let mut ws = WriteSet::new(KeyVersion::V1, NodeId::generate(), TrxId::new(9));
        ws.set_flags(TrxFlags::COMMIT);
        ws.set_last_seen_seqno(Seqno::new(41));
        ws.append_key(
            Key::from_parts(KeyVersion::V1, &[b"db", b"t1", b"row"]).unwrap(),
            KeyAccess::Exclusive,
        )
        .unwrap();
        ws.append_key(
            Key::from_parts(KeyVersion::V1, &[b"db", b"t1"]).unwrap(),
            KeyAccess::Shared,
        )
        .unwrap();
        ws.append_data(b"opaque payload").unwrap();
        ws
    }

    #[test]
    fn gather_unserialize_round_trip() {
        let ws = sample();
        let buf = ws.gather();
        assert_eq!(buf.len(), ws.serial_size());
        let back = WriteSet::unserialize(&buf).unwrap();
        assert_eq!(back, ws);
        assert_eq!(back.keys()[1].access, KeyAccess::Shared);
        assert!(back.flags().contains(TrxFlags::COMMIT));
        assert_eq!(back.last_seen_seqno(), Seqno::new(41));
    }

    #[test]
    fn rejects_key_version_mismatch() {
        let mut ws = WriteSet::new(KeyVersion::V0, NodeId::generate(), TrxId::new(1));
        let v1_key = Key::from_parts(KeyVersion::V1, &[b"a"]).unwrap();
        assert!(matches!(
            ws.append_key(v1_key, KeyAccess::Exclusive),
            Err(WriteSetError::KeyVersionMismatch { .. })
        ));
    }

    #[test]
    fn size_cap_enforced_on_append() {
        let mut ws = WriteSet::new(KeyVersion::V1, NodeId::generate(), TrxId::new(1));
        ws.set_max_size(64);
        ws.append_data(b"fits").unwrap();
        let before = ws.serial_size();

        let err = ws.append_data(&[0_u8; 128]).unwrap_err();
        assert!(matches!(err, WriteSetError::TooLarge { max: 64, .. }));
        // The rejected append left the write set untouched.
        assert_eq!(ws.serial_size(), before);

        let wide = Key::from_parts(KeyVersion::V1, &[&[0_u8; 128]]).unwrap();
        let err = ws.append_key(wide, KeyAccess::Exclusive).unwrap_err();
        assert!(matches!(err, WriteSetError::TooLarge { .. }));
        assert!(ws.keys().is_empty());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = sample().gather();
        buf[0] = 99;
        assert!(matches!(
            WriteSet::unserialize(&buf),
            Err(WriteSetError::BadVersion { version: 99 })
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut buf = sample().gather();
        buf.truncate(buf.len() - 4);
        assert!(WriteSet::unserialize(&buf).is_err());
    }

    #[test]
    fn empty_write_set_round_trips() {
        let ws = WriteSet::new(KeyVersion::V0, NodeId::UNDEFINED, TrxId::UNDEFINED);
        let back = WriteSet::unserialize(&ws.gather()).unwrap();
        assert!(back.is_empty());
        assert_eq!(back.trx_id(), TrxId::UNDEFINED);
    }
}
