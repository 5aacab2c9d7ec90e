//! Versioned certification keys.
//!
//! A key is an ordered sequence of byte-string parts (for a database row this
//! is typically schema, table, then row key). Two on-wire encodings coexist
//! and are selected per write set:
//!
//! - [`KeyVersion::V0`]: each part is prefixed by one length byte. Parts are
//!   limited to 255 bytes and a key to 255 parts. The serialized form is the
//!   part sequence prefixed by a `u16` total length.
//! - [`KeyVersion::V1`]: each part is prefixed by a ULEB128 length, and the
//!   serialized form is prefixed by a ULEB128 total length. No per-part
//!   limits beyond the write-set size cap.
//!
//! The concatenated part sequence is the key's *canonical form*: it is both
//! the unit of network serialization and the input to the certification
//! index hash, so equal keys hash and compare equal regardless of origin.

use std::fmt;

use smallvec::SmallVec;

use crate::encoding::{
    append_u16_le, read_u16_le, uleb128_decode, uleb128_encode, DecodeError,
};

/// Key encoding version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum KeyVersion {
    V0 = 0,
    V1 = 1,
}

impl KeyVersion {
    /// Resolve a numeric version from configuration or the wire.
    pub const fn from_raw(raw: u8) -> Result<Self, KeyError> {
        match raw {
            0 => Ok(Self::V0),
            1 => Ok(Self::V1),
            other => Err(KeyError::UnsupportedVersion { version: other }),
        }
    }
}

/// Largest part length version 0 accepts.
pub const V0_MAX_PART_LEN: usize = 256;
/// Largest part count representable by a v0 key.
pub const V0_MAX_PARTS: usize = 255;

/// Error constructing or decoding a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unsupported key version: {version}")]
    UnsupportedVersion { version: u8 },
    #[error("key part length {len} exceeds version 0 maximum {max}", max = V0_MAX_PART_LEN)]
    PartTooLong { len: usize },
    #[error("key part count {count} exceeds maximum {max}", max = V0_MAX_PARTS)]
    TooManyParts { count: usize },
    #[error("malformed key: part walk ended {at} bytes into a {len}-byte buffer")]
    Malformed { at: usize, len: usize },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A certification key in canonical byte form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Key {
    version: KeyVersion,
    canonical: Vec<u8>,
}

impl Key {
    /// Build a key from raw parts, validating the version's limits.
    pub fn from_parts(version: KeyVersion, parts: &[&[u8]]) -> Result<Self, KeyError> {
        if parts.len() > V0_MAX_PARTS {
            return Err(KeyError::TooManyParts { count: parts.len() });
        }
        let mut canonical = Vec::new();
        match version {
            KeyVersion::V0 => {
                for part in parts {
                    if part.len() > V0_MAX_PART_LEN {
                        return Err(KeyError::PartTooLong { len: part.len() });
                    }
                    // The length byte wraps for a part of exactly 256 bytes;
                    // the part walk reports such keys as malformed.
                    canonical.push(part.len() as u8);
                    canonical.extend_from_slice(part);
                }
            }
            KeyVersion::V1 => {
                for part in parts {
                    uleb128_encode(part.len() as u64, &mut canonical);
                    canonical.extend_from_slice(part);
                }
            }
        }
        Ok(Self { version, canonical })
    }

    #[inline]
    #[must_use]
    pub const fn version(&self) -> KeyVersion {
        self.version
    }

    /// The canonical byte form (part sequence without outer framing).
    #[inline]
    #[must_use]
    pub fn canonical(&self) -> &[u8] {
        &self.canonical
    }

    /// Hash of the canonical form, as used by the certification index.
    ///
    /// DJB2 over the canonical bytes. Deterministic across nodes: every
    /// member must bucket a given key identically.
    #[must_use]
    pub fn index_hash(&self) -> u64 {
        let mut hash = 5381_u64;
        for &byte in &self.canonical {
            hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(u64::from(byte));
        }
        hash
    }

    /// Parse the canonical form into a [`KeyRef`], validating it as it is
    /// walked.
    pub fn parse(&self) -> Result<KeyRef<'_>, KeyError> {
        let buf = &self.canonical;
        let mut parts = SmallVec::new();
        let mut pos = 0_usize;
        while pos < buf.len() {
            let (len, data_start) = match self.version {
                KeyVersion::V0 => (usize::from(buf[pos]), pos + 1),
                KeyVersion::V1 => {
                    let (len, next) = uleb128_decode(buf, pos)?;
                    (len as usize, next)
                }
            };
            let end = data_start + len;
            if end > buf.len() {
                return Err(KeyError::Malformed {
                    at: pos,
                    len: buf.len(),
                });
            }
            parts.push(&buf[data_start..end]);
            pos = end;
        }
        Ok(KeyRef {
            version: self.version,
            parts,
        })
    }

    /// Append the wire form (outer length framing + canonical bytes) to `buf`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self.version {
            KeyVersion::V0 => {
                debug_assert!(self.canonical.len() <= usize::from(u16::MAX));
                append_u16_le(buf, self.canonical.len() as u16);
            }
            KeyVersion::V1 => {
                uleb128_encode(self.canonical.len() as u64, buf);
            }
        }
        buf.extend_from_slice(&self.canonical);
    }

    /// Size of the wire form in bytes.
    #[must_use]
    pub fn serial_size(&self) -> usize {
        let framing = match self.version {
            KeyVersion::V0 => 2,
            KeyVersion::V1 => crate::encoding::uleb128_size(self.canonical.len() as u64),
        };
        framing + self.canonical.len()
    }

    /// Decode one key of `version` from `buf` at `offset`.
    ///
    /// Returns the key and the offset of the first byte past it. The part
    /// walk is validated so a corrupt length prefix is caught here rather
    /// than during certification.
    pub fn deserialize(
        version: KeyVersion,
        buf: &[u8],
        offset: usize,
    ) -> Result<(Self, usize), KeyError> {
        let (len, data_start) = match version {
            KeyVersion::V0 => {
                let (len, next) = read_u16_le(buf, offset)?;
                (usize::from(len), next)
            }
            KeyVersion::V1 => {
                let (len, next) = uleb128_decode(buf, offset)?;
                (len as usize, next)
            }
        };
        let end = data_start + len;
        if end > buf.len() {
            return Err(DecodeError::ShortRead {
                offset: data_start,
                need: end - buf.len(),
            }
            .into());
        }
        let key = Self {
            version,
            canonical: buf[data_start..end].to_vec(),
        };
        key.parse()?;
        Ok((key, end))
    }
}

/// Parsed view of a key: its parts as slices borrowing the canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef<'a> {
    version: KeyVersion,
    parts: SmallVec<[&'a [u8]; 3]>,
}

impl<'a> KeyRef<'a> {
    #[inline]
    #[must_use]
    pub const fn version(&self) -> KeyVersion {
        self.version
    }

    #[must_use]
    pub fn parts(&self) -> &[&'a [u8]] {
        &self.parts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parse() {
            Ok(key_ref) => {
                for (i, part) in key_ref.parts().iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    for byte in *part {
                        write!(f, "{byte:02x}")?;
                    }
                }
                Ok(())
            }
            Err(_) => f.write_str("<malformed key>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(version: KeyVersion, parts: &[&[u8]]) -> Key {
        Key::from_parts(version, parts).unwrap()
    }

    #[test]
    fn v0_part_framing() {
        let k = key(KeyVersion::V0, &[b"db", b"tbl", b"row1"]);
        assert_eq!(k.canonical(), b"\x02db\x03tbl\x04row1");
        let key_ref = k.parse().unwrap();
        assert_eq!(key_ref.version(), KeyVersion::V0);
        assert_eq!(
            key_ref.parts(),
            [b"db".as_ref(), b"tbl".as_ref(), b"row1".as_ref()]
        );
    }

    #[test]
    fn v0_part_length_boundary() {
        // Exactly 256 bytes is accepted; the single length byte wraps, so
        // the part walk reports the canonical form as malformed.
        let exact = vec![0xaa_u8; 256];
        let k = Key::from_parts(KeyVersion::V0, &[&exact]).unwrap();
        assert!(k.parse().is_err());

        let over = vec![0_u8; 257];
        let err = Key::from_parts(KeyVersion::V0, &[&over]).unwrap_err();
        assert_eq!(err, KeyError::PartTooLong { len: 257 });
    }

    #[test]
    fn v0_rejects_too_many_parts() {
        let part: &[u8] = b"x";
        let parts = vec![part; 256];
        let err = Key::from_parts(KeyVersion::V0, &parts).unwrap_err();
        assert_eq!(err, KeyError::TooManyParts { count: 256 });
    }

    #[test]
    fn v1_accepts_large_parts() {
        let long = vec![0xab_u8; 70_000];
        let k = key(KeyVersion::V1, &[&long]);
        let key_ref = k.parse().unwrap();
        assert_eq!(key_ref.len(), 1);
        assert_eq!(key_ref.parts()[0].len(), 70_000);
    }

    #[test]
    fn serialize_round_trip_v0() {
        let k = key(KeyVersion::V0, &[b"db", b"tbl", b"pk"]);
        let mut buf = Vec::new();
        k.serialize(&mut buf);
        assert_eq!(buf.len(), k.serial_size());
        let (back, end) = Key::deserialize(KeyVersion::V0, &buf, 0).unwrap();
        assert_eq!(back, k);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn serialize_round_trip_v1() {
        let k = key(KeyVersion::V1, &[b"schema", &[0_u8; 300], b""]);
        let mut buf = Vec::new();
        k.serialize(&mut buf);
        assert_eq!(buf.len(), k.serial_size());
        let (back, end) = Key::deserialize(KeyVersion::V1, &buf, 0).unwrap();
        assert_eq!(back, k);
        assert_eq!(end, buf.len());
    }

    #[test]
    fn deserialize_rejects_truncation() {
        let k = key(KeyVersion::V1, &[b"db", b"tbl"]);
        let mut buf = Vec::new();
        k.serialize(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(Key::deserialize(KeyVersion::V1, &buf, 0).is_err());
    }

    #[test]
    fn deserialize_rejects_corrupt_part_length() {
        // Outer framing says 3 bytes, inner part length claims 200.
        let buf = [3_u8, 0, 200, 1, 2];
        let err = Key::deserialize(KeyVersion::V0, &buf, 0).unwrap_err();
        assert!(matches!(err, KeyError::Malformed { .. }));
    }

    #[test]
    fn equal_keys_hash_equal() {
        let a = key(KeyVersion::V1, &[b"db", b"t", b"42"]);
        let b = key(KeyVersion::V1, &[b"db", b"t", b"42"]);
        let c = key(KeyVersion::V1, &[b"db", b"t", b"43"]);
        assert_eq!(a, b);
        assert_eq!(a.index_hash(), b.index_hash());
        assert_ne!(a, c);
    }

    #[test]
    fn empty_key_round_trips() {
        let k = key(KeyVersion::V0, &[]);
        let mut buf = Vec::new();
        k.serialize(&mut buf);
        let (back, _) = Key::deserialize(KeyVersion::V0, &buf, 0).unwrap();
        assert_eq!(back, k);
        assert!(back.parse().unwrap().is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_parts() -> impl Strategy<Value = Vec<Vec<u8>>> {
            prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..8)
        }

        proptest! {
            #[test]
            fn round_trip_is_identity(parts in arb_parts(), v1 in any::<bool>()) {
                let version = if v1 { KeyVersion::V1 } else { KeyVersion::V0 };
                let refs: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
                let k = Key::from_parts(version, &refs).unwrap();
                let mut buf = Vec::new();
                k.serialize(&mut buf);
                let (back, end) = Key::deserialize(version, &buf, 0).unwrap();
                prop_assert_eq!(end, buf.len());
                prop_assert_eq!(&back, &k);
                let parsed = back.parse().unwrap();
                prop_assert_eq!(parsed.parts(), refs.as_slice());
            }
        }
    }
}
