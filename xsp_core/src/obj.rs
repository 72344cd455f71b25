//! Object ids and the encrypted object payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key under which one encrypted object lives in a [`Storage`](crate::Storage).
///
/// Generated ids are 32 lowercase hex characters, so they never collide with
/// the fixed id of a tree's root folder.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjId(String);

impl ObjId {
    const ROOT: &'static str = "root";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the root folder object of a tree.
    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    /// Fresh random id. Uniqueness against ids already in use is the
    /// caller's concern (storages check their own contents, the filesystem
    /// additionally reserves the id in its node registry).
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn is_root(&self) -> bool {
        self.0 == Self::ROOT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjId").field(&self.0).finish()
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ObjId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One version of an encrypted object, as handed to and read from storage.
///
/// `header` starts with the object's plaintext zeroth nonce followed by the
/// sealed header; `segments` is the concatenation of sealed segments. The
/// filesystem layer produces and consumes these through its node crypto; a
/// storage treats both byte ranges as opaque.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedObj {
    pub version: u64,
    pub header: Bytes,
    pub segments: Bytes,
}

impl fmt::Debug for EncryptedObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedObj")
            .field("version", &self.version)
            .field("header_len", &self.header.len())
            .field("segments_len", &self.segments.len())
            .finish()
    }
}

impl EncryptedObj {
    pub fn new(version: u64, header: impl Into<Bytes>, segments: impl Into<Bytes>) -> Self {
        Self {
            version,
            header: header.into(),
            segments: segments.into(),
        }
    }

    /// Serialized form used by file-backed storages:
    /// `version (u64 BE) || header_len (u32 BE) || header || segments`.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.header.len() + self.segments.len());
        buf.put_u64(self.version);
        buf.put_u32(self.header.len() as u32);
        buf.put_slice(&self.header);
        buf.put_slice(&self.segments);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        let version = bytes.get_u64();
        let header_len = bytes.get_u32() as usize;
        if bytes.len() < header_len {
            return None;
        }
        let header = bytes.split_to(header_len);
        Some(Self {
            version,
            header,
            segments: bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_hex_and_never_root() {
        let id = ObjId::random();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!id.is_root());
        assert!(ObjId::root().is_root());
    }

    #[test]
    fn serialized_obj_survives_file_encoding() {
        let obj = EncryptedObj::new(7, vec![1u8, 2, 3], vec![9u8; 40]);
        let decoded = EncryptedObj::from_bytes(obj.to_bytes()).unwrap();
        assert_eq!(decoded, obj);
    }

    #[test]
    fn truncated_obj_bytes_are_rejected() {
        let obj = EncryptedObj::new(1, vec![0u8; 30], Bytes::new());
        let bytes = obj.to_bytes();
        assert!(EncryptedObj::from_bytes(bytes.slice(..20)).is_none());
        assert!(EncryptedObj::from_bytes(bytes.slice(..5)).is_none());
    }
}
