//! Binary format of a folder's plaintext content.
//!
//! ```text
//! version: u8 (= 1)
//! repeated per child:
//!   key:       32 bytes
//!   meta_len:  u32 BE
//!   meta:      JSON {"type": 1|2|3, "name": "...", "objId": "..."}
//! ```
//!
//! Children are kept in a `BTreeMap`, so encoding is deterministic and
//! `encode(decode(b)) == b` for every `b` produced here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use xsp_core::{KEY_LEN, ObjId, crypto::Key};
use zeroize::Zeroizing;

pub const FOLDER_FORMAT_V1: u8 = 1;

/// Object key shared between a parent's listing and the child's own crypto.
/// Zeroed when the last holder drops it.
pub type SharedKey = Arc<Zeroizing<Key>>;

pub fn shared_key(key: Key) -> SharedKey {
    Arc::new(Zeroizing::new(key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Folder,
    File,
    Link,
}

impl NodeKind {
    fn tag(self) -> u8 {
        match self {
            NodeKind::Folder => 1,
            NodeKind::File => 2,
            NodeKind::Link => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(NodeKind::Folder),
            2 => Some(NodeKind::File),
            3 => Some(NodeKind::Link),
            _ => None,
        }
    }
}

/// One child as recorded in its parent.
#[derive(Clone)]
pub struct NodeInfo {
    pub name: String,
    pub obj_id: ObjId,
    pub kind: NodeKind,
    pub key: SharedKey,
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInfo")
            .field("name", &self.name)
            .field("obj_id", &self.obj_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Child listing of a folder, keyed by child name.
#[derive(Debug, Clone, Default)]
pub struct FolderInfo {
    pub nodes: BTreeMap<String, NodeInfo>,
}

/// Public view of one child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    pub kind: NodeKind,
}

impl From<&NodeInfo> for ListingEntry {
    fn from(info: &NodeInfo) -> Self {
        ListingEntry {
            name: info.name.clone(),
            kind: info.kind,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EntryMeta {
    #[serde(rename = "type")]
    kind: u8,
    name: String,
    #[serde(rename = "objId")]
    obj_id: ObjId,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty folder content")]
    Empty,
    #[error("unsupported folder format version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated entry at offset {0}")]
    Truncated(usize),
    #[error("unknown node type {0}")]
    UnknownType(u8),
    #[error("invalid entry metadata: {0}")]
    Meta(#[from] serde_json::Error),
}

pub fn encode_folder_info(info: &FolderInfo) -> Vec<u8> {
    let mut out = vec![FOLDER_FORMAT_V1];
    for node in info.nodes.values() {
        let meta = EntryMeta {
            kind: node.kind.tag(),
            name: node.name.clone(),
            obj_id: node.obj_id.clone(),
        };
        // Serializing a struct of strings and integers cannot fail.
        let meta = serde_json::to_vec(&meta).unwrap_or_default();
        out.extend_from_slice(node.key.as_slice());
        out.extend_from_slice(&(meta.len() as u32).to_be_bytes());
        out.extend_from_slice(&meta);
    }
    out
}

pub fn decode_folder_info(bytes: &[u8]) -> Result<FolderInfo, CodecError> {
    let (&version, mut rest) = bytes.split_first().ok_or(CodecError::Empty)?;
    if version != FOLDER_FORMAT_V1 {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let mut nodes = BTreeMap::new();
    while !rest.is_empty() {
        let offset = bytes.len() - rest.len();
        if rest.len() < KEY_LEN + 4 {
            return Err(CodecError::Truncated(offset));
        }
        let (key_bytes, tail) = rest.split_at(KEY_LEN);
        let (len_bytes, tail) = tail.split_at(4);
        let mut len = [0u8; 4];
        len.copy_from_slice(len_bytes);
        let meta_len = u32::from_be_bytes(len) as usize;
        if tail.len() < meta_len {
            return Err(CodecError::Truncated(offset));
        }
        let (meta_bytes, tail) = tail.split_at(meta_len);
        let meta: EntryMeta = serde_json::from_slice(meta_bytes)?;
        let kind = NodeKind::from_tag(meta.kind).ok_or(CodecError::UnknownType(meta.kind))?;
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(key_bytes);
        nodes.insert(
            meta.name.clone(),
            NodeInfo {
                name: meta.name,
                obj_id: meta.obj_id,
                kind,
                key: Arc::new(key),
            },
        );
        rest = tail;
    }
    Ok(FolderInfo { nodes })
}
