//! # XSP-FS
//!
//! Versioned, *end-to-end encrypted* folder tree stored as opaque objects.
//! Every folder, file and link is one object; a folder's content is the
//! encrypted listing of its children with their keys, so holding the root
//! key opens the whole tree and nothing else does.
//!
//! ## Layers
//! 1. `codec`  – folder listing format (pure data).
//! 2. `crypto` – per-node keys, segmented XChaCha20-Poly1305 objects.
//! 3. `nodes`  – registry keeping one live node per object id.
//! 4. `folder` / `file` / `link` – node kinds; each change is a transaction
//!    that saves `version + 1` of the node's object.
//! 5. `api`    – path-based façade ([`XspFs`]) that applications use.
//! 6. `config` – TOML wiring of storages.

mod api;
pub mod codec;
pub mod config;
pub mod crypto;
mod error;
mod file;
mod file_object;
mod folder;
pub mod link;
mod node;
mod nodes;
pub mod path;
mod spawn;
mod storage;

pub use api::XspFs;
pub use codec::{ListingEntry, NodeKind};
pub use error::{FsError, FsResult};
pub use file::{FileByteSource, FileNode, FileSink};
pub use file_object::FileObject;
pub use folder::FolderNode;
pub use link::{LinkNode, LinkParameters, ResolvedLink};
pub use node::{EventSource, NodeEvent, NodeEventKind, Stats, TxMode};
pub use nodes::{Node, NodeOrPromise, NodesContainer};
pub use storage::FsStorage;

/// Derives the root folder key from a shared secret.
///
/// `root_key` = BLAKE3 derive_key("xsp/fs/root-folder/xchacha20", secret)
pub fn derive_root_key(secret: &[u8]) -> [u8; 32] {
    blake3::derive_key("xsp/fs/root-folder/xchacha20", secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_key_is_deterministic_per_secret() {
        assert_eq!(derive_root_key(b"a"), derive_root_key(b"a"));
        assert_ne!(derive_root_key(b"a"), derive_root_key(b"b"));
    }
}
