//! Storage contracts consumed by the filesystem layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::crypto::Cryptor;
use crate::obj::{EncryptedObj, ObjId};

pub type StorageResult<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object {0} not found")]
    ObjNotFound(ObjId),
    #[error("object {0} already exists")]
    ObjExists(ObjId),
    #[error("concurrent transaction on object {0}")]
    ConcurrentTransaction(ObjId),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Kind of storage a tree lives in. Decides which link targets are reachable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Private storage on this device only.
    Local,
    /// Private storage mirrored to a server.
    Synced,
    /// Storage shared with other users.
    Share,
    /// The device's own filesystem, reachable only through links.
    Device,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageType::Local => "local",
            StorageType::Synced => "synced",
            StorageType::Share => "share",
            StorageType::Device => "device",
        })
    }
}

/// Opaque key-value store of versioned encrypted objects.
///
/// Save rules every implementation follows:
/// - version 1 of an id that already exists fails with
///   [`StorageError::ObjExists`];
/// - a later version of a missing id fails with [`StorageError::ObjNotFound`];
/// - a version that is not exactly one above the current one fails with
///   [`StorageError::ConcurrentTransaction`].
#[async_trait]
pub trait Storage: fmt::Debug + Send + Sync + 'static {
    fn storage_type(&self) -> StorageType;

    /// Whether older versions stay retrievable after a newer one is saved.
    fn versioned(&self) -> bool;

    fn cryptor(&self) -> Arc<dyn Cryptor>;

    /// Returns an id that is not in use by any object in this storage.
    async fn generate_new_obj_id(&self) -> StorageResult<ObjId>;

    /// Returns the current version of an object.
    async fn get_obj(&self, obj_id: &ObjId) -> StorageResult<EncryptedObj>;

    async fn save_obj(&self, obj_id: &ObjId, obj: EncryptedObj) -> StorageResult<()>;

    /// Removes the local copy of an object.
    async fn remove_obj(&self, obj_id: &ObjId) -> StorageResult<()>;

    /// Sibling storage of another type that links from this storage resolve in.
    async fn storage_for_linking(
        &self,
        storage_type: StorageType,
        location: Option<&str>,
    ) -> StorageResult<Arc<dyn Storage>>;

    /// The synced-storage extension, if this storage is backed by a server.
    fn as_synced(&self) -> Option<&dyn SyncedStorage> {
        None
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Parameters for deriving the root key from a passphrase, as stored on the
/// server of a synced storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDerivParams {
    pub salt: Vec<u8>,
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

/// Hooks into a server-mirrored storage, used for conflict resolution.
#[async_trait]
pub trait SyncedStorage: Storage {
    async fn get_root_key_deriv_params_from_server(&self) -> StorageResult<KeyDerivParams>;

    /// Makes `version` the current version of the object.
    async fn set_current_synced_version(&self, obj_id: &ObjId, version: u64)
    -> StorageResult<()>;

    /// Returns a specific version known to the server.
    async fn get_synced_obj_version(
        &self,
        obj_id: &ObjId,
        version: u64,
    ) -> StorageResult<EncryptedObj>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_type_names() {
        use serde::de::IntoDeserializer;
        use serde::de::value::{Error, StrDeserializer};

        assert_eq!(StorageType::Synced.to_string(), "synced");
        let de: StrDeserializer<'_, Error> = "share".into_deserializer();
        assert_eq!(StorageType::deserialize(de).unwrap(), StorageType::Share);
    }
}
