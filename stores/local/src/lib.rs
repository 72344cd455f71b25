use anyhow::{Context, anyhow};
use bytes::Bytes;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use xsp_core::{
    Cryptor, EncryptedObj, ObjId, Storage, StorageError, StorageResult, StorageType,
    XChaChaCryptor,
};

fn default_storage_type() -> StorageType {
    StorageType::Local
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalStorageConfig {
    pub base_path: String,
    #[serde(default = "default_storage_type")]
    pub storage_type: StorageType,
}

/// [`Storage`] keeping the current version of every object as one file
/// under `base_path`. Not versioned: a save replaces the previous version.
#[derive(Debug)]
pub struct LocalStorage {
    base_path: PathBuf,
    storage_type: StorageType,
    cryptor: Arc<dyn Cryptor>,
    linked: DashMap<(StorageType, Option<String>), Arc<dyn Storage>>,
    // serializes the read-check-write of save_obj
    write_lock: Mutex<()>,
}

impl LocalStorage {
    pub fn new(base_path: impl Into<PathBuf>, storage_type: StorageType) -> Self {
        LocalStorage {
            base_path: base_path.into(),
            storage_type,
            cryptor: Arc::new(XChaChaCryptor),
            linked: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn create(config: LocalStorageConfig) -> Self {
        Self::new(config.base_path, config.storage_type)
    }

    /// Registers the storage that links of `storage_type` resolve in.
    pub fn link_storage(
        &self,
        storage_type: StorageType,
        location: Option<&str>,
        storage: Arc<dyn Storage>,
    ) {
        self.linked
            .insert((storage_type, location.map(str::to_owned)), storage);
    }

    fn resolve_path(&self, obj_id: &ObjId) -> StorageResult<PathBuf> {
        let id = obj_id.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow!("Invalid object id: '{id}'.").into());
        }
        Ok(self.base_path.join("objs").join(id))
    }

    async fn read_current(&self, obj_id: &ObjId) -> StorageResult<Option<EncryptedObj>> {
        let path = self.resolve_path(obj_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let obj = EncryptedObj::from_bytes(Bytes::from(bytes))
                    .with_context(|| format!("corrupt object file {}", path.display()))?;
                Ok(Some(obj))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl Storage for LocalStorage {
    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    fn versioned(&self) -> bool {
        false
    }

    fn cryptor(&self) -> Arc<dyn Cryptor> {
        self.cryptor.clone()
    }

    async fn generate_new_obj_id(&self) -> StorageResult<ObjId> {
        loop {
            let id = ObjId::random();
            if !tokio::fs::try_exists(self.resolve_path(&id)?).await? {
                return Ok(id);
            }
        }
    }

    async fn get_obj(&self, obj_id: &ObjId) -> StorageResult<EncryptedObj> {
        self.read_current(obj_id)
            .await?
            .ok_or_else(|| StorageError::ObjNotFound(obj_id.clone()))
    }

    async fn save_obj(&self, obj_id: &ObjId, obj: EncryptedObj) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let current = self.read_current(obj_id).await?;
        match (&current, obj.version) {
            (Some(_), 1) => return Err(StorageError::ObjExists(obj_id.clone())),
            (None, 1) => {}
            (None, _) => return Err(StorageError::ObjNotFound(obj_id.clone())),
            (Some(current), version) if version != current.version + 1 => {
                return Err(StorageError::ConcurrentTransaction(obj_id.clone()));
            }
            (Some(_), _) => {}
        }

        let full_path = self.resolve_path(obj_id)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = full_path.with_extension("tmp");
        tokio::fs::write(&temp_path, obj.to_bytes()).await?;
        tokio::fs::rename(&temp_path, &full_path).await?;
        tracing::trace!("local storage: saved {obj_id} v{}", obj.version);
        Ok(())
    }

    async fn remove_obj(&self, obj_id: &ObjId) -> StorageResult<()> {
        let full_path = self.resolve_path(obj_id)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn storage_for_linking(
        &self,
        storage_type: StorageType,
        location: Option<&str>,
    ) -> StorageResult<Arc<dyn Storage>> {
        let exact = (storage_type, location.map(str::to_owned));
        if let Some(storage) = self.linked.get(&exact) {
            return Ok(storage.clone());
        }
        if let Some(storage) = self.linked.get(&(storage_type, None)) {
            return Ok(storage.clone());
        }
        Err(StorageError::NotSupported(format!(
            "no {storage_type} storage linked to {}",
            self.base_path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xsp_core::testutil::StorageTests;

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path(), StorageType::Local);
        StorageTests::new(&storage).run_all().await.unwrap();
    }

    #[tokio::test]
    async fn objects_survive_reopening() {
        let temp_dir = tempfile::tempdir().unwrap();
        let id = ObjId::root();
        let obj = EncryptedObj::new(1, vec![1u8; 40], vec![2u8; 64]);
        {
            let storage = LocalStorage::new(temp_dir.path(), StorageType::Local);
            storage.save_obj(&id, obj.clone()).await.unwrap();
        }
        let storage = LocalStorage::create(LocalStorageConfig {
            base_path: temp_dir.path().to_string_lossy().into(),
            storage_type: StorageType::Local,
        });
        assert_eq!(storage.get_obj(&id).await.unwrap(), obj);
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path(), StorageType::Local);
        assert!(storage.get_obj(&ObjId::new("../etc")).await.is_err());
    }
}
