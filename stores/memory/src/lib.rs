use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use xsp_core::{
    Cryptor, EncryptedObj, KeyDerivParams, ObjId, Storage, StorageError, StorageResult,
    StorageType, SyncedStorage, XChaChaCryptor,
};

/// Versions of one object held in memory.
#[derive(Debug, Default)]
struct ObjVersions {
    current: u64,
    versions: BTreeMap<u64, EncryptedObj>,
}

/// In-memory [`Storage`] of any [`StorageType`].
///
/// A `Synced` memory storage keeps every version it has seen and acts as a
/// [`SyncedStorage`]; versions "arriving from the server" are injected with
/// [`MemoryStorage::push_remote_version`]. Other types keep only the current
/// version.
#[derive(Debug)]
pub struct MemoryStorage {
    storage_type: StorageType,
    objs: Arc<DashMap<ObjId, ObjVersions>>,
    linked: DashMap<(StorageType, Option<String>), Arc<dyn Storage>>,
    cryptor: Arc<dyn Cryptor>,
    key_deriv_params: KeyDerivParams,
}

impl MemoryStorage {
    /// Creates a new, empty `MemoryStorage`.
    pub fn new(storage_type: StorageType) -> Self {
        Self {
            storage_type,
            objs: Arc::new(DashMap::new()),
            linked: DashMap::new(),
            cryptor: Arc::new(XChaChaCryptor),
            key_deriv_params: KeyDerivParams {
                salt: vec![0u8; 16],
                log_n: 17,
                r: 8,
                p: 1,
            },
        }
    }

    pub fn with_key_deriv_params(mut self, params: KeyDerivParams) -> Self {
        self.key_deriv_params = params;
        self
    }

    /// Another client of the same objects, as a second process on the same
    /// machine or server would see them. Linked storages are shared too.
    pub fn new_client(&self) -> Self {
        let linked = self
            .linked
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Self {
            storage_type: self.storage_type,
            objs: self.objs.clone(),
            linked,
            cryptor: self.cryptor.clone(),
            key_deriv_params: self.key_deriv_params.clone(),
        }
    }

    /// Registers the storage that links of `storage_type` resolve in.
    /// `location` narrows the registration to links carrying that location.
    pub fn link_storage(
        &self,
        storage_type: StorageType,
        location: Option<&str>,
        storage: Arc<dyn Storage>,
    ) {
        self.linked
            .insert((storage_type, location.map(str::to_owned)), storage);
    }

    /// Records a version as known to the server without making it current.
    pub fn push_remote_version(&self, obj_id: &ObjId, obj: EncryptedObj) {
        self.objs
            .entry(obj_id.clone())
            .or_default()
            .versions
            .insert(obj.version, obj);
    }

    /// Number of objects currently stored.
    pub fn obj_count(&self) -> usize {
        self.objs.len()
    }

    pub fn contains(&self, obj_id: &ObjId) -> bool {
        self.objs.contains_key(obj_id)
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    fn versioned(&self) -> bool {
        self.storage_type == StorageType::Synced
    }

    fn cryptor(&self) -> Arc<dyn Cryptor> {
        self.cryptor.clone()
    }

    async fn generate_new_obj_id(&self) -> StorageResult<ObjId> {
        loop {
            let id = ObjId::random();
            if !self.objs.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    async fn get_obj(&self, obj_id: &ObjId) -> StorageResult<EncryptedObj> {
        let entry = self
            .objs
            .get(obj_id)
            .ok_or_else(|| StorageError::ObjNotFound(obj_id.clone()))?;
        entry
            .versions
            .get(&entry.current)
            .cloned()
            .ok_or_else(|| StorageError::ObjNotFound(obj_id.clone()))
    }

    async fn save_obj(&self, obj_id: &ObjId, obj: EncryptedObj) -> StorageResult<()> {
        let versioned = self.versioned();
        match self.objs.entry(obj_id.clone()) {
            Entry::Vacant(vacant) => {
                if obj.version != 1 {
                    return Err(StorageError::ObjNotFound(obj_id.clone()));
                }
                let mut versions = BTreeMap::new();
                versions.insert(1, obj);
                vacant.insert(ObjVersions {
                    current: 1,
                    versions,
                });
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if obj.version == 1 && entry.current != 0 {
                    return Err(StorageError::ObjExists(obj_id.clone()));
                }
                if obj.version != entry.current + 1 {
                    return Err(StorageError::ConcurrentTransaction(obj_id.clone()));
                }
                entry.current = obj.version;
                entry.versions.insert(obj.version, obj);
                if !versioned {
                    let current = entry.current;
                    entry.versions.retain(|v, _| *v == current);
                }
            }
        }
        tracing::trace!("memory storage: saved {obj_id}");
        Ok(())
    }

    async fn remove_obj(&self, obj_id: &ObjId) -> StorageResult<()> {
        self.objs.remove(obj_id);
        Ok(())
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
            "no {storage_type} storage linked to this {} storage",
            self.storage_type
        )))
    }

    fn as_synced(&self) -> Option<&dyn SyncedStorage> {
        if self.storage_type == StorageType::Synced {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl SyncedStorage for MemoryStorage {
    async fn get_root_key_deriv_params_from_server(&self) -> StorageResult<KeyDerivParams> {
        Ok(self.key_deriv_params.clone())
    }

    async fn set_current_synced_version(
        &self,
        obj_id: &ObjId,
        version: u64,
    ) -> StorageResult<()> {
        let mut entry = self
            .objs
            .get_mut(obj_id)
            .ok_or_else(|| StorageError::ObjNotFound(obj_id.clone()))?;
        if !entry.versions.contains_key(&version) {
            return Err(StorageError::ObjNotFound(obj_id.clone()));
        }
        entry.current = version;
        Ok(())
    }

    async fn get_synced_obj_version(
        &self,
        obj_id: &ObjId,
        version: u64,
    ) -> StorageResult<EncryptedObj> {
        self.objs
            .get(obj_id)
            .and_then(|entry| entry.versions.get(&version).cloned())
            .ok_or_else(|| StorageError::ObjNotFound(obj_id.clone()))
    }
}
