//! Storage handle shared by every node of one tree.

use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Weak};
use xsp_core::{
    Cryptor, EncryptedObj, ObjId, Storage, StorageResult, StorageType, SyncedStorage,
};

use crate::nodes::NodesContainer;
use crate::FsResult;

/// Live storages by backend address. At most one per backend, so every
/// tree and link over the same backend shares one node registry.
static LIVE: LazyLock<DashMap<usize, Weak<Inner>>> = LazyLock::new(DashMap::new);

fn backend_addr(backend: &Arc<dyn Storage>) -> usize {
    Arc::as_ptr(backend) as *const () as usize
}

/// A storage backend together with the registry of nodes instantiated from
/// it. Cloning shares both.
#[derive(Clone)]
pub struct FsStorage {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Storage>,
    nodes: NodesContainer,
}

impl Drop for Inner {
    fn drop(&mut self) {
        LIVE.remove_if(&backend_addr(&self.backend), |_, live| {
            live.strong_count() == 0
        });
    }
}

impl fmt::Debug for FsStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsStorage")
            .field("type", &self.storage_type())
            .field("nodes", &self.inner.nodes)
            .finish()
    }
}

impl FsStorage {
    /// The storage wrapping `backend`, shared with every other user of the
    /// same backend while any of them is alive.
    pub fn for_backend(backend: Arc<dyn Storage>) -> Self {
        let mut live = LIVE.entry(backend_addr(&backend)).or_default();
        if let Some(inner) = live.upgrade() {
            return Self { inner };
        }
        let inner = Arc::new(Inner {
            backend,
            nodes: NodesContainer::new(),
        });
        *live = Arc::downgrade(&inner);
        Self { inner }
    }

    pub fn storage_type(&self) -> StorageType {
        self.inner.backend.storage_type()
    }

    pub fn versioned(&self) -> bool {
        self.inner.backend.versioned()
    }

    pub fn cryptor(&self) -> Arc<dyn Cryptor> {
        self.inner.backend.cryptor()
    }

    pub fn nodes(&self) -> &NodesContainer {
        &self.inner.nodes
    }

    pub fn backend(&self) -> &Arc<dyn Storage> {
        &self.inner.backend
    }

    pub fn same_as(&self, other: &FsStorage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a fresh id and reserves it in the node registry, so no other
    /// creation in this process can pick it before the first save lands.
    pub async fn generate_new_obj_id(&self) -> FsResult<ObjId> {
        loop {
            let obj_id = self.inner.backend.generate_new_obj_id().await?;
            if self.inner.nodes.reserve_id(&obj_id) {
                return Ok(obj_id);
            }
            tracing::debug!(%obj_id, "generated id is in use by a live node, retrying");
        }
    }

    pub async fn get_obj(&self, obj_id: &ObjId) -> StorageResult<EncryptedObj> {
        self.inner.backend.get_obj(obj_id).await
    }

    pub async fn save_obj(&self, obj_id: &ObjId, obj: EncryptedObj) -> StorageResult<()> {
        self.inner.backend.save_obj(obj_id, obj).await
    }

    pub async fn remove_obj(&self, obj_id: &ObjId) -> StorageResult<()> {
        self.inner.backend.remove_obj(obj_id).await
    }

    pub fn as_synced(&self) -> Option<&dyn SyncedStorage> {
        self.inner.backend.as_synced()
    }

    /// The storage links of `storage_type` resolve in. A sibling backend that
    /// already backs a tree resolves to that tree's storage, so its nodes stay
    /// unique whichever way they are reached.
    pub async fn storage_for_linking(
        &self,
        storage_type: StorageType,
        location: Option<&str>,
    ) -> FsResult<FsStorage> {
        let backend = self
            .inner
            .backend
            .storage_for_linking(storage_type, location)
            .await?;
        Ok(FsStorage::for_backend(backend))
    }

    /// Drops every live node and closes the backend. Opening the backend
    /// again afterwards starts from a fresh registry.
    pub async fn close(&self) -> FsResult<()> {
        let this = Arc::as_ptr(&self.inner);
        LIVE.remove_if(&backend_addr(&self.inner.backend), |_, live| {
            live.as_ptr() == this
        });
        self.inner.nodes.clear();
        self.inner.backend.close().await?;
        Ok(())
    }
}
