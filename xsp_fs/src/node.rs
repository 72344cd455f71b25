//! State and behavior shared by every node kind.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex as TxQueue, OwnedMutexGuard, broadcast};
use xsp_core::{EncryptedObj, ObjId};

use crate::codec::ListingEntry;
use crate::nodes::Node;
use crate::storage::FsStorage;
use crate::{FsError, FsResult};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What to do when another transaction holds the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxMode {
    /// Queue behind the running transaction.
    #[default]
    Wait,
    /// Fail with [`FsError::ConcurrentUpdate`].
    FailIfBusy,
}

/// Held for the duration of a node transaction.
pub type TxGuard = OwnedMutexGuard<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Change made through this process.
    Local,
    /// Change absorbed from storage (another process or the server).
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeEventKind {
    FileChange,
    EntryAddition { entry: ListingEntry },
    EntryRemoval { entry: ListingEntry },
    EntryRenaming { old_name: String, new_name: String },
    /// Last event of a node; the channel closes after it.
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeEvent {
    pub obj_id: ObjId,
    pub version: u64,
    pub source: EventSource,
    pub kind: NodeEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub is_file: bool,
    pub is_folder: bool,
    pub is_link: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub version: u64,
}

/// Identity, position and transaction queue of a node.
///
/// All mutations of a node run while holding its [`TxGuard`], so at most one
/// transaction per node is in flight.
#[derive(Debug)]
pub(crate) struct NodeCore {
    storage: FsStorage,
    obj_id: ObjId,
    name: RwLock<String>,
    parent_id: RwLock<Option<ObjId>>,
    version: AtomicU64,
    tx_queue: Arc<TxQueue<()>>,
    events: Mutex<Option<broadcast::Sender<NodeEvent>>>,
}

impl NodeCore {
    pub fn new(
        storage: FsStorage,
        obj_id: ObjId,
        parent_id: Option<ObjId>,
        name: String,
        version: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            obj_id,
            name: RwLock::new(name),
            parent_id: RwLock::new(parent_id),
            version: AtomicU64::new(version),
            tx_queue: Arc::new(TxQueue::new(())),
            events: Mutex::new(Some(events)),
        }
    }

    pub fn storage(&self) -> &FsStorage {
        &self.storage
    }

    pub fn obj_id(&self) -> &ObjId {
        &self.obj_id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn parent_id(&self) -> Option<ObjId> {
        self.parent_id.read().clone()
    }

    /// Records a new position after a rename or move.
    pub fn relocate(&self, parent_id: Option<ObjId>, name: &str) {
        *self.parent_id.write() = parent_id;
        *self.name.write() = name.to_string();
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    pub async fn begin_tx(&self, mode: TxMode) -> FsResult<TxGuard> {
        match mode {
            TxMode::Wait => Ok(self.tx_queue.clone().lock_owned().await),
            TxMode::FailIfBusy => self.tx_queue.clone().try_lock_owned().map_err(|_| {
                FsError::ConcurrentUpdate {
                    path: self.name(),
                }
            }),
        }
    }

    /// `None` once the node has been removed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<NodeEvent>> {
        self.events.lock().as_ref().map(|tx| tx.subscribe())
    }

    pub fn emit(&self, source: EventSource, kind: NodeEventKind) {
        self.emit_at(self.version(), source, kind);
    }

    pub fn emit_at(&self, version: u64, source: EventSource, kind: NodeEventKind) {
        if let Some(tx) = self.events.lock().as_ref() {
            // No receivers is not an error.
            let _ = tx.send(NodeEvent {
                obj_id: self.obj_id.clone(),
                version,
                source,
                kind,
            });
        }
    }

    /// Sends the final `Removed` event and closes the channel.
    fn emit_removal(&self) {
        let Some(tx) = self.events.lock().take() else {
            return;
        };
        let _ = tx.send(NodeEvent {
            obj_id: self.obj_id.clone(),
            version: self.version(),
            source: EventSource::Local,
            kind: NodeEventKind::Removed,
        });
    }

    fn storage_err(&self, err: xsp_core::StorageError) -> FsError {
        match FsError::from(err) {
            FsError::Storage(e) => FsError::Storage(e),
            other => other.at_path(&self.name()),
        }
    }

    pub async fn get_obj(&self) -> FsResult<EncryptedObj> {
        self.storage
            .get_obj(&self.obj_id)
            .await
            .map_err(|e| self.storage_err(e))
    }

    pub async fn save_obj(&self, obj: EncryptedObj) -> FsResult<()> {
        self.storage
            .save_obj(&self.obj_id, obj)
            .await
            .map_err(|e| self.storage_err(e))
    }

    /// Removes the backing object, unregisters `node` and closes the event
    /// channel. Caller holds the transaction guard.
    pub async fn retire(&self, node: &Node) -> FsResult<()> {
        self.storage
            .remove_obj(&self.obj_id)
            .await
            .map_err(|e| self.storage_err(e))?;
        self.storage.nodes().delete(node);
        self.emit_removal();
        Ok(())
    }

    /// Fetches `remote_version` from the synced storage and makes it current.
    /// Returns `None` if the node is already at or past that version.
    ///
    /// Runs outside the transaction queue; callers must not have a local
    /// transaction pending on this node.
    pub async fn adopt_synced_version(
        &self,
        remote_version: u64,
    ) -> FsResult<Option<EncryptedObj>> {
        let synced = self.storage.as_synced().ok_or_else(|| {
            FsError::Storage(Arc::new(xsp_core::StorageError::NotSupported(format!(
                "conflict resolution on {} storage",
                self.storage.storage_type()
            ))))
        })?;
        if remote_version <= self.version() {
            return Ok(None);
        }
        let obj = synced
            .get_synced_obj_version(&self.obj_id, remote_version)
            .await
            .map_err(|e| self.storage_err(e))?;
        synced
            .set_current_synced_version(&self.obj_id, remote_version)
            .await
            .map_err(|e| self.storage_err(e))?;
        Ok(Some(obj))
    }
}
