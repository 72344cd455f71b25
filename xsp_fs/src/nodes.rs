//! Registry of live nodes with single-flight instantiation.
//!
//! Every object id maps to at most one live node. An id is in one of three
//! states: reserved for a node being created, loading (a shared future all
//! concurrent callers await), or ready. The state check and the transition
//! happen under one map entry, so two callers can never both start loading
//! the same id.

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use xsp_core::ObjId;

use crate::codec::NodeKind;
use crate::crypto::NodeCrypto;
use crate::file::FileNode;
use crate::folder::FolderNode;
use crate::link::LinkNode;
use crate::node::{NodeCore, NodeEvent, Stats, TxMode};
use crate::{FsError, FsResult};

/// Pending instantiation shared by every caller that asked for the node.
pub type NodeFuture = Shared<BoxFuture<'static, FsResult<Node>>>;

/// A live node of any kind.
#[derive(Clone, Debug)]
pub enum Node {
    File(Arc<FileNode>),
    Folder(Arc<FolderNode>),
    Link(Arc<LinkNode>),
}

impl Node {
    pub(crate) fn core(&self) -> &NodeCore {
        match self {
            Node::File(n) => n.core(),
            Node::Folder(n) => n.core(),
            Node::Link(n) => n.core(),
        }
    }

    pub fn obj_id(&self) -> &ObjId {
        self.core().obj_id()
    }

    pub fn name(&self) -> String {
        self.core().name()
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::File(_) => NodeKind::File,
            Node::Folder(_) => NodeKind::Folder,
            Node::Link(_) => NodeKind::Link,
        }
    }

    pub fn version(&self) -> u64 {
        self.core().version()
    }

    pub fn stats(&self) -> Stats {
        match self {
            Node::File(n) => n.stats(),
            Node::Folder(n) => n.stats(),
            Node::Link(n) => n.stats(),
        }
    }

    /// Identity, not equality of content.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::File(a), Node::File(b)) => Arc::ptr_eq(a, b),
            (Node::Folder(a), Node::Folder(b)) => Arc::ptr_eq(a, b),
            (Node::Link(a), Node::Link(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<NodeEvent>> {
        self.core().subscribe()
    }

    pub(crate) fn node_crypto(&self) -> &NodeCrypto {
        match self {
            Node::File(n) => &**n.crypto(),
            Node::Folder(n) => &**n.crypto(),
            Node::Link(n) => &**n.crypto(),
        }
    }

    /// Boxed: folder deletes spawn deletes of their children.
    pub fn delete(&self, mode: TxMode) -> BoxFuture<'static, FsResult<()>> {
        let node = self.clone();
        async move {
            match &node {
                Node::File(n) => n.delete(mode).await,
                Node::Folder(n) => n.delete(mode).await,
                Node::Link(n) => n.delete(mode).await,
            }
        }
        .boxed()
    }

    pub async fn absorb_external_change(&self) -> FsResult<bool> {
        match self {
            Node::File(n) => n.absorb_external_change().await,
            Node::Folder(n) => n.absorb_external_change().await,
            Node::Link(n) => n.absorb_external_change().await,
        }
    }

    pub async fn resolve_conflict(&self, remote_version: u64) -> FsResult<bool> {
        match self {
            Node::File(n) => n.resolve_conflict(remote_version).await,
            Node::Folder(n) => n.resolve_conflict(remote_version).await,
            Node::Link(n) => n.resolve_conflict(remote_version).await,
        }
    }

    pub fn into_file(self) -> FsResult<Arc<FileNode>> {
        match self {
            Node::File(n) => Ok(n),
            other => Err(FsError::not_file(other.name())),
        }
    }

    pub fn into_folder(self) -> FsResult<Arc<FolderNode>> {
        match self {
            Node::Folder(n) => Ok(n),
            other => Err(FsError::not_directory(other.name())),
        }
    }

    pub fn into_link(self) -> FsResult<Arc<LinkNode>> {
        match self {
            Node::Link(n) => Ok(n),
            other => Err(FsError::not_link(other.name())),
        }
    }
}

enum Slot {
    Reserved,
    Loading(NodeFuture),
    Ready(Node),
}

/// Answer of [`NodesContainer::get_node_or_promise`].
pub enum NodeOrPromise {
    Node(Node),
    Promise(NodeFuture),
}

#[derive(Clone, Default)]
pub struct NodesContainer {
    slots: Arc<DashMap<ObjId, Slot>>,
}

impl fmt::Debug for NodesContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodesContainer")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl NodesContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, obj_id: &ObjId) -> Option<Node> {
        match self.slots.get(obj_id)?.value() {
            Slot::Ready(node) => Some(node.clone()),
            _ => None,
        }
    }

    pub fn get_node_or_promise(&self, obj_id: &ObjId) -> Option<NodeOrPromise> {
        match self.slots.get(obj_id)?.value() {
            Slot::Ready(node) => Some(NodeOrPromise::Node(node.clone())),
            Slot::Loading(fut) => Some(NodeOrPromise::Promise(fut.clone())),
            Slot::Reserved => None,
        }
    }

    /// Registers a live node. Fails if another node already holds the id.
    pub fn set(&self, node: Node) -> FsResult<()> {
        match self.slots.entry(node.obj_id().clone()) {
            Entry::Occupied(mut e) => {
                if let Slot::Ready(existing) = e.get() {
                    if !existing.ptr_eq(&node) {
                        return Err(FsError::inconsistent(
                            node.obj_id().to_string(),
                            "a different node is already registered for this object",
                        ));
                    }
                    return Ok(());
                }
                e.insert(Slot::Ready(node));
            }
            Entry::Vacant(e) => {
                e.insert(Slot::Ready(node));
            }
        }
        Ok(())
    }

    /// Registers an in-flight instantiation and returns the handle callers
    /// await. On success the node replaces the promise; on failure the id is
    /// freed so a later call can retry.
    pub fn set_promise(
        &self,
        obj_id: &ObjId,
        load: BoxFuture<'static, FsResult<Node>>,
    ) -> FsResult<NodeFuture> {
        match self.slots.entry(obj_id.clone()) {
            Entry::Occupied(mut e) => {
                if !matches!(e.get(), Slot::Reserved) {
                    return Err(FsError::inconsistent(
                        obj_id.to_string(),
                        "object is already loading or loaded",
                    ));
                }
                let fut = self.settle_on_completion(obj_id.clone(), load);
                e.insert(Slot::Loading(fut.clone()));
                Ok(fut)
            }
            Entry::Vacant(e) => {
                let fut = self.settle_on_completion(obj_id.clone(), load);
                e.insert(Slot::Loading(fut.clone()));
                Ok(fut)
            }
        }
    }

    /// Returns the live node for `obj_id`, instantiating it with `load` if
    /// nobody has yet. Concurrent callers share one instantiation.
    pub async fn get_or_load<F>(&self, obj_id: &ObjId, load: F) -> FsResult<Node>
    where
        F: FnOnce() -> BoxFuture<'static, FsResult<Node>>,
    {
        let pending = match self.slots.entry(obj_id.clone()) {
            Entry::Occupied(mut e) => {
                let existing = match e.get() {
                    Slot::Ready(node) => return Ok(node.clone()),
                    Slot::Loading(fut) => Some(fut.clone()),
                    Slot::Reserved => None,
                };
                match existing {
                    Some(fut) => fut,
                    None => {
                        let fut = self.settle_on_completion(obj_id.clone(), load());
                        e.insert(Slot::Loading(fut.clone()));
                        fut
                    }
                }
            }
            Entry::Vacant(e) => {
                let fut = self.settle_on_completion(obj_id.clone(), load());
                e.insert(Slot::Loading(fut.clone()));
                fut
            }
        };
        pending.await
    }

    fn settle_on_completion(
        &self,
        obj_id: ObjId,
        load: BoxFuture<'static, FsResult<Node>>,
    ) -> NodeFuture {
        let slots: Weak<DashMap<ObjId, Slot>> = Arc::downgrade(&self.slots);
        async move {
            let result = load.await;
            if let Some(slots) = slots.upgrade() {
                match &result {
                    Ok(node) => {
                        slots.insert(obj_id, Slot::Ready(node.clone()));
                    }
                    Err(err) => {
                        tracing::debug!(%obj_id, %err, "node instantiation failed");
                        slots.remove_if(&obj_id, |_, slot| matches!(slot, Slot::Loading(_)));
                    }
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Claims an id for a node about to be created. Returns `false` if the
    /// id is already known.
    pub fn reserve_id(&self, obj_id: &ObjId) -> bool {
        match self.slots.entry(obj_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(Slot::Reserved);
                true
            }
        }
    }

    pub fn release_reservation(&self, obj_id: &ObjId) {
        self.slots
            .remove_if(obj_id, |_, slot| matches!(slot, Slot::Reserved));
    }

    /// Unregisters `node`, only if it is the node registered under its id.
    pub fn delete(&self, node: &Node) -> bool {
        self.slots
            .remove_if(node.obj_id(), |_, slot| {
                matches!(slot, Slot::Ready(existing) if existing.ptr_eq(node))
            })
            .is_some()
    }

    pub fn is_reserved(&self, obj_id: &ObjId) -> bool {
        self.slots
            .get(obj_id)
            .is_some_and(|slot| matches!(slot.value(), Slot::Reserved))
    }

    /// Number of live nodes.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
            .count()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::shared_key;
    use crate::storage::FsStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use xsp_core::StorageType;
    use xsp_store_memory::MemoryStorage;

    fn storage() -> FsStorage {
        FsStorage::for_backend(Arc::new(MemoryStorage::new(StorageType::Local)))
    }

    fn file_node(storage: &FsStorage, id: &str) -> Node {
        Node::File(FileNode::new_unsaved(
            storage.clone(),
            ObjId::new(id),
            None,
            id.to_string(),
            shared_key([1u8; 32]),
        ))
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_instantiation() {
        let storage = storage();
        let container = storage.nodes().clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = ObjId::new("f1");

        let loader = || {
            let calls = calls.clone();
            let storage = storage.clone();
            move || -> BoxFuture<'static, FsResult<Node>> {
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(file_node(&storage, "f1"))
                }
                .boxed()
            }
        };

        let (a, b) = tokio::join!(
            container.get_or_load(&id, loader()),
            container.get_or_load(&id, loader())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.ptr_eq(&b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(container.get(&id).unwrap().ptr_eq(&a));
    }

    #[tokio::test]
    async fn failed_load_frees_the_id() {
        let container = NodesContainer::new();
        let id = ObjId::new("missing");
        let err = container
            .get_or_load(&id, || {
                async { Err::<Node, _>(FsError::not_found("missing")) }.boxed()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(container.get_node_or_promise(&id).is_none());
    }

    #[tokio::test]
    async fn promise_is_visible_while_loading() {
        let storage = storage();
        let container = storage.nodes().clone();
        let id = ObjId::new("slow");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let node_storage = storage.clone();
        let fut = container
            .set_promise(
                &id,
                async move {
                    let _ = rx.await;
                    Ok(file_node(&node_storage, "slow"))
                }
                .boxed(),
            )
            .unwrap();
        assert!(matches!(
            container.get_node_or_promise(&id),
            Some(NodeOrPromise::Promise(_))
        ));
        let rejected = container.set_promise(
            &id,
            async { Err::<Node, _>(FsError::not_found("x")) }.boxed(),
        );
        assert!(rejected.is_err());
        tx.send(()).unwrap();
        let node = fut.await.unwrap();
        assert!(matches!(
            container.get_node_or_promise(&id),
            Some(NodeOrPromise::Node(n)) if n.ptr_eq(&node)
        ));
    }

    #[test]
    fn set_rejects_a_second_node() {
        let storage = storage();
        let container = storage.nodes();
        let first = file_node(&storage, "a");
        container.set(first.clone()).unwrap();
        container.set(first.clone()).unwrap();
        assert!(container.set(file_node(&storage, "a")).is_err());
    }

    #[test]
    fn delete_checks_identity() {
        let storage = storage();
        let container = storage.nodes();
        let registered = file_node(&storage, "a");
        container.set(registered.clone()).unwrap();
        assert!(!container.delete(&file_node(&storage, "a")));
        assert!(container.delete(&registered));
        assert!(container.get(registered.obj_id()).is_none());
    }

    #[test]
    fn reservations_block_reuse_until_released() {
        let container = NodesContainer::new();
        let id = ObjId::new("r");
        assert!(container.reserve_id(&id));
        assert!(!container.reserve_id(&id));
        assert!(container.is_reserved(&id));
        assert!(container.get(&id).is_none());
        container.release_reservation(&id);
        assert!(container.reserve_id(&id));
    }
}
