//! Folder nodes.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::sync::Arc;
use xsp_core::{EncryptedObj, ObjId, StorageError, StorageType};

use crate::codec::{FolderInfo, ListingEntry, NodeInfo, NodeKind, SharedKey};
use crate::crypto::{FolderCrypto, NodeContentCrypto, NodeCrypto, new_node_key};
use crate::file::FileNode;
use crate::link::{LinkNode, LinkParameters, LinkTarget, ObjLinkParams};
use crate::node::{EventSource, NodeCore, NodeEventKind, Stats, TxMode};
use crate::nodes::Node;
use crate::spawn::spawn_task;
use crate::storage::FsStorage;
use crate::{FsError, FsResult};

/// Name the root folder reports.
pub(crate) const ROOT_NAME: &str = "/";

#[derive(Debug)]
pub struct FolderNode {
    core: NodeCore,
    crypto: FolderCrypto,
    current: RwLock<FolderInfo>,
}

/// Staged change of a folder listing.
///
/// A folder is either stable or staging one transition. `begin_transition`
/// copies the listing and targets `version + 1`; edits go to the copy;
/// `persist` saves it and may run before the rest of the work; `commit`
/// persists if that has not happened and swaps the copy in. Dropping an
/// uncommitted transition leaves the node untouched.
///
/// Between a successful `persist` and `commit` storage is one version ahead
/// of memory. If the process dies there, or the step in between fails, the
/// next `absorb_external_change` adopts the stored version.
struct Transition<'a> {
    folder: &'a FolderNode,
    listing: FolderInfo,
    version: u64,
    persisted: bool,
}

impl Transition<'_> {
    async fn persist(&mut self) -> FsResult<()> {
        let obj = self
            .folder
            .crypto
            .pack(&self.listing, self.version)
            .map_err(|e| e.at_path(&self.folder.name()))?;
        self.folder.core.save_obj(obj).await?;
        self.persisted = true;
        Ok(())
    }

    async fn commit(mut self) -> FsResult<u64> {
        if !self.persisted {
            self.persist().await?;
        }
        *self.folder.current.write() = std::mem::take(&mut self.listing);
        self.folder.core.set_version(self.version);
        Ok(self.version)
    }
}

/// What a new child is made of.
pub(crate) enum NewChild {
    Folder,
    File,
    Link(LinkParameters),
}

impl NewChild {
    fn kind(&self) -> NodeKind {
        match self {
            NewChild::Folder => NodeKind::Folder,
            NewChild::File => NodeKind::File,
            NewChild::Link(_) => NodeKind::Link,
        }
    }

    fn instantiate(
        &self,
        storage: FsStorage,
        obj_id: ObjId,
        parent_id: ObjId,
        name: String,
        key: SharedKey,
    ) -> FsResult<(Node, EncryptedObj)> {
        let parent_id = Some(parent_id);
        Ok(match self {
            NewChild::Folder => {
                let node = FolderNode::new_unsaved(storage, obj_id, parent_id, name, key);
                let obj = node.initial_obj()?;
                (Node::Folder(node), obj)
            }
            NewChild::File => {
                let node = FileNode::new_unsaved(storage, obj_id, parent_id, name, key);
                let obj = node.initial_obj()?;
                (Node::File(node), obj)
            }
            NewChild::Link(params) => {
                let node =
                    LinkNode::new_unsaved(storage, obj_id, parent_id, name, key, params.clone());
                let obj = node.initial_obj()?;
                (Node::Link(node), obj)
            }
        })
    }
}

impl FolderNode {
    pub(crate) fn new_unsaved(
        storage: FsStorage,
        obj_id: ObjId,
        parent_id: Option<ObjId>,
        name: String,
        key: SharedKey,
    ) -> Arc<Self> {
        let crypto = FolderCrypto::new(NodeCrypto::for_new_obj(key, storage.cryptor()));
        Arc::new(Self {
            core: NodeCore::new(storage, obj_id, parent_id, name, 0),
            crypto,
            current: RwLock::new(FolderInfo::default()),
        })
    }

    /// Version 1 of a new folder: no children.
    pub(crate) fn initial_obj(&self) -> FsResult<EncryptedObj> {
        self.crypto.pack(&FolderInfo::default(), 1)
    }

    pub(crate) async fn make_for_existing(
        storage: FsStorage,
        obj_id: ObjId,
        parent_id: Option<ObjId>,
        name: String,
        key: SharedKey,
    ) -> FsResult<Arc<Self>> {
        let obj = storage
            .get_obj(&obj_id)
            .await
            .map_err(|e| FsError::from(e).at_path(&name))?;
        let version = obj.version;
        let crypto = FolderCrypto::new(NodeCrypto::for_existing_obj(
            key,
            &obj,
            storage.cryptor(),
        )?);
        let listing = crypto.open(obj).map_err(|e| e.at_path(&name))?;
        Ok(Arc::new(Self {
            core: NodeCore::new(storage, obj_id, parent_id, name, version),
            crypto,
            current: RwLock::new(listing),
        }))
    }

    /// Creates the root folder of a new tree. Fails if the storage already
    /// has one.
    pub(crate) async fn make_new_root(storage: FsStorage, key: SharedKey) -> FsResult<Arc<Self>> {
        let obj_id = ObjId::root();
        if !storage.nodes().reserve_id(&obj_id) {
            return Err(FsError::already_exists(ROOT_NAME));
        }
        let root = Self::new_unsaved(storage.clone(), obj_id.clone(), None, ROOT_NAME.into(), key);
        let saved = match root.initial_obj() {
            Ok(obj) => storage.save_obj(&obj_id, obj).await.map_err(FsError::from),
            Err(err) => Err(err),
        };
        if let Err(err) = saved {
            storage.nodes().release_reservation(&obj_id);
            return Err(err.at_path(ROOT_NAME));
        }
        root.core.set_version(1);
        storage.nodes().set(Node::Folder(root.clone()))?;
        Ok(root)
    }

    pub(crate) async fn load_root(storage: FsStorage, key: SharedKey) -> FsResult<Arc<Self>> {
        let info = NodeInfo {
            name: ROOT_NAME.into(),
            obj_id: ObjId::root(),
            kind: NodeKind::Folder,
            key,
        };
        load_node(&storage, None, &info).await?.into_folder()
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.core
    }

    pub(crate) fn crypto(&self) -> &FolderCrypto {
        &self.crypto
    }

    pub fn obj_id(&self) -> &ObjId {
        self.core.obj_id()
    }

    pub fn name(&self) -> String {
        self.core.name()
    }

    pub fn version(&self) -> u64 {
        self.core.version()
    }

    pub fn storage_type(&self) -> StorageType {
        self.core.storage().storage_type()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            is_file: false,
            is_folder: true,
            is_link: false,
            size: None,
            version: self.version(),
        }
    }

    pub fn list(&self) -> Vec<ListingEntry> {
        self.current.read().nodes.values().map(ListingEntry::from).collect()
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.current.read().nodes.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().nodes.is_empty()
    }

    pub(crate) fn child_info(&self, name: &str) -> Option<NodeInfo> {
        self.current.read().nodes.get(name).cloned()
    }

    fn begin_transition(&self) -> Transition<'_> {
        Transition {
            folder: self,
            listing: self.current.read().clone(),
            version: self.core.version() + 1,
            persisted: false,
        }
    }

    /// The live node of a listed child. A child whose object has vanished
    /// from storage is dropped from the listing.
    async fn node_for(&self, info: &NodeInfo) -> FsResult<Node> {
        match load_node(self.core.storage(), Some(self.obj_id().clone()), info).await {
            Ok(node) => {
                sync_position(&node, self.obj_id(), &info.name);
                Ok(node)
            }
            Err(FsError::NotFound { .. }) => {
                self.drop_dangling_entry(info).await;
                Err(FsError::inconsistent(
                    info.name.clone(),
                    "child object is missing from storage",
                ))
            }
            Err(err) => Err(err),
        }
    }

    async fn drop_dangling_entry(&self, info: &NodeInfo) {
        let Ok(_tx) = self.core.begin_tx(TxMode::FailIfBusy).await else {
            tracing::debug!(
                folder = %self.obj_id(),
                child = %info.name,
                "folder busy, dangling entry kept for now"
            );
            return;
        };
        let still_listed = self
            .child_info(&info.name)
            .is_some_and(|listed| listed.obj_id == info.obj_id);
        if !still_listed {
            return;
        }
        let mut tx = self.begin_transition();
        tx.listing.nodes.remove(&info.name);
        match tx.commit().await {
            Ok(version) => {
                tracing::warn!(
                    folder = %self.obj_id(),
                    child = %info.name,
                    obj_id = %info.obj_id,
                    "dropped entry whose object is missing"
                );
                self.core.emit_at(
                    version,
                    EventSource::Local,
                    NodeEventKind::EntryRemoval {
                        entry: ListingEntry::from(info),
                    },
                );
            }
            Err(err) => {
                tracing::warn!(
                    folder = %self.obj_id(),
                    child = %info.name,
                    %err,
                    "failed to drop dangling entry"
                );
            }
        }
    }

    pub async fn get_node(&self, name: &str) -> FsResult<Option<Node>> {
        match self.child_info(name) {
            Some(info) => self.node_for(&info).await.map(Some),
            None => Ok(None),
        }
    }

    async fn child_of_kind(&self, name: &str, kind: NodeKind) -> FsResult<Node> {
        let info = self
            .child_info(name)
            .ok_or_else(|| FsError::not_found(name))?;
        if info.kind != kind {
            return Err(kind_mismatch(name, kind));
        }
        self.node_for(&info).await
    }

    pub async fn get_folder(&self, name: &str) -> FsResult<Arc<FolderNode>> {
        self.child_of_kind(name, NodeKind::Folder).await?.into_folder()
    }

    pub async fn get_file(&self, name: &str) -> FsResult<Arc<FileNode>> {
        self.child_of_kind(name, NodeKind::File).await?.into_file()
    }

    pub async fn get_link(&self, name: &str) -> FsResult<Arc<LinkNode>> {
        self.child_of_kind(name, NodeKind::Link).await?.into_link()
    }

    pub async fn create_folder(&self, name: &str, exclusive: bool) -> FsResult<Arc<FolderNode>> {
        self.create_child(name, NewChild::Folder, exclusive)
            .await?
            .into_folder()
    }

    pub async fn create_file(&self, name: &str, exclusive: bool) -> FsResult<Arc<FileNode>> {
        self.create_child(name, NewChild::File, exclusive)
            .await?
            .into_file()
    }

    /// Links are always created exclusively.
    pub async fn create_link(&self, name: &str, params: LinkParameters) -> FsResult<Arc<LinkNode>> {
        self.create_child(name, NewChild::Link(params), true)
            .await?
            .into_link()
    }

    async fn create_child(&self, name: &str, child: NewChild, exclusive: bool) -> FsResult<Node> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        if let Some(existing) = self.child_info(name) {
            if exclusive {
                return Err(FsError::already_exists(name));
            }
            if existing.kind != child.kind() {
                return Err(kind_mismatch(name, child.kind()));
            }
            return self.node_for(&existing).await;
        }

        let storage = self.core.storage().clone();
        let key = new_node_key();
        let (node, obj_id) = loop {
            let obj_id = storage.generate_new_obj_id().await?;
            let created = child.instantiate(
                storage.clone(),
                obj_id.clone(),
                self.obj_id().clone(),
                name.to_string(),
                key.clone(),
            );
            let (node, obj) = match created {
                Ok(created) => created,
                Err(err) => {
                    storage.nodes().release_reservation(&obj_id);
                    return Err(err);
                }
            };
            match storage.save_obj(&obj_id, obj).await {
                Ok(()) => {
                    node.core().set_version(1);
                    break (node, obj_id);
                }
                Err(StorageError::ObjExists(_)) => {
                    storage.nodes().release_reservation(&obj_id);
                    tracing::debug!(%obj_id, "object id taken in storage, retrying with a new one");
                }
                Err(err) => {
                    storage.nodes().release_reservation(&obj_id);
                    return Err(FsError::from(err).at_path(name));
                }
            }
        };

        let info = NodeInfo {
            name: name.to_string(),
            obj_id: obj_id.clone(),
            kind: child.kind(),
            key,
        };
        let mut tx = self.begin_transition();
        tx.listing.nodes.insert(info.name.clone(), info.clone());
        let registered = match tx.persist().await {
            Ok(()) => storage.nodes().set(node.clone()),
            Err(err) => Err(err),
        };
        if let Err(err) = registered {
            storage.nodes().release_reservation(&obj_id);
            discard_orphan(storage, obj_id);
            return Err(err);
        }
        let version = tx.commit().await?;
        self.core.emit_at(
            version,
            EventSource::Local,
            NodeEventKind::EntryAddition {
                entry: ListingEntry::from(&info),
            },
        );
        Ok(node)
    }

    /// Unlists `node` and deletes it in the background. The entry is found
    /// by object id, whatever name the node last knew.
    pub async fn remove_child(&self, node: &Node) -> FsResult<()> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        let mut tx = self.begin_transition();
        let listed_name = tx
            .listing
            .nodes
            .values()
            .find(|info| &info.obj_id == node.obj_id())
            .map(|info| info.name.clone());
        let Some(info) = listed_name.and_then(|name| tx.listing.nodes.remove(&name)) else {
            return Err(FsError::not_found(node.name()));
        };
        let version = tx.commit().await?;
        self.core.emit_at(
            version,
            EventSource::Local,
            NodeEventKind::EntryRemoval {
                entry: ListingEntry::from(&info),
            },
        );
        let node = node.clone();
        spawn_task(async move {
            if let Err(err) = node.delete(TxMode::Wait).await {
                tracing::warn!(obj_id = %node.obj_id(), %err, "deleting removed child failed");
            }
        });
        Ok(())
    }

    pub async fn rename_child(&self, old_name: &str, new_name: &str) -> FsResult<()> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        if self.has_child(new_name) {
            return Err(FsError::already_exists(new_name));
        }
        let mut tx = self.begin_transition();
        let Some(mut info) = tx.listing.nodes.remove(old_name) else {
            return Err(FsError::not_found(old_name));
        };
        info.name = new_name.to_string();
        let obj_id = info.obj_id.clone();
        tx.listing.nodes.insert(info.name.clone(), info);
        let version = tx.commit().await?;
        if let Some(live) = self.core.storage().nodes().get(&obj_id) {
            live.core().relocate(Some(self.obj_id().clone()), new_name);
        }
        self.core.emit_at(
            version,
            EventSource::Local,
            NodeEventKind::EntryRenaming {
                old_name: old_name.to_string(),
                new_name: new_name.to_string(),
            },
        );
        Ok(())
    }

    /// Moves a child into `dst` under `new_name`.
    ///
    /// Within one folder this is a rename. Across folders the entry is
    /// removed from this folder and added to `dst` as two concurrent
    /// transactions; the move is not atomic, and if one leg fails the other
    /// may already have landed.
    pub async fn move_child_to(
        &self,
        name: &str,
        dst: &FolderNode,
        new_name: &str,
    ) -> FsResult<()> {
        if std::ptr::eq(self, dst) {
            return self.rename_child(name, new_name).await;
        }
        let info = self
            .child_info(name)
            .ok_or_else(|| FsError::not_found(name))?;
        if dst.has_child(new_name) {
            return Err(FsError::already_exists(new_name));
        }
        let moved = NodeInfo {
            name: new_name.to_string(),
            ..info.clone()
        };
        let (detached, attached) =
            tokio::join!(self.detach_entry(&info), dst.attach_entry(moved));
        match (detached, attached) {
            (Ok(()), Ok(())) => {
                if let Some(live) = self.core.storage().nodes().get(&info.obj_id) {
                    live.core().relocate(Some(dst.obj_id().clone()), new_name);
                }
                Ok(())
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => {
                tracing::warn!(child = %info.obj_id, %err, "move completed only one leg");
                Err(err)
            }
            (Err(err), Err(_)) => Err(err),
        }
    }

    async fn detach_entry(&self, info: &NodeInfo) -> FsResult<()> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        let mut tx = self.begin_transition();
        match tx.listing.nodes.get(&info.name) {
            Some(listed) if listed.obj_id == info.obj_id => {}
            _ => return Err(FsError::not_found(info.name.clone())),
        }
        tx.listing.nodes.remove(&info.name);
        let version = tx.commit().await?;
        self.core.emit_at(
            version,
            EventSource::Local,
            NodeEventKind::EntryRemoval {
                entry: ListingEntry::from(info),
            },
        );
        Ok(())
    }

    async fn attach_entry(&self, info: NodeInfo) -> FsResult<()> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        if self.has_child(&info.name) {
            return Err(FsError::already_exists(info.name));
        }
        let entry = ListingEntry::from(&info);
        let mut tx = self.begin_transition();
        tx.listing.nodes.insert(info.name.clone(), info);
        let version = tx.commit().await?;
        self.core.emit_at(
            version,
            EventSource::Local,
            NodeEventKind::EntryAddition { entry },
        );
        Ok(())
    }

    /// Walks `path` down from this folder, creating missing folders when
    /// `create` is set. With `exclusive`, the last folder must not exist yet.
    pub fn get_folder_in_this_sub_tree<'a>(
        self: &'a Arc<Self>,
        path: &'a [String],
        create: bool,
        exclusive: bool,
    ) -> BoxFuture<'a, FsResult<Arc<FolderNode>>> {
        async move {
            let Some((first, rest)) = path.split_first() else {
                return Ok(self.clone());
            };
            let last = rest.is_empty();
            let child = match self.get_folder(first).await {
                Ok(folder) if create && exclusive && last => {
                    return Err(FsError::already_exists(folder.name()));
                }
                Ok(folder) => folder,
                Err(FsError::NotFound { .. }) if create => {
                    self.create_folder(first, exclusive && last).await?
                }
                Err(err) => return Err(err),
            };
            child
                .get_folder_in_this_sub_tree(rest, create, exclusive)
                .await
        }
        .boxed()
    }

    /// Adopts a newer stored version, if any, and reports what changed.
    pub async fn absorb_external_change(&self) -> FsResult<bool> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        let obj = self.core.get_obj().await?;
        if obj.version <= self.core.version() {
            return Ok(false);
        }
        let version = obj.version;
        let listing = self.crypto.open(obj).map_err(|e| e.at_path(&self.name()))?;
        self.adopt_listing(listing, version);
        Ok(true)
    }

    /// Makes `remote_version` current in the synced storage and adopts it.
    pub async fn resolve_conflict(&self, remote_version: u64) -> FsResult<bool> {
        let Some(obj) = self.core.adopt_synced_version(remote_version).await? else {
            return Ok(false);
        };
        let version = obj.version;
        let listing = self.crypto.open(obj).map_err(|e| e.at_path(&self.name()))?;
        self.adopt_listing(listing, version);
        Ok(true)
    }

    fn adopt_listing(&self, listing: FolderInfo, version: u64) {
        let (added, removed) = {
            let old = self.current.read();
            let added: Vec<NodeInfo> = listing
                .nodes
                .values()
                .filter(|n| !old.nodes.contains_key(&n.name))
                .cloned()
                .collect();
            let removed: Vec<NodeInfo> = old
                .nodes
                .values()
                .filter(|n| !listing.nodes.contains_key(&n.name))
                .cloned()
                .collect();
            (added, removed)
        };
        *self.current.write() = listing;
        self.core.set_version(version);
        self.relocate_live_children();

        if let ([new], [old]) = (added.as_slice(), removed.as_slice()) {
            self.core.emit(
                EventSource::Remote,
                NodeEventKind::EntryRenaming {
                    old_name: old.name.clone(),
                    new_name: new.name.clone(),
                },
            );
            return;
        }
        for info in &removed {
            self.core.emit(
                EventSource::Remote,
                NodeEventKind::EntryRemoval {
                    entry: ListingEntry::from(info),
                },
            );
        }
        for info in &added {
            self.core.emit(
                EventSource::Remote,
                NodeEventKind::EntryAddition {
                    entry: ListingEntry::from(info),
                },
            );
        }
    }

    /// Points every live child at its listed name and at this folder.
    fn relocate_live_children(&self) {
        let nodes = self.core.storage().nodes();
        for info in self.current.read().nodes.values() {
            if let Some(live) = nodes.get(&info.obj_id) {
                sync_position(&live, self.obj_id(), &info.name);
            }
        }
    }

    /// Parameters another tree can store to link to this folder.
    pub fn get_params_for_link(&self, readonly: bool) -> FsResult<LinkParameters> {
        Ok(LinkParameters {
            storage_type: self.storage_type(),
            is_file: false,
            is_folder: true,
            readonly,
            params: LinkTarget::Obj(ObjLinkParams {
                obj_id: self.obj_id().clone(),
                key: self.crypto.key_in_base64()?,
                name: self.name(),
                location: None,
            }),
        })
    }

    /// Deletes this folder's object now and its children in the background.
    pub async fn delete(self: &Arc<Self>, mode: TxMode) -> FsResult<()> {
        let _tx = self.core.begin_tx(mode).await?;
        let children: Vec<NodeInfo> = self.current.read().nodes.values().cloned().collect();
        self.core.retire(&Node::Folder(self.clone())).await?;
        self.crypto.wipe();
        self.current.write().nodes.clear();
        for info in children {
            let storage = self.core.storage().clone();
            let parent_id = self.obj_id().clone();
            spawn_task(async move {
                let deleted = match load_node(&storage, Some(parent_id), &info).await {
                    Ok(node) => node.delete(TxMode::Wait).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = deleted {
                    tracing::warn!(
                        child = %info.obj_id,
                        name = %info.name,
                        %err,
                        "cascading delete failed"
                    );
                }
            });
        }
        Ok(())
    }
}

/// A node first reached through a link, or renamed remotely, may carry a
/// stale name or parent.
fn sync_position(node: &Node, parent_id: &ObjId, name: &str) {
    let core = node.core();
    if core.name() != name || core.parent_id().as_ref() != Some(parent_id) {
        core.relocate(Some(parent_id.clone()), name);
    }
}

fn kind_mismatch(name: &str, wanted: NodeKind) -> FsError {
    match wanted {
        NodeKind::Folder => FsError::not_directory(name),
        NodeKind::File => FsError::not_file(name),
        NodeKind::Link => FsError::not_link(name),
    }
}

/// Removes the object of a child that never made it into its parent.
fn discard_orphan(storage: FsStorage, obj_id: ObjId) {
    spawn_task(async move {
        if let Err(err) = storage.remove_obj(&obj_id).await {
            tracing::warn!(%obj_id, %err, "failed to remove orphaned object");
        }
    });
}

/// The live node for `info`, instantiated from storage if needed.
pub(crate) async fn load_node(
    storage: &FsStorage,
    parent_id: Option<ObjId>,
    info: &NodeInfo,
) -> FsResult<Node> {
    let loader_storage = storage.clone();
    let loader_info = info.clone();
    let node = storage
        .nodes()
        .get_or_load(&info.obj_id, move || {
            async move {
                let NodeInfo {
                    name,
                    obj_id,
                    kind,
                    key,
                } = loader_info;
                let storage = loader_storage;
                Ok(match kind {
                    NodeKind::Folder => {
                        let node =
                            FolderNode::make_for_existing(storage, obj_id, parent_id, name, key)
                                .await?;
                        Node::Folder(node)
                    }
                    NodeKind::File => {
                        let node =
                            FileNode::make_for_existing(storage, obj_id, parent_id, name, key)
                                .await?;
                        Node::File(node)
                    }
                    NodeKind::Link => {
                        let node =
                            LinkNode::make_for_existing(storage, obj_id, parent_id, name, key)
                                .await?;
                        Node::Link(node)
                    }
                })
            }
            .boxed()
        })
        .await?;
    if node.kind() != info.kind {
        return Err(FsError::inconsistent(
            info.name.clone(),
            format!("listed as {:?} but stored as {:?}", info.kind, node.kind()),
        ));
    }
    Ok(node)
}
