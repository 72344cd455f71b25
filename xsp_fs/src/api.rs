//! Path-based facade over a folder tree.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tokio::sync::broadcast;
use xsp_core::{CryptoError, SEGMENT_SIZE, Storage, StorageType, crypto::key_from_slice};

use crate::codec::{ListingEntry, NodeKind, shared_key};
use crate::file::{FileByteSource, FileNode, FileSink};
use crate::file_object::FileObject;
use crate::folder::FolderNode;
use crate::link::{LinkParameters, ResolvedLink, is_link_allowed};
use crate::node::{NodeEvent, Stats, TxMode};
use crate::nodes::Node;
use crate::path::split_path;
use crate::storage::FsStorage;
use crate::{FsError, FsResult};

/// A filesystem tree, or a sub-tree of one, addressed by POSIX-style paths.
///
/// Paths are resolved relative to this tree's root folder; `.` and `..` are
/// resolved and repeated separators ignored. Errors carry the path the
/// caller passed in.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use xsp_core::StorageType;
/// use xsp_fs::{XspFs, derive_root_key};
/// use xsp_store_memory::MemoryStorage;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let storage = Arc::new(MemoryStorage::new(StorageType::Local));
/// let fs = XspFs::make_new_root(storage, &derive_root_key(b"passphrase")).await?;
/// fs.write_txt_file("/notes/today.txt", "hello").await?;
/// assert_eq!(fs.read_txt_file("/notes/today.txt").await?, "hello");
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct XspFs {
    storage: FsStorage,
    root: Arc<FolderNode>,
    writable: bool,
}

impl std::fmt::Debug for XspFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XspFs")
            .field("root", self.root.obj_id())
            .field("storage_type", &self.storage.storage_type())
            .field("writable", &self.writable)
            .finish()
    }
}

fn parent_and_name(path: &str) -> FsResult<(Vec<String>, String)> {
    let mut parts = split_path(path);
    match parts.pop() {
        Some(name) => Ok((parts, name)),
        None => Err(FsError::invalid_path(path, "path names the root folder")),
    }
}

impl XspFs {
    /// Creates the root folder of a new tree in `backend`.
    pub async fn make_new_root(backend: Arc<dyn Storage>, root_key: &[u8]) -> FsResult<Self> {
        let key = shared_key(key_from_slice(root_key)?);
        let storage = FsStorage::for_backend(backend);
        let root = FolderNode::make_new_root(storage.clone(), key).await?;
        tracing::debug!(storage_type = %storage.storage_type(), "created new root folder");
        Ok(Self::from_folder(storage, root, true))
    }

    /// Opens the tree whose root folder already exists in `backend`.
    pub async fn from_existing_root(backend: Arc<dyn Storage>, root_key: &[u8]) -> FsResult<Self> {
        let key = shared_key(key_from_slice(root_key)?);
        let storage = FsStorage::for_backend(backend);
        let root = FolderNode::load_root(storage.clone(), key.clone())
            .await
            .map_err(|e| e.at_path("/"))?;
        // A root already live in this process was opened with its own key.
        if !root.crypto().has_key(key.as_slice())? {
            return Err(FsError::Crypto(CryptoError::DecryptionFailed).at_path("/"));
        }
        Ok(Self::from_folder(storage, root, true))
    }

    pub(crate) fn from_folder(storage: FsStorage, root: Arc<FolderNode>, writable: bool) -> Self {
        Self {
            storage,
            root,
            writable,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage.storage_type()
    }

    /// Version of this tree's root folder.
    pub fn root_version(&self) -> u64 {
        self.root.version()
    }

    fn ensure_writable(&self, path: &str) -> FsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(FsError::not_writable(path))
        }
    }

    async fn folder_at(
        &self,
        parts: &[String],
        create: bool,
        exclusive: bool,
    ) -> FsResult<Arc<FolderNode>> {
        self.root
            .get_folder_in_this_sub_tree(parts, create, exclusive)
            .await
    }

    async fn node_at(&self, path: &str) -> FsResult<Node> {
        let parts = split_path(path);
        let Some((name, parent)) = parts.split_last() else {
            return Ok(Node::Folder(self.root.clone()));
        };
        self.folder_at(parent, false, false)
            .await?
            .get_node(name)
            .await?
            .ok_or_else(|| FsError::not_found(path))
    }

    /// Read-only view of the folder at `path`.
    pub async fn readonly_sub_root(&self, path: &str) -> FsResult<XspFs> {
        let folder = self
            .folder_at(&split_path(path), false, false)
            .await
            .map_err(|e| e.at_path(path))?;
        Ok(Self::from_folder(self.storage.clone(), folder, false))
    }

    /// Writable view of the folder at `path`, created when `create` is set.
    pub async fn writable_sub_root(&self, path: &str, create: bool) -> FsResult<XspFs> {
        self.ensure_writable(path)?;
        let folder = self
            .folder_at(&split_path(path), create, false)
            .await
            .map_err(|e| e.at_path(path))?;
        Ok(Self::from_folder(self.storage.clone(), folder, true))
    }

    /// Creates the folder at `path` and any missing parents. With
    /// `exclusive`, fails if the folder already exists.
    pub async fn make_folder(&self, path: &str, exclusive: bool) -> FsResult<()> {
        self.ensure_writable(path)?;
        let parts = split_path(path);
        if parts.is_empty() && exclusive {
            return Err(FsError::already_exists(path));
        }
        self.folder_at(&parts, true, exclusive)
            .await
            .map(|_| ())
            .map_err(|e| e.at_path(path))
    }

    pub async fn list_folder(&self, path: &str) -> FsResult<Vec<ListingEntry>> {
        let folder = self
            .folder_at(&split_path(path), false, false)
            .await
            .map_err(|e| e.at_path(path))?;
        Ok(folder.list())
    }

    pub async fn stat(&self, path: &str) -> FsResult<Stats> {
        let node = self.node_at(path).await.map_err(|e| e.at_path(path))?;
        Ok(node.stats())
    }

    /// Whether a folder exists at `path`. A file or link there is an error.
    pub async fn check_folder_presence(&self, path: &str) -> FsResult<bool> {
        match self.folder_at(&split_path(path), false, false).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.at_path(path)),
        }
    }

    async fn check_presence(&self, path: &str, kind: NodeKind) -> FsResult<bool> {
        let (parent, name) = parent_and_name(path)?;
        let folder = match self.folder_at(&parent, false, false).await {
            Ok(folder) => folder,
            Err(FsError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err.at_path(path)),
        };
        match folder.child_info(&name) {
            None => Ok(false),
            Some(info) if info.kind == kind => Ok(true),
            Some(_) if kind == NodeKind::File => Err(FsError::not_file(path)),
            Some(_) => Err(FsError::not_link(path)),
        }
    }

    /// Whether a file exists at `path`. A folder or link there is an error.
    pub async fn check_file_presence(&self, path: &str) -> FsResult<bool> {
        self.check_presence(path, NodeKind::File).await
    }

    /// Whether a link exists at `path`. A folder or file there is an error.
    pub async fn check_link_presence(&self, path: &str) -> FsResult<bool> {
        self.check_presence(path, NodeKind::Link).await
    }

    /// Deletes the folder at `path`. Without `remove_content` a non-empty
    /// folder is refused; with it, children are deleted in the background.
    pub async fn delete_folder(&self, path: &str, remove_content: bool) -> FsResult<()> {
        self.ensure_writable(path)?;
        let (parent, name) = parent_and_name(path)?;
        let result = async {
            let parent = self.folder_at(&parent, false, false).await?;
            let folder = parent.get_folder(&name).await?;
            if !remove_content && !folder.is_empty() {
                return Err(FsError::NotEmpty { path: name.clone() });
            }
            parent.remove_child(&Node::Folder(folder)).await
        }
        .await;
        result.map_err(|e| e.at_path(path))
    }

    pub async fn delete_file(&self, path: &str) -> FsResult<()> {
        self.ensure_writable(path)?;
        let (parent, name) = parent_and_name(path)?;
        let result = async {
            let parent = self.folder_at(&parent, false, false).await?;
            let file = parent.get_file(&name).await?;
            parent.remove_child(&Node::File(file)).await
        }
        .await;
        result.map_err(|e| e.at_path(path))
    }

    pub async fn delete_link(&self, path: &str) -> FsResult<()> {
        self.ensure_writable(path)?;
        let (parent, name) = parent_and_name(path)?;
        let result = async {
            let parent = self.folder_at(&parent, false, false).await?;
            let link = parent.get_link(&name).await?;
            parent.remove_child(&Node::Link(link)).await
        }
        .await;
        result.map_err(|e| e.at_path(path))
    }

    /// Moves or renames the entry at `src` to `dst`, creating missing parent
    /// folders of `dst`. Across folders the move is not atomic.
    pub async fn mv(&self, src: &str, dst: &str) -> FsResult<()> {
        self.ensure_writable(src)?;
        let (src_parent, src_name) = parent_and_name(src)?;
        let (dst_parent, dst_name) = parent_and_name(dst)?;
        let src_parts = split_path(src);
        if split_path(dst).starts_with(&src_parts) {
            return Err(FsError::invalid_path(dst, "cannot move an entry into itself"));
        }
        let src_folder = self
            .folder_at(&src_parent, false, false)
            .await
            .map_err(|e| e.at_path(src))?;
        if !src_folder.has_child(&src_name) {
            return Err(FsError::not_found(src));
        }
        let dst_folder = self
            .folder_at(&dst_parent, true, false)
            .await
            .map_err(|e| e.at_path(dst))?;
        src_folder
            .move_child_to(&src_name, &dst_folder, &dst_name)
            .await
            .map_err(|e| match e {
                FsError::AlreadyExists { .. } => e.at_path(dst),
                e => e.at_path(src),
            })
    }

    /// Creates a link at `path` from parameters produced by
    /// [`FileObject::link_params`] or [`XspFs::get_link_params`].
    pub async fn link(&self, path: &str, params: &LinkParameters) -> FsResult<()> {
        self.ensure_writable(path)?;
        let from = self.storage_type();
        if !is_link_allowed(from, params.storage_type) {
            return Err(FsError::LinkNotAllowed {
                from,
                to: params.storage_type,
            });
        }
        let (parent, name) = parent_and_name(path)?;
        let result = async {
            let folder = self.folder_at(&parent, true, false).await?;
            folder.create_link(&name, params.clone()).await.map(|_| ())
        }
        .await;
        result.map_err(|e| e.at_path(path))
    }

    /// Follows the link at `path`.
    pub async fn read_link(&self, path: &str) -> FsResult<ResolvedLink> {
        let (parent, name) = parent_and_name(path)?;
        let result = async {
            let link = self
                .folder_at(&parent, false, false)
                .await?
                .get_link(&name)
                .await?;
            link.target().await
        }
        .await;
        result.map_err(|e| e.at_path(path))
    }

    /// Parameters another tree can store to link to this tree's root.
    pub fn get_link_params(&self) -> FsResult<LinkParameters> {
        self.root.get_params_for_link(!self.writable)
    }

    async fn file_node(
        &self,
        path: &str,
        create: bool,
        exclusive: bool,
    ) -> FsResult<Arc<FileNode>> {
        let (parent, name) = parent_and_name(path)?;
        let result = async {
            let folder = self.folder_at(&parent, create, false).await?;
            if create {
                folder.create_file(&name, exclusive).await
            } else {
                folder.get_file(&name).await
            }
        }
        .await;
        result.map_err(|e| e.at_path(path))
    }

    pub async fn readonly_file(&self, path: &str) -> FsResult<FileObject> {
        let node = self.file_node(path, false, false).await?;
        Ok(FileObject::new(node, false))
    }

    /// Writable handle to the file at `path`. With `create`, a missing file
    /// (and its parent folders) is created; `exclusive` then requires that
    /// it did not exist.
    pub async fn writable_file(
        &self,
        path: &str,
        create: bool,
        exclusive: bool,
    ) -> FsResult<FileObject> {
        self.ensure_writable(path)?;
        let node = self.file_node(path, create, exclusive).await?;
        Ok(FileObject::new(node, true))
    }

    pub async fn read_bytes(
        &self,
        path: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> FsResult<Bytes> {
        let file = self.readonly_file(path).await?;
        file.read_bytes(start, end)
            .await
            .map_err(|e| e.at_path(path))
    }

    /// Writes `content` to the file at `path`, creating it if needed.
    pub async fn write_bytes(&self, path: &str, content: &[u8]) -> FsResult<u64> {
        let file = self.writable_file(path, true, false).await?;
        file.write_bytes(content)
            .await
            .map_err(|e| e.at_path(path))
    }

    pub async fn read_txt_file(&self, path: &str) -> FsResult<String> {
        let file = self.readonly_file(path).await?;
        file.read_txt().await.map_err(|e| e.at_path(path))
    }

    pub async fn write_txt_file(&self, path: &str, text: &str) -> FsResult<u64> {
        self.write_bytes(path, text.as_bytes()).await
    }

    pub async fn read_json_file<T: DeserializeOwned>(&self, path: &str) -> FsResult<T> {
        let file = self.readonly_file(path).await?;
        file.read_json().await.map_err(|e| e.at_path(path))
    }

    pub async fn write_json_file<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
    ) -> FsResult<u64> {
        let file = self.writable_file(path, true, false).await?;
        file.write_json(value).await.map_err(|e| e.at_path(path))
    }

    pub async fn get_byte_source(&self, path: &str) -> FsResult<FileByteSource> {
        let file = self.readonly_file(path).await?;
        file.get_byte_source().await.map_err(|e| e.at_path(path))
    }

    /// Sink for the next version of the file at `path`, created if needed.
    pub async fn get_byte_sink(&self, path: &str) -> FsResult<FileSink> {
        let file = self.writable_file(path, true, false).await?;
        file.get_byte_sink().await.map_err(|e| e.at_path(path))
    }

    /// Copies the file at `src` to `dst` within this tree.
    pub async fn copy_file(&self, src: &str, dst: &str, overwrite: bool) -> FsResult<()> {
        let file = self.readonly_file(src).await?;
        self.save_file(&file, dst, overwrite).await
    }

    /// Writes the content of `file`, possibly from another tree, to `dst`.
    pub async fn save_file(&self, file: &FileObject, dst: &str, overwrite: bool) -> FsResult<()> {
        self.ensure_writable(dst)?;
        let target = self.file_node(dst, true, !overwrite).await?;
        copy_content(file.node(), &target)
            .await
            .map_err(|e| e.at_path(dst))
    }

    /// Copies the folder at `src` to `dst` within this tree.
    pub async fn copy_folder(
        &self,
        src: &str,
        dst: &str,
        merge_and_overwrite: bool,
    ) -> FsResult<()> {
        if split_path(dst).starts_with(&split_path(src)) {
            return Err(FsError::invalid_path(dst, "cannot copy a folder into itself"));
        }
        let source = self.readonly_sub_root(src).await?;
        self.save_folder(&source, dst, merge_and_overwrite).await
    }

    /// Recursively writes the content of `folder`, possibly another tree,
    /// to `dst`. Without `merge_and_overwrite`, `dst` must not exist.
    pub async fn save_folder(
        &self,
        folder: &XspFs,
        dst: &str,
        merge_and_overwrite: bool,
    ) -> FsResult<()> {
        self.ensure_writable(dst)?;
        let parts = split_path(dst);
        let target = self
            .folder_at(&parts, true, !merge_and_overwrite)
            .await
            .map_err(|e| e.at_path(dst))?;
        if self.storage.same_as(&folder.storage) && is_within(&target, &folder.root) {
            return Err(FsError::invalid_path(dst, "cannot copy a folder into itself"));
        }
        copy_tree(folder.root.clone(), target, merge_and_overwrite)
            .await
            .map_err(|e| e.at_path(dst))
    }

    pub async fn watch_folder(&self, path: &str) -> FsResult<broadcast::Receiver<NodeEvent>> {
        let folder = self
            .folder_at(&split_path(path), false, false)
            .await
            .map_err(|e| e.at_path(path))?;
        folder
            .core()
            .subscribe()
            .ok_or_else(|| FsError::not_found(path))
    }

    pub async fn watch_file(&self, path: &str) -> FsResult<broadcast::Receiver<NodeEvent>> {
        self.readonly_file(path).await?.watch().map_err(|e| e.at_path(path))
    }

    /// Adopts a newer stored version of the node at `path`. Returns whether
    /// anything changed.
    pub async fn absorb_external_change(&self, path: &str) -> FsResult<bool> {
        let node = self.node_at(path).await.map_err(|e| e.at_path(path))?;
        node.absorb_external_change()
            .await
            .map_err(|e| e.at_path(path))
    }

    /// Makes `remote_version` of the node at `path` current. Synced storage
    /// only.
    pub async fn resolve_conflict(&self, path: &str, remote_version: u64) -> FsResult<bool> {
        self.ensure_writable(path)?;
        let node = self.node_at(path).await.map_err(|e| e.at_path(path))?;
        node.resolve_conflict(remote_version)
            .await
            .map_err(|e| e.at_path(path))
    }

    /// Releases every live node of the underlying storage and closes it.
    /// Other handles on the same storage become unusable.
    pub async fn close(&self) -> FsResult<()> {
        self.storage.close().await
    }
}

/// Whether `folder` is `ancestor` or lies below it.
fn is_within(folder: &FolderNode, ancestor: &FolderNode) -> bool {
    let nodes = folder.core().storage().nodes();
    let mut current = Some(folder.obj_id().clone());
    while let Some(obj_id) = current {
        if &obj_id == ancestor.obj_id() {
            return true;
        }
        current = nodes.get(&obj_id).and_then(|node| node.core().parent_id());
    }
    false
}

async fn copy_content(src: &FileNode, dst: &Arc<FileNode>) -> FsResult<()> {
    let mut source = src.read_src().await?;
    let mut sink = dst.write_sink(TxMode::Wait).await?;
    while let Some(chunk) = source.read_next(SEGMENT_SIZE)? {
        sink.write(&chunk)?;
    }
    sink.done().await?;
    Ok(())
}

fn copy_tree(
    src: Arc<FolderNode>,
    dst: Arc<FolderNode>,
    merge: bool,
) -> BoxFuture<'static, FsResult<()>> {
    async move {
        for entry in src.list() {
            let name = entry.name.as_str();
            match entry.kind {
                NodeKind::Folder => {
                    let from = src.get_folder(name).await?;
                    let to = dst.create_folder(name, !merge).await?;
                    copy_tree(from, to, merge).await?;
                }
                NodeKind::File => {
                    let from = src.get_file(name).await?;
                    let to = dst.create_file(name, !merge).await?;
                    copy_content(&from, &to).await?;
                }
                NodeKind::Link => {
                    let from = src.get_link(name).await?;
                    if let Some(existing) = dst.get_node(name).await? {
                        if !merge {
                            return Err(FsError::already_exists(name));
                        }
                        dst.remove_child(&existing).await?;
                    }
                    dst.create_link(name, from.params()).await?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}
