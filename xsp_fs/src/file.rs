//! File nodes.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use xsp_core::{EncryptedObj, ObjId, StorageError, StorageType};

use crate::codec::SharedKey;
use crate::crypto::{FileCrypto, NodeContentCrypto, NodeCrypto, SegmentReader, SegmentWriter};
use crate::link::{LinkParameters, LinkTarget, ObjLinkParams};
use crate::node::{EventSource, NodeCore, NodeEventKind, Stats, TxMode};
use crate::nodes::Node;
use crate::spawn::spawn_task;
use crate::storage::FsStorage;
use crate::{FsError, FsResult};

#[derive(Debug)]
pub struct FileNode {
    core: NodeCore,
    crypto: FileCrypto,
    size: AtomicU64,
}

impl FileNode {
    /// A node for an object that has not been saved yet (version 0).
    pub(crate) fn new_unsaved(
        storage: FsStorage,
        obj_id: ObjId,
        parent_id: Option<ObjId>,
        name: String,
        key: SharedKey,
    ) -> Arc<Self> {
        let crypto = FileCrypto::new(NodeCrypto::for_new_obj(key, storage.cryptor()));
        Arc::new(Self {
            core: NodeCore::new(storage, obj_id, parent_id, name, 0),
            crypto,
            size: AtomicU64::new(0),
        })
    }

    /// Version 1 of a new file: empty content.
    pub(crate) fn initial_obj(&self) -> FsResult<EncryptedObj> {
        self.crypto.pack(&Bytes::new(), 1)
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
        let crypto = NodeCrypto::for_existing_obj(key, &obj, storage.cryptor())?;
        let reader = crypto.segment_reader(obj)?;
        Ok(Arc::new(Self {
            core: NodeCore::new(storage, obj_id, parent_id, name, reader.version()),
            crypto: FileCrypto::new(crypto),
            size: AtomicU64::new(reader.content_len()),
        }))
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.core
    }

    pub(crate) fn crypto(&self) -> &FileCrypto {
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

    /// Content length as of the last version this node saw.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            is_file: true,
            is_folder: false,
            is_link: false,
            size: Some(self.size()),
            version: self.version(),
        }
    }

    fn adopt(&self, reader: &SegmentReader) {
        self.core.set_version(reader.version());
        self.size.store(reader.content_len(), Ordering::Release);
    }

    /// Source over the current stored version. A version newer than the
    /// node's is adopted without an event.
    pub async fn read_src(&self) -> FsResult<FileByteSource> {
        let obj = self.core.get_obj().await?;
        let reader = self.crypto.segment_reader(obj)?;
        if reader.version() > self.core.version() {
            self.adopt(&reader);
        }
        Ok(FileByteSource {
            reader,
            position: 0,
        })
    }

    /// Bytes in `[start, end)`; missing bounds mean the start and the end of
    /// the content. Empty past the end.
    pub async fn read_bytes(&self, start: Option<u64>, end: Option<u64>) -> FsResult<Bytes> {
        let src = self.read_src().await?;
        src.read_range(start.unwrap_or(0), end.unwrap_or(u64::MAX))
    }

    pub async fn save(&self, content: &[u8], mode: TxMode) -> FsResult<u64> {
        let _tx = self.core.begin_tx(mode).await?;
        let version = self.core.version() + 1;
        let obj = self.crypto.pack_bytes(content, version)?;
        self.commit(obj, content.len() as u64).await
    }

    async fn commit(&self, obj: EncryptedObj, size: u64) -> FsResult<u64> {
        let version = obj.version;
        self.core.save_obj(obj).await?;
        self.core.set_version(version);
        self.size.store(size, Ordering::Release);
        self.core.emit(EventSource::Local, NodeEventKind::FileChange);
        Ok(version)
    }

    /// Starts writing the next version. The transaction stays open until the
    /// returned sink is completed with [`FileSink::done`] or dropped; dropping
    /// it abandons the version.
    pub async fn write_sink(self: &Arc<Self>, mode: TxMode) -> FsResult<FileSink> {
        let guard = self.core.begin_tx(mode).await?;
        let version = self.core.version() + 1;
        let writer = self.crypto.segment_writer(version)?;
        let (commit_tx, commit_rx) = oneshot::channel::<SinkCommit>();
        let node = self.clone();
        spawn_task(async move {
            let _guard = guard;
            match commit_rx.await {
                Ok(SinkCommit { obj, size, reply }) => {
                    let result = node.commit(obj, size).await;
                    if let Err(err) = &result {
                        tracing::warn!(
                            obj_id = %node.obj_id(),
                            %err,
                            "saving streamed file version failed"
                        );
                    }
                    let _ = reply.send(result);
                }
                Err(_) => {
                    tracing::debug!(
                        obj_id = %node.obj_id(),
                        version,
                        "byte sink dropped, version abandoned"
                    );
                }
            }
        });
        Ok(FileSink {
            name: self.name(),
            writer,
            commit: commit_tx,
        })
    }

    /// Parameters another tree can store to link to this file.
    pub fn get_params_for_link(&self) -> FsResult<LinkParameters> {
        let storage_type = self.core.storage().storage_type();
        if !matches!(storage_type, StorageType::Local | StorageType::Synced) {
            return Err(FsError::Storage(Arc::new(StorageError::NotSupported(
                format!("links to files in {storage_type} storage"),
            ))));
        }
        Ok(LinkParameters {
            storage_type,
            is_file: true,
            is_folder: false,
            readonly: false,
            params: LinkTarget::Obj(ObjLinkParams {
                obj_id: self.obj_id().clone(),
                key: self.crypto.key_in_base64()?,
                name: self.name(),
                location: None,
            }),
        })
    }

    pub async fn delete(self: &Arc<Self>, mode: TxMode) -> FsResult<()> {
        let _tx = self.core.begin_tx(mode).await?;
        self.core.retire(&Node::File(self.clone())).await?;
        self.crypto.wipe();
        Ok(())
    }

    pub async fn absorb_external_change(&self) -> FsResult<bool> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        let obj = self.core.get_obj().await?;
        if obj.version <= self.core.version() {
            return Ok(false);
        }
        let reader = self.crypto.segment_reader(obj)?;
        self.adopt(&reader);
        self.core.emit(EventSource::Remote, NodeEventKind::FileChange);
        Ok(true)
    }

    /// Makes `remote_version` current in the synced storage and adopts it.
    pub async fn resolve_conflict(&self, remote_version: u64) -> FsResult<bool> {
        let Some(obj) = self.core.adopt_synced_version(remote_version).await? else {
            return Ok(false);
        };
        let reader = self.crypto.segment_reader(obj)?;
        self.adopt(&reader);
        self.core.emit(EventSource::Remote, NodeEventKind::FileChange);
        Ok(true)
    }
}

struct SinkCommit {
    obj: EncryptedObj,
    size: u64,
    reply: oneshot::Sender<FsResult<u64>>,
}

/// Encrypting writer for the next version of a file.
pub struct FileSink {
    name: String,
    writer: SegmentWriter,
    commit: oneshot::Sender<SinkCommit>,
}

impl FileSink {
    /// Version this sink will save.
    pub fn version(&self) -> u64 {
        self.writer.version()
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.writer.content_len()
    }

    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        Ok(self.writer.write(data)?)
    }

    /// Seals the last segment and saves the version. Returns the saved
    /// version.
    pub async fn done(self) -> FsResult<u64> {
        let size = self.writer.content_len();
        let obj = self.writer.finish()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let gone = || {
            FsError::inconsistent(
                self.name.clone(),
                "file transaction ended before the sink completed",
            )
        };
        self.commit
            .send(SinkCommit {
                obj,
                size,
                reply: reply_tx,
            })
            .map_err(|_| gone())?;
        reply_rx.await.map_err(|_| gone())?
    }
}

/// Seekable plaintext view of one file version.
pub struct FileByteSource {
    reader: SegmentReader,
    position: u64,
}

impl FileByteSource {
    pub fn size(&self) -> u64 {
        self.reader.content_len()
    }

    pub fn version(&self) -> u64 {
        self.reader.version()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the read position, clamped to the content length.
    pub fn seek(&mut self, position: u64) {
        self.position = position.min(self.size());
    }

    pub fn read_range(&self, start: u64, end: u64) -> FsResult<Bytes> {
        Ok(self.reader.read_range(start, end)?.into())
    }

    /// Reads up to `max_len` bytes from the current position; `None` at the
    /// end.
    pub fn read_next(&mut self, max_len: usize) -> FsResult<Option<Bytes>> {
        if self.position >= self.size() || max_len == 0 {
            return Ok(None);
        }
        let end = self.position.saturating_add(max_len as u64);
        let chunk = self.read_range(self.position, end)?;
        self.position += chunk.len() as u64;
        Ok(Some(chunk))
    }
}
