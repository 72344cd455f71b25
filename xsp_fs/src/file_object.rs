//! Handle to a file handed out by the facade.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tokio::sync::broadcast;
use xsp_core::ObjId;

use crate::file::{FileByteSource, FileNode, FileSink};
use crate::link::LinkParameters;
use crate::node::{NodeEvent, Stats, TxMode};
use crate::{FsError, FsResult};

/// A file plus whether this handle may change it.
#[derive(Debug, Clone)]
pub struct FileObject {
    node: Arc<FileNode>,
    writable: bool,
}

impl FileObject {
    pub(crate) fn new(node: Arc<FileNode>, writable: bool) -> Self {
        Self { node, writable }
    }

    pub(crate) fn node(&self) -> &Arc<FileNode> {
        &self.node
    }

    pub fn name(&self) -> String {
        self.node.name()
    }

    pub fn obj_id(&self) -> &ObjId {
        self.node.obj_id()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn version(&self) -> u64 {
        self.node.version()
    }

    fn ensure_writable(&self) -> FsResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(FsError::not_writable(self.name()))
        }
    }

    pub fn stat(&self) -> Stats {
        self.node.stats()
    }

    pub async fn read_bytes(&self, start: Option<u64>, end: Option<u64>) -> FsResult<Bytes> {
        self.node.read_bytes(start, end).await
    }

    pub async fn read_txt(&self) -> FsResult<String> {
        let bytes = self.read_bytes(None, None).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| FsError::parsing(self.name(), e))
    }

    pub async fn read_json<T: DeserializeOwned>(&self) -> FsResult<T> {
        let bytes = self.read_bytes(None, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| FsError::parsing(self.name(), e))
    }

    pub async fn get_byte_source(&self) -> FsResult<FileByteSource> {
        self.node.read_src().await
    }

    /// Saves `content` as the next version and returns that version.
    pub async fn write_bytes(&self, content: &[u8]) -> FsResult<u64> {
        self.ensure_writable()?;
        self.node.save(content, TxMode::Wait).await
    }

    pub async fn write_txt(&self, text: &str) -> FsResult<u64> {
        self.write_bytes(text.as_bytes()).await
    }

    pub async fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> FsResult<u64> {
        let json = serde_json::to_vec(value).map_err(|e| FsError::parsing(self.name(), e))?;
        self.write_bytes(&json).await
    }

    pub async fn get_byte_sink(&self) -> FsResult<FileSink> {
        self.ensure_writable()?;
        self.node.write_sink(TxMode::Wait).await
    }

    /// Like [`get_byte_sink`](Self::get_byte_sink), but fails with
    /// [`FsError::ConcurrentUpdate`] instead of queueing.
    pub async fn try_get_byte_sink(&self) -> FsResult<FileSink> {
        self.ensure_writable()?;
        self.node.write_sink(TxMode::FailIfBusy).await
    }

    pub fn watch(&self) -> FsResult<broadcast::Receiver<NodeEvent>> {
        self.node
            .core()
            .subscribe()
            .ok_or_else(|| FsError::not_found(self.name()))
    }

    pub fn link_params(&self) -> FsResult<LinkParameters> {
        let mut params = self.node.get_params_for_link()?;
        params.readonly = !self.writable;
        Ok(params)
    }
}
