#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use xsp_core::StorageType;
use xsp_fs::{NodeEvent, XspFs, derive_root_key};
use xsp_store_memory::MemoryStorage;

pub const SECRET: &[u8] = b"correct horse battery staple";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn root_key() -> [u8; 32] {
    derive_root_key(SECRET)
}

/// Fresh tree in a new in-memory storage.
pub async fn new_fs(storage_type: StorageType) -> anyhow::Result<(XspFs, Arc<MemoryStorage>)> {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new(storage_type));
    let fs = XspFs::make_new_root(storage.clone(), &root_key()).await?;
    Ok((fs, storage))
}

/// Second, independent view of the tree in `storage`, as another process
/// would have.
pub async fn reopen(storage: &Arc<MemoryStorage>) -> anyhow::Result<XspFs> {
    let client = Arc::new(storage.new_client());
    Ok(XspFs::from_existing_root(client, &root_key()).await?)
}

pub async fn next_event(rx: &mut broadcast::Receiver<NodeEvent>) -> anyhow::Result<NodeEvent> {
    Ok(tokio::time::timeout(Duration::from_secs(2), rx.recv()).await??)
}

/// Polls `cond` until it holds or two seconds pass.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Deterministic content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}
