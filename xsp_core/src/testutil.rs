//! Test utilities for `Storage` implementations.
//!
//! A conformance suite that can be run against any `Storage` implementation
//! to verify it honours the save rules the filesystem layer relies on.
//!
//! # Usage
//!
//! In your storage crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! xsp_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use xsp_core::testutil::StorageTests;
//!
//! #[tokio::test]
//! async fn test_my_storage() {
//!     let storage = MyStorage::new(...);
//!     StorageTests::new(&storage).run_all().await.unwrap();
//! }
//! ```

use anyhow::{anyhow, ensure};
use bytes::Bytes;
use std::collections::HashSet;

use crate::obj::{EncryptedObj, ObjId};
use crate::storage::{Storage, StorageError};

/// Test suite for `Storage` implementations.
pub struct StorageTests<'a, S> {
    storage: &'a S,
}

impl<'a, S: Storage> StorageTests<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Self { storage }
    }

    /// Run all tests.
    pub async fn run_all(&self) -> anyhow::Result<()> {
        self.test_generate_unique_ids().await?;
        self.test_save_and_get().await?;
        self.test_new_obj_collision().await?;
        self.test_version_sequence().await?;
        self.test_missing_obj().await?;
        self.test_remove().await?;
        Ok(())
    }

    fn obj(version: u64, fill: u8) -> EncryptedObj {
        EncryptedObj::new(
            version,
            Bytes::from(vec![fill; 40]),
            Bytes::from(vec![fill; 100]),
        )
    }

    async fn fresh_id(&self) -> anyhow::Result<ObjId> {
        Ok(self.storage.generate_new_obj_id().await?)
    }

    async fn test_generate_unique_ids(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let id = self.fresh_id().await?;
            ensure!(!id.is_root(), "generated id collides with the root id");
            ensure!(seen.insert(id), "generated duplicate object id");
        }
        Ok(())
    }

    async fn test_save_and_get(&self) -> anyhow::Result<()> {
        let id = self.fresh_id().await?;
        let obj = Self::obj(1, 3);
        self.storage.save_obj(&id, obj.clone()).await?;
        let read = self.storage.get_obj(&id).await?;
        ensure!(read == obj, "read back a different object");
        self.storage.remove_obj(&id).await?;
        Ok(())
    }

    async fn test_new_obj_collision(&self) -> anyhow::Result<()> {
        let id = self.fresh_id().await?;
        self.storage.save_obj(&id, Self::obj(1, 1)).await?;
        match self.storage.save_obj(&id, Self::obj(1, 2)).await {
            Err(StorageError::ObjExists(existing)) => {
                ensure!(existing == id, "ObjExists names the wrong id")
            }
            other => return Err(anyhow!("expected ObjExists, got {other:?}")),
        }
        self.storage.remove_obj(&id).await?;
        Ok(())
    }

    async fn test_version_sequence(&self) -> anyhow::Result<()> {
        let id = self.fresh_id().await?;
        self.storage.save_obj(&id, Self::obj(1, 1)).await?;
        self.storage.save_obj(&id, Self::obj(2, 2)).await?;
        ensure!(
            self.storage.get_obj(&id).await?.version == 2,
            "current version not advanced"
        );
        match self.storage.save_obj(&id, Self::obj(2, 3)).await {
            Err(StorageError::ConcurrentTransaction(_)) => {}
            other => return Err(anyhow!("expected ConcurrentTransaction, got {other:?}")),
        }
        match self.storage.save_obj(&id, Self::obj(5, 3)).await {
            Err(StorageError::ConcurrentTransaction(_)) => {}
            other => return Err(anyhow!("expected ConcurrentTransaction, got {other:?}")),
        }
        self.storage.remove_obj(&id).await?;
        Ok(())
    }

    async fn test_missing_obj(&self) -> anyhow::Result<()> {
        let id = self.fresh_id().await?;
        match self.storage.get_obj(&id).await {
            Err(StorageError::ObjNotFound(_)) => {}
            other => return Err(anyhow!("expected ObjNotFound, got {other:?}")),
        }
        match self.storage.save_obj(&id, Self::obj(3, 1)).await {
            Err(StorageError::ObjNotFound(_)) => {}
            other => return Err(anyhow!("expected ObjNotFound, got {other:?}")),
        }
        Ok(())
    }

    async fn test_remove(&self) -> anyhow::Result<()> {
        let id = self.fresh_id().await?;
        self.storage.save_obj(&id, Self::obj(1, 1)).await?;
        self.storage.remove_obj(&id).await?;
        ensure!(
            matches!(
                self.storage.get_obj(&id).await,
                Err(StorageError::ObjNotFound(_))
            ),
            "removed object is still readable"
        );
        // removing twice is not an error
        self.storage.remove_obj(&id).await?;
        Ok(())
    }
}
