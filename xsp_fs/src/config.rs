//! TOML configuration for opening a tree.
//!
//! ```toml
//! [storage]
//! type = "local"
//! base_path = "/var/lib/xsp/private"
//!
//! [[linked]]
//! location = "team"
//! [linked.storage]
//! type = "memory"
//! storage_type = "share"
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use xsp_core::{Storage, StorageType};
use xsp_store_local::{LocalStorage, LocalStorageConfig};
use xsp_store_memory::MemoryStorage;

use crate::{FsError, XspFs, derive_root_key};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct XspFsConfig {
    pub storage: StorageConfig,
    /// Storages that links from `storage` resolve in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked: Vec<LinkedStorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum StorageConfig {
    Memory(MemoryStorageConfig),
    Local(LocalStorageConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryStorageConfig {
    #[serde(default = "default_storage_type")]
    pub storage_type: StorageType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkedStorageConfig {
    /// Narrows the registration to links carrying this location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub storage: StorageConfig,
}

fn default_storage_type() -> StorageType {
    StorageType::Local
}

enum Opened {
    Memory(Arc<MemoryStorage>),
    Local(Arc<LocalStorage>),
}

impl StorageConfig {
    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageConfig::Memory(c) => c.storage_type,
            StorageConfig::Local(c) => c.storage_type,
        }
    }

    fn open(&self) -> Opened {
        match self {
            StorageConfig::Memory(c) => {
                Opened::Memory(Arc::new(MemoryStorage::new(c.storage_type)))
            }
            StorageConfig::Local(c) => Opened::Local(Arc::new(LocalStorage::create(c.clone()))),
        }
    }
}

impl Opened {
    fn link_storage(
        &self,
        storage_type: StorageType,
        location: Option<&str>,
        storage: Arc<dyn Storage>,
    ) {
        match self {
            Opened::Memory(s) => s.link_storage(storage_type, location, storage),
            Opened::Local(s) => s.link_storage(storage_type, location, storage),
        }
    }

    fn into_dyn(self) -> Arc<dyn Storage> {
        match self {
            Opened::Memory(s) => s,
            Opened::Local(s) => s,
        }
    }
}

impl XspFsConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid xsp-fs config")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).context("failed to serialize xsp-fs config")
    }

    /// Opens the main storage with its linked storages registered.
    pub fn open_storage(&self) -> Arc<dyn Storage> {
        let main = self.storage.open();
        for linked in &self.linked {
            let storage = linked.storage.open().into_dyn();
            main.link_storage(
                linked.storage.storage_type(),
                linked.location.as_deref(),
                storage,
            );
        }
        main.into_dyn()
    }

    /// Opens the tree keyed by `secret`, creating its root folder on first
    /// use.
    pub async fn open_fs(&self, secret: &[u8]) -> anyhow::Result<XspFs> {
        let storage = self.open_storage();
        let root_key = derive_root_key(secret);
        match XspFs::from_existing_root(storage.clone(), &root_key).await {
            Ok(fs) => Ok(fs),
            Err(FsError::NotFound { .. }) => {
                tracing::info!(
                    storage_type = %storage.storage_type(),
                    "no root folder yet, creating one"
                );
                XspFs::make_new_root(storage, &root_key)
                    .await
                    .context("failed to create root folder")
            }
            Err(err) => Err(err).context("failed to open root folder"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_storage_with_links() {
        let config = XspFsConfig::from_toml_str(
            r#"
            [storage]
            type = "local"
            base_path = "/tmp/xsp"
            storage_type = "synced"

            [[linked]]
            location = "team"
            [linked.storage]
            type = "memory"
            storage_type = "share"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::Local(LocalStorageConfig {
                base_path: "/tmp/xsp".into(),
                storage_type: StorageType::Synced,
            })
        );
        assert_eq!(config.linked.len(), 1);
        assert_eq!(config.linked[0].location.as_deref(), Some("team"));
        assert_eq!(config.linked[0].storage.storage_type(), StorageType::Share);
    }

    #[test]
    fn storage_type_defaults_to_local() {
        let config = XspFsConfig::from_toml_str("[storage]\ntype = \"memory\"\n").unwrap();
        assert_eq!(config.storage.storage_type(), StorageType::Local);
        assert!(config.linked.is_empty());
    }

    #[test]
    fn unknown_storage_kind_is_rejected() {
        assert!(XspFsConfig::from_toml_str("[storage]\ntype = \"s3\"\n").is_err());
    }

    #[test]
    fn serializes_back_to_equal_config() {
        let config = XspFsConfig {
            storage: StorageConfig::Memory(MemoryStorageConfig {
                storage_type: StorageType::Synced,
            }),
            linked: vec![],
        };
        let text = config.to_toml_string().unwrap();
        assert_eq!(XspFsConfig::from_toml_str(&text).unwrap(), config);
    }

    #[tokio::test]
    async fn open_fs_creates_then_reopens_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = XspFsConfig {
            storage: StorageConfig::Local(LocalStorageConfig {
                base_path: dir.path().to_string_lossy().into_owned(),
                storage_type: StorageType::Local,
            }),
            linked: vec![],
        };
        let fs = config.open_fs(b"secret").await.unwrap();
        fs.write_txt_file("/hello.txt", "hi").await.unwrap();
        fs.close().await.unwrap();

        let reopened = config.open_fs(b"secret").await.unwrap();
        assert_eq!(reopened.read_txt_file("/hello.txt").await.unwrap(), "hi");
    }
}
