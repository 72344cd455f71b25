//! Link nodes and the rules for where a link may point.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use xsp_core::{EncryptedObj, KEY_LEN, ObjId, StorageType};

use crate::api::XspFs;
use crate::codec::{NodeInfo, NodeKind, SharedKey, shared_key};
use crate::crypto::{LinkCrypto, NodeContentCrypto, NodeCrypto};
use crate::file_object::FileObject;
use crate::folder::load_node;
use crate::node::{EventSource, NodeCore, NodeEventKind, Stats, TxMode};
use crate::nodes::Node;
use crate::storage::FsStorage;
use crate::{FsError, FsResult};

/// Stored content of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkParameters {
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_file: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_folder: bool,
    #[serde(default)]
    pub readonly: bool,
    pub params: LinkTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkTarget {
    Obj(ObjLinkParams),
    Device(DeviceLinkParams),
}

/// Target inside an object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjLinkParams {
    pub obj_id: ObjId,
    /// Base64 of the target's object key.
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Target on the device's own filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLinkParams {
    pub path: String,
}

/// How a link from one storage type reaches a target in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkResolution {
    /// Target lives in the link's own storage.
    SameStorage,
    /// Target lives in a sibling storage handed out by the link's storage.
    LinkedStorage,
    /// Target is a path on the device filesystem.
    DeviceFs,
}

/// Allow-list of link directions. `None` means the link is not allowed.
pub fn link_resolution(from: StorageType, to: StorageType) -> Option<LinkResolution> {
    use LinkResolution::*;
    use xsp_core::StorageType::*;
    match (from, to) {
        (Local, Local) | (Synced, Synced) | (Share, Share) => Some(SameStorage),
        (Local, Synced) | (Local, Share) | (Synced, Share) => Some(LinkedStorage),
        (Local, Device) => Some(DeviceFs),
        _ => None,
    }
}

pub fn is_link_allowed(from: StorageType, to: StorageType) -> bool {
    link_resolution(from, to).is_some()
}

/// What reading a link yields.
pub enum ResolvedLink {
    File(FileObject),
    Folder(XspFs),
    Device(DeviceLinkParams),
}

impl std::fmt::Debug for ResolvedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedLink::File(file) => f.debug_tuple("File").field(&file.name()).finish(),
            ResolvedLink::Folder(_) => f.write_str("Folder"),
            ResolvedLink::Device(params) => f.debug_tuple("Device").field(params).finish(),
        }
    }
}

#[derive(Debug)]
pub struct LinkNode {
    core: NodeCore,
    crypto: LinkCrypto,
    params: RwLock<LinkParameters>,
}

impl LinkNode {
    pub(crate) fn new_unsaved(
        storage: FsStorage,
        obj_id: ObjId,
        parent_id: Option<ObjId>,
        name: String,
        key: SharedKey,
        params: LinkParameters,
    ) -> Arc<Self> {
        let crypto = LinkCrypto::new(NodeCrypto::for_new_obj(key, storage.cryptor()));
        Arc::new(Self {
            core: NodeCore::new(storage, obj_id, parent_id, name, 0),
            crypto,
            params: RwLock::new(params),
        })
    }

    pub(crate) fn initial_obj(&self) -> FsResult<EncryptedObj> {
        let params = self.params();
        self.crypto.pack(&params, 1)
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
        let crypto = LinkCrypto::new(NodeCrypto::for_existing_obj(key, &obj, storage.cryptor())?);
        let params = crypto.open(obj).map_err(|e| e.at_path(&name))?;
        Ok(Arc::new(Self {
            core: NodeCore::new(storage, obj_id, parent_id, name, version),
            crypto,
            params: RwLock::new(params),
        }))
    }

    pub(crate) fn core(&self) -> &NodeCore {
        &self.core
    }

    pub(crate) fn crypto(&self) -> &LinkCrypto {
        &self.crypto
    }

    pub fn name(&self) -> String {
        self.core.name()
    }

    pub fn params(&self) -> LinkParameters {
        self.params.read().clone()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            is_file: false,
            is_folder: false,
            is_link: true,
            size: None,
            version: self.core.version(),
        }
    }

    /// Opens the link target.
    pub async fn target(&self) -> FsResult<ResolvedLink> {
        let params = self.params();
        let from = self.core.storage().storage_type();
        let resolution = link_resolution(from, params.storage_type).ok_or(
            FsError::LinkNotAllowed {
                from,
                to: params.storage_type,
            },
        )?;
        let target = match (resolution, &params.params) {
            (LinkResolution::DeviceFs, LinkTarget::Device(device)) => {
                return Ok(ResolvedLink::Device(device.clone()));
            }
            (LinkResolution::DeviceFs, LinkTarget::Obj(_))
            | (_, LinkTarget::Device(_)) => {
                return Err(FsError::parsing(
                    self.name(),
                    "link parameters do not match the target storage type",
                ));
            }
            (_, LinkTarget::Obj(target)) => target,
        };
        let storage = match resolution {
            LinkResolution::LinkedStorage => {
                self.core
                    .storage()
                    .storage_for_linking(params.storage_type, target.location.as_deref())
                    .await?
            }
            _ => self.core.storage().clone(),
        };
        let key = decode_key(&target.key).ok_or_else(|| {
            FsError::parsing(self.name(), "link key is not a base64 encoded key")
        })?;
        let kind = match (params.is_file, params.is_folder) {
            (true, false) => NodeKind::File,
            (false, true) => NodeKind::Folder,
            _ => {
                return Err(FsError::parsing(
                    self.name(),
                    "link must target exactly one of a file or a folder",
                ));
            }
        };
        let info = NodeInfo {
            name: target.name.clone(),
            obj_id: target.obj_id.clone(),
            kind,
            key,
        };
        let node = load_node(&storage, None, &info).await?;
        if !node.node_crypto().compare_key(&target.key)? {
            return Err(FsError::inconsistent(
                self.name(),
                "link key does not match the live target",
            ));
        }
        let writable = !params.readonly;
        Ok(match node {
            Node::File(file) => ResolvedLink::File(FileObject::new(file, writable)),
            Node::Folder(folder) => {
                ResolvedLink::Folder(XspFs::from_folder(storage, folder, writable))
            }
            Node::Link(_) => return Err(FsError::not_link(self.name())),
        })
    }

    pub async fn delete(self: &Arc<Self>, mode: TxMode) -> FsResult<()> {
        let _tx = self.core.begin_tx(mode).await?;
        self.core.retire(&Node::Link(self.clone())).await?;
        self.crypto.wipe();
        Ok(())
    }

    pub async fn absorb_external_change(&self) -> FsResult<bool> {
        let _tx = self.core.begin_tx(TxMode::Wait).await?;
        let obj = self.core.get_obj().await?;
        if obj.version <= self.core.version() {
            return Ok(false);
        }
        self.adopt(obj)?;
        Ok(true)
    }

    pub async fn resolve_conflict(&self, remote_version: u64) -> FsResult<bool> {
        let Some(obj) = self.core.adopt_synced_version(remote_version).await? else {
            return Ok(false);
        };
        self.adopt(obj)?;
        Ok(true)
    }

    fn adopt(&self, obj: EncryptedObj) -> FsResult<()> {
        let version = obj.version;
        let params = self.crypto.open(obj).map_err(|e| e.at_path(&self.name()))?;
        *self.params.write() = params;
        self.core.set_version(version);
        self.core.emit(EventSource::Remote, NodeEventKind::FileChange);
        Ok(())
    }
}

fn decode_key(key_b64: &str) -> Option<SharedKey> {
    let bytes = zeroize::Zeroizing::new(BASE64.decode(key_b64).ok()?);
    let key: [u8; KEY_LEN] = bytes.as_slice().try_into().ok()?;
    Some(shared_key(key))
}
