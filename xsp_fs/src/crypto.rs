//! Per-node encryption.
//!
//! [`NodeCrypto`] owns a node's key and zeroth nonce and turns plaintext into
//! [`EncryptedObj`]s and back. Layout of one object version:
//!
//! ```text
//! header   = zeroth_nonce (24, plain)
//!          || seal(version_nonce, segment_size u32 BE || content_len u64 BE || version u64 BE)
//! segments = seal(segment_nonce(0), plain[0..4096]) || seal(segment_nonce(1), ...) || ...
//! ```
//!
//! The kind-specific wrappers ([`FileCrypto`], [`FolderCrypto`],
//! [`LinkCrypto`]) add the content encoding on top through
//! [`NodeContentCrypto`].

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::ops::Deref;
use std::sync::Arc;
use xsp_core::crypto::{
    self, CryptoError, Cryptor, NONCE_LEN, Nonce, POLY_LEN, SEGMENT_SIZE,
};
use xsp_core::EncryptedObj;
use zeroize::{Zeroize, Zeroizing};

use crate::codec::{FolderInfo, SharedKey, decode_folder_info, encode_folder_info, shared_key};
use crate::link::LinkParameters;
use crate::{FsError, FsResult};

const HEADER_PLAIN_LEN: usize = 4 + 8 + 8;
/// Total length of an object header.
pub const HEADER_LEN: usize = NONCE_LEN + HEADER_PLAIN_LEN + POLY_LEN;
const SEALED_SEGMENT_LEN: usize = SEGMENT_SIZE + POLY_LEN;

struct KeyMaterial {
    key: SharedKey,
    zeroth_nonce: Nonce,
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.zeroth_nonce.zeroize();
    }
}

/// Key material of one node plus the cipher to use it with.
pub struct NodeCrypto {
    material: RwLock<Option<KeyMaterial>>,
    cryptor: Arc<dyn Cryptor>,
}

impl std::fmt::Debug for NodeCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCrypto")
            .field("wiped", &self.is_wiped())
            .finish_non_exhaustive()
    }
}

impl NodeCrypto {
    pub fn new(key: SharedKey, zeroth_nonce: Nonce, cryptor: Arc<dyn Cryptor>) -> Self {
        Self {
            material: RwLock::new(Some(KeyMaterial { key, zeroth_nonce })),
            cryptor,
        }
    }

    /// Crypto for an object that has never been written; picks a fresh nonce.
    pub fn for_new_obj(key: SharedKey, cryptor: Arc<dyn Cryptor>) -> Self {
        Self::new(key, crypto::generate_nonce(), cryptor)
    }

    /// Crypto for a stored object; the zeroth nonce comes from its header.
    pub fn for_existing_obj(
        key: SharedKey,
        obj: &EncryptedObj,
        cryptor: Arc<dyn Cryptor>,
    ) -> Result<Self, CryptoError> {
        if obj.header.len() < NONCE_LEN {
            return Err(CryptoError::DataTooShort(NONCE_LEN));
        }
        let mut zeroth_nonce = [0u8; NONCE_LEN];
        zeroth_nonce.copy_from_slice(&obj.header[..NONCE_LEN]);
        Ok(Self::new(key, zeroth_nonce, cryptor))
    }

    fn with_material<T>(
        &self,
        f: impl FnOnce(&KeyMaterial) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        match self.material.read().as_ref() {
            Some(material) => f(material),
            None => Err(CryptoError::Wiped),
        }
    }

    pub fn key(&self) -> Result<SharedKey, CryptoError> {
        self.with_material(|m| Ok(m.key.clone()))
    }

    pub fn key_in_base64(&self) -> Result<String, CryptoError> {
        self.with_material(|m| Ok(BASE64.encode(m.key.as_slice())))
    }

    pub fn has_key(&self, key: &[u8]) -> Result<bool, CryptoError> {
        self.with_material(|m| Ok(m.key.as_slice() == key))
    }

    /// Whether `key_b64` is the key of this node.
    pub fn compare_key(&self, key_b64: &str) -> Result<bool, CryptoError> {
        let Ok(other) = BASE64.decode(key_b64) else {
            return Ok(false);
        };
        let other = Zeroizing::new(other);
        self.with_material(|m| Ok(m.key.as_slice() == other.as_slice()))
    }

    pub fn segment_writer(&self, version: u64) -> Result<SegmentWriter, CryptoError> {
        self.with_material(|m| {
            Ok(SegmentWriter {
                key: m.key.clone(),
                cryptor: self.cryptor.clone(),
                zeroth_nonce: m.zeroth_nonce,
                version_nonce: crypto::version_nonce(&m.zeroth_nonce, version),
                version,
                pending: Zeroizing::new(Vec::with_capacity(SEGMENT_SIZE)),
                sealed: BytesMut::new(),
                next_segment: 0,
                content_len: 0,
            })
        })
    }

    pub fn segment_reader(&self, obj: EncryptedObj) -> Result<SegmentReader, CryptoError> {
        self.with_material(|m| SegmentReader::open(m, self.cryptor.clone(), obj))
    }

    pub fn pack_bytes(&self, content: &[u8], version: u64) -> Result<EncryptedObj, CryptoError> {
        let mut writer = self.segment_writer(version)?;
        writer.write(content)?;
        writer.finish()
    }

    pub fn open_bytes(&self, obj: EncryptedObj) -> Result<Vec<u8>, CryptoError> {
        self.segment_reader(obj)?.read_all()
    }

    /// Drops this holder's key material. Every later operation fails with
    /// [`CryptoError::Wiped`]. The key itself is shared with the parent
    /// listing and is zeroed once its last holder lets go of it.
    pub fn wipe(&self) {
        self.material.write().take();
    }

    pub fn is_wiped(&self) -> bool {
        self.material.read().is_none()
    }
}

/// Incremental encryption of one object version.
pub struct SegmentWriter {
    key: SharedKey,
    cryptor: Arc<dyn Cryptor>,
    zeroth_nonce: Nonce,
    version_nonce: Nonce,
    version: u64,
    pending: Zeroizing<Vec<u8>>,
    sealed: BytesMut,
    next_segment: u64,
    content_len: u64,
}

impl SegmentWriter {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content_len(&self) -> u64 {
        self.content_len
    }

    pub fn write(&mut self, mut data: &[u8]) -> Result<(), CryptoError> {
        while !data.is_empty() {
            let take = (SEGMENT_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            self.content_len += take as u64;
            data = &data[take..];
            if self.pending.len() == SEGMENT_SIZE {
                self.seal_pending()?;
            }
        }
        Ok(())
    }

    fn seal_pending(&mut self) -> Result<(), CryptoError> {
        let nonce = crypto::segment_nonce(&self.version_nonce, self.next_segment);
        let sealed = self.cryptor.seal(&self.key, &nonce, &self.pending)?;
        self.sealed.extend_from_slice(&sealed);
        self.pending.clear();
        self.next_segment += 1;
        Ok(())
    }

    fn pack_header(&self) -> Result<Vec<u8>, CryptoError> {
        let mut plain = Vec::with_capacity(HEADER_PLAIN_LEN);
        plain.extend_from_slice(&(SEGMENT_SIZE as u32).to_be_bytes());
        plain.extend_from_slice(&self.content_len.to_be_bytes());
        plain.extend_from_slice(&self.version.to_be_bytes());
        let sealed = self.cryptor.seal(&self.key, &self.version_nonce, &plain)?;
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&self.zeroth_nonce);
        header.extend_from_slice(&sealed);
        Ok(header)
    }

    pub fn finish(mut self) -> Result<EncryptedObj, CryptoError> {
        if !self.pending.is_empty() {
            self.seal_pending()?;
        }
        let header = self.pack_header()?;
        let segments = std::mem::take(&mut self.sealed).freeze();
        Ok(EncryptedObj::new(self.version, header, segments))
    }
}

/// Random access decryption of one object version.
pub struct SegmentReader {
    key: SharedKey,
    cryptor: Arc<dyn Cryptor>,
    version_nonce: Nonce,
    version: u64,
    content_len: u64,
    segments: Bytes,
}

impl SegmentReader {
    fn open(
        material: &KeyMaterial,
        cryptor: Arc<dyn Cryptor>,
        obj: EncryptedObj,
    ) -> Result<Self, CryptoError> {
        if obj.header.len() != HEADER_LEN {
            return Err(CryptoError::MalformedHeader(format!(
                "expected {HEADER_LEN} bytes, got {}",
                obj.header.len()
            )));
        }
        if obj.header[..NONCE_LEN] != material.zeroth_nonce {
            return Err(CryptoError::MalformedHeader("zeroth nonce mismatch".into()));
        }
        let version_nonce = crypto::version_nonce(&material.zeroth_nonce, obj.version);
        let plain = cryptor.open(&material.key, &version_nonce, &obj.header[NONCE_LEN..])?;
        if plain.len() != HEADER_PLAIN_LEN {
            return Err(CryptoError::MalformedHeader("bad header length".into()));
        }
        let segment_size = u32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
        let mut word = [0u8; 8];
        word.copy_from_slice(&plain[4..12]);
        let content_len = u64::from_be_bytes(word);
        word.copy_from_slice(&plain[12..20]);
        let version = u64::from_be_bytes(word);

        if segment_size as usize != SEGMENT_SIZE {
            return Err(CryptoError::MalformedHeader(format!(
                "unsupported segment size {segment_size}"
            )));
        }
        if version != obj.version {
            return Err(CryptoError::MalformedHeader(format!(
                "header names version {version}, object is version {}",
                obj.version
            )));
        }
        if obj.segments.len() as u64 != sealed_len(content_len) {
            return Err(CryptoError::MalformedHeader(format!(
                "{} segment bytes for content of {content_len} bytes",
                obj.segments.len()
            )));
        }
        Ok(Self {
            key: material.key.clone(),
            cryptor,
            version_nonce,
            version,
            content_len,
            segments: obj.segments,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content_len(&self) -> u64 {
        self.content_len
    }

    pub fn segment_count(&self) -> u64 {
        self.content_len.div_ceil(SEGMENT_SIZE as u64)
    }

    pub fn open_segment(&self, index: u64) -> Result<Vec<u8>, CryptoError> {
        let start = index as usize * SEALED_SEGMENT_LEN;
        if index >= self.segment_count() {
            return Err(CryptoError::DataTooShort(start + POLY_LEN));
        }
        let end = (start + SEALED_SEGMENT_LEN).min(self.segments.len());
        let nonce = crypto::segment_nonce(&self.version_nonce, index);
        self.cryptor
            .open(&self.key, &nonce, &self.segments[start..end])
    }

    /// Plaintext in `[start, end)`, clamped to the content length.
    pub fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, CryptoError> {
        let end = end.min(self.content_len);
        if start >= end {
            return Ok(Vec::new());
        }
        let seg = SEGMENT_SIZE as u64;
        let mut out = Vec::with_capacity((end - start) as usize);
        for index in start / seg..=(end - 1) / seg {
            let plain = Zeroizing::new(self.open_segment(index)?);
            let seg_start = index * seg;
            let from = start.saturating_sub(seg_start) as usize;
            let to = ((end - seg_start) as usize).min(plain.len());
            out.extend_from_slice(&plain[from..to]);
        }
        Ok(out)
    }

    pub fn read_all(&self) -> Result<Vec<u8>, CryptoError> {
        self.read_range(0, self.content_len)
    }
}

fn sealed_len(content_len: u64) -> u64 {
    let seg = SEGMENT_SIZE as u64;
    let full = content_len / seg;
    let rest = content_len % seg;
    full * SEALED_SEGMENT_LEN as u64 + if rest > 0 { rest + POLY_LEN as u64 } else { 0 }
}

/// Content encoding of one node kind on top of [`NodeCrypto`].
pub trait NodeContentCrypto: Deref<Target = NodeCrypto> {
    type Content;

    fn pack(&self, content: &Self::Content, version: u64) -> FsResult<EncryptedObj>;

    fn open(&self, obj: EncryptedObj) -> FsResult<Self::Content>;
}

macro_rules! node_crypto_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name(NodeCrypto);

        impl $name {
            pub fn new(crypto: NodeCrypto) -> Self {
                Self(crypto)
            }
        }

        impl Deref for $name {
            type Target = NodeCrypto;

            fn deref(&self) -> &NodeCrypto {
                &self.0
            }
        }
    };
}

node_crypto_wrapper!(
    /// File content is stored as-is.
    FileCrypto
);
node_crypto_wrapper!(
    /// Folder content is the encoded child listing.
    FolderCrypto
);
node_crypto_wrapper!(
    /// Link content is the JSON encoded [`LinkParameters`].
    LinkCrypto
);

impl NodeContentCrypto for FileCrypto {
    type Content = Bytes;

    fn pack(&self, content: &Bytes, version: u64) -> FsResult<EncryptedObj> {
        Ok(self.pack_bytes(content, version)?)
    }

    fn open(&self, obj: EncryptedObj) -> FsResult<Bytes> {
        Ok(self.open_bytes(obj)?.into())
    }
}

impl NodeContentCrypto for FolderCrypto {
    type Content = FolderInfo;

    fn pack(&self, content: &FolderInfo, version: u64) -> FsResult<EncryptedObj> {
        let plain = Zeroizing::new(encode_folder_info(content));
        Ok(self.pack_bytes(&plain, version)?)
    }

    fn open(&self, obj: EncryptedObj) -> FsResult<FolderInfo> {
        let plain = Zeroizing::new(self.open_bytes(obj)?);
        decode_folder_info(&plain).map_err(|e| FsError::parsing("folder", e))
    }
}

impl NodeContentCrypto for LinkCrypto {
    type Content = LinkParameters;

    fn pack(&self, content: &LinkParameters, version: u64) -> FsResult<EncryptedObj> {
        let plain = serde_json::to_vec(content).map_err(|e| FsError::parsing("link", e))?;
        Ok(self.pack_bytes(&Zeroizing::new(plain), version)?)
    }

    fn open(&self, obj: EncryptedObj) -> FsResult<LinkParameters> {
        let plain = Zeroizing::new(self.open_bytes(obj)?);
        serde_json::from_slice(&plain).map_err(|e| FsError::parsing("link", e))
    }
}

/// Fresh random key for a new node.
pub fn new_node_key() -> SharedKey {
    shared_key(crypto::generate_key())
}
