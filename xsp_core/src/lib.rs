//! Core XSP-FS types and traits.
//!
//! This crate defines what every XSP-FS crate agrees on:
//!
//! - Object ids (`obj::ObjId`) and the encrypted object representation
//!   (`obj::EncryptedObj`) that travels between the filesystem layer and a
//!   storage backend.
//! - The storage contracts (`Storage`, `SyncedStorage`) consumed by the
//!   filesystem; implementations live in `xsp_store_memory` and
//!   `xsp_store_local`.
//! - The segment cipher capability (`crypto::Cryptor`) with the
//!   XChaCha20-Poly1305 implementation and the nonce arithmetic that keeps
//!   (version, segment) pairs from ever sharing a nonce.
//!
//! The object layout is a wire format: changing it makes existing stores
//! unreadable.

pub mod crypto;
pub mod obj;
pub mod storage;

// Test utilities (behind feature flag)
#[cfg(feature = "testutil")]
pub mod testutil;

pub use crypto::{CryptoError, Cryptor, KEY_LEN, NONCE_LEN, SEGMENT_SIZE, XChaChaCryptor};
pub use obj::{EncryptedObj, ObjId};
pub use storage::{
    KeyDerivParams, Storage, StorageError, StorageResult, StorageType, SyncedStorage,
};
