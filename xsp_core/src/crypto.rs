//! Segment cipher capability.
//!
//! Object content is sealed in fixed-size segments with XChaCha20-Poly1305.
//! The cipher itself is reached through the [`Cryptor`] trait so a storage can
//! hand out a different implementation (e.g. one backed by a worker pool).

use chacha20poly1305::{
    Key as CipherKey, XChaCha20Poly1305, XNonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;

/// Size of a symmetric object key in bytes.
pub const KEY_LEN: usize = 32;
/// Size of an XChaCha20-Poly1305 nonce in bytes.
pub const NONCE_LEN: usize = 24;
/// Size of the Poly1305 authentication tag appended to every sealed chunk.
pub const POLY_LEN: usize = 16;
/// Plaintext length of one content segment (16 x 256 bytes).
pub const SEGMENT_SIZE: usize = 16 * 256;

pub type Key = [u8; KEY_LEN];
pub type Nonce = [u8; NONCE_LEN];

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("Data too short: expected at least {0} bytes")]
    DataTooShort(usize),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,
    #[error("Key material has been wiped")]
    Wiped,
    #[error("Malformed object header: {0}")]
    MalformedHeader(String),
}

/// Authenticated encryption of a single chunk under an explicit nonce.
pub trait Cryptor: std::fmt::Debug + Send + Sync + 'static {
    fn seal(&self, key: &Key, nonce: &Nonce, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn open(&self, key: &Key, nonce: &Nonce, cipher: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// In-process XChaCha20-Poly1305.
#[derive(Debug, Default, Clone, Copy)]
pub struct XChaChaCryptor;

impl Cryptor for XChaChaCryptor {
    fn seal(&self, key: &Key, nonce: &Nonce, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new(CipherKey::from_slice(key));
        cipher
            .encrypt(XNonce::from_slice(nonce), plain)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn open(&self, key: &Key, nonce: &Nonce, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if cipher.len() < POLY_LEN {
            return Err(CryptoError::DataTooShort(POLY_LEN));
        }
        let aead = XChaCha20Poly1305::new(CipherKey::from_slice(key));
        aead.decrypt(XNonce::from_slice(nonce), cipher)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Generate a random object key.
pub fn generate_key() -> Key {
    XChaCha20Poly1305::generate_key(&mut OsRng).into()
}

/// Generate a random zeroth nonce for a new object.
pub fn generate_nonce() -> Nonce {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut out = [0u8; NONCE_LEN];
    out.copy_from_slice(&nonce);
    out
}

pub fn key_from_slice(bytes: &[u8]) -> Result<Key, CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))
}

/// Adds `delta` (wrapping) to the little-endian u64 stored at `nonce[at..at + 8]`.
fn add_to_nonce(nonce: &Nonce, at: usize, delta: u64) -> Nonce {
    let mut out = *nonce;
    let mut word = [0u8; 8];
    word.copy_from_slice(&out[at..at + 8]);
    let sum = u64::from_le_bytes(word).wrapping_add(delta);
    out[at..at + 8].copy_from_slice(&sum.to_le_bytes());
    out
}

/// Nonce for one version of an object: the zeroth nonce with `version`
/// folded into bytes `0..8`. Also the nonce of that version's header.
pub fn version_nonce(zeroth: &Nonce, version: u64) -> Nonce {
    add_to_nonce(zeroth, 0, version)
}

/// Nonce of segment `index` within a version: the version nonce with
/// `index + 1` folded into bytes `8..16`, keeping it apart from the header.
pub fn segment_nonce(version_nonce: &Nonce, index: u64) -> Nonce {
    add_to_nonce(version_nonce, 8, index.wrapping_add(1))
}
