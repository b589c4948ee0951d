//! Symmetric encryption of provider secrets.
//!
//! Secrets are encrypted with AES-256 in CBC mode with PKCS#7 padding. Every
//! call to [`CipherStore::encrypt`] draws a fresh 128-bit IV from the thread
//! CSPRNG, so two encryptions of the same plaintext never share an IV.
//!
//! The master key is validated once, in [`CipherStore::new`]. After that,
//! encryption cannot fail and decryption only fails on bad input.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use std::fmt;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Master key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// IV length in bytes (one AES block).
pub const IV_LEN: usize = 16;

/// Errors constructing a [`CipherStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Master key must be exactly {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Master key is not valid hex: {0}")]
    InvalidHex(String),
}

/// Decryption failures: wrong key, corrupted ciphertext or tampered IV.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptionError {
    #[error("IV must be {IV_LEN} bytes, got {0}")]
    InvalidIv(usize),

    #[error("Ciphertext is empty or not a whole number of blocks")]
    InvalidLength,

    #[error("Padding check failed (wrong key or corrupted data)")]
    BadPadding,

    #[error("Decrypted secret is not valid UTF-8")]
    InvalidUtf8,
}

/// Output of a single encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedSecret {
    /// Padded AES-256-CBC ciphertext
    pub ciphertext: Vec<u8>,

    /// IV used for this ciphertext only
    pub iv: [u8; IV_LEN],
}

impl fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

/// AES-256-CBC encryption bound to one master key.
///
/// The key is held in a [`SecretBox`] so it is zeroed on drop and never
/// printed by `Debug`.
pub struct CipherStore {
    key: SecretBox<[u8; KEY_LEN]>,
}

impl CipherStore {
    /// Create a cipher from raw key bytes.
    ///
    /// Fails unless `key` is exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        Ok(Self {
            key: SecretBox::new(Box::new(key)),
        })
    }

    /// Create a cipher from a hex-encoded key (64 hex characters).
    pub fn from_hex(encoded: &str) -> Result<Self, CipherError> {
        let bytes =
            hex::decode(encoded.trim()).map_err(|e| CipherError::InvalidHex(e.to_string()))?;
        Self::new(&bytes)
    }

    /// Encrypt a secret under a freshly generated IV.
    pub fn encrypt(&self, plaintext: &str) -> EncryptedSecret {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(self.key.expose_secret().into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        EncryptedSecret { ciphertext, iv }
    }

    /// Decrypt a ciphertext produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<String, DecryptionError> {
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| DecryptionError::InvalidIv(iv.len()))?;

        if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
            return Err(DecryptionError::InvalidLength);
        }

        let plaintext = Aes256CbcDec::new(self.key.expose_secret().into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| DecryptionError::BadPadding)?;

        String::from_utf8(plaintext).map_err(|_| DecryptionError::InvalidUtf8)
    }
}

impl fmt::Debug for CipherStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherStore")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
