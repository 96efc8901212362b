//! At-rest codec for persisted backlog documents
//!
//! Documents are serialized to JSON, encrypted, and base64-armored before
//! they reach the persistent store. The default cipher is AES-128-ECB with
//! PKCS7 padding under a key embedded in the binary, the format older
//! clients already wrote to disk. That is an at-rest confidentiality
//! primitive, not real protection; the [`Cipher`] trait exists so a proper
//! key-management strategy can be substituted without touching the rest of
//! the pipeline.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

/// Key used by legacy clients. Must not change after release, or already
/// persisted backlogs become undecodable.
pub const LEGACY_KEY: [u8; 16] = *b"39de5d3b2a503633";

/// Symmetric at-rest encryption of serialized documents.
pub trait Cipher: Send + Sync {
    /// Encrypt plaintext bytes into a printable string
    fn encrypt(&self, plaintext: &[u8]) -> Result<String>;
    /// Invert [`Cipher::encrypt`]
    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>>;
}

/// AES-128-ECB/PKCS7 with a fixed embedded key, base64-armored.
pub struct FixedKeyCipher {
    key: [u8; 16],
}

impl FixedKeyCipher {
    pub fn new(key: [u8; 16]) -> Self {
        FixedKeyCipher { key }
    }
}

impl Default for FixedKeyCipher {
    fn default() -> Self {
        FixedKeyCipher::new(LEGACY_KEY)
    }
}

impl Cipher for FixedKeyCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let ciphertext =
            Aes128EcbEnc::new(&self.key.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        Ok(BASE64.encode(ciphertext))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|e| Error::Crypto(format!("invalid base64: {}", e)))?;
        Aes128EcbDec::new(&self.key.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&raw)
            .map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))
    }
}

/// Serializes and encrypts backlog documents for the persistent store.
pub struct Codec {
    cipher: Box<dyn Cipher>,
}

impl Codec {
    pub fn new(cipher: Box<dyn Cipher>) -> Self {
        Codec { cipher }
    }

    /// Codec compatible with backlogs persisted by legacy clients
    pub fn legacy() -> Self {
        Codec::new(Box::<FixedKeyCipher>::default())
    }

    /// JSON-serialize `document`, then encrypt for storage
    pub fn encode<T: Serialize>(&self, document: &T) -> Result<String> {
        let json = serde_json::to_string(document)?;
        self.cipher.encrypt(json.as_bytes())
    }

    /// Decrypt `blob`, then parse the contained JSON document
    pub fn decode<T: DeserializeOwned>(&self, blob: &str) -> Result<T> {
        let raw = self.cipher.decrypt(blob)?;
        let json = String::from_utf8(raw)
            .map_err(|e| Error::Crypto(format!("decrypted payload is not UTF-8: {}", e)))?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::legacy()
    }
}
