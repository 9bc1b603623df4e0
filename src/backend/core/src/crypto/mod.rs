//! Crypto collaborator: key storage, hybrid encryption and signing.
//!
//! Keys are referenced by the legal entity identifier that owns them.
//! All calls are synchronous; callers must not hold aggregate state locks
//! across them.

pub mod jwk;
pub mod local;

pub use jwk::Jwk;
pub use local::LocalCryptoProvider;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Symmetric cipher text plus the symmetric key wrapped once per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleEncryptedCipherText {
    pub cipher_text: Vec<u8>,
    /// One wrapped key per recipient, in recipient order
    pub cipher_text_keys: Vec<Vec<u8>>,
    pub nonce: Vec<u8>,
}

pub trait CryptoProvider: Send + Sync {
    /// Whether this node holds the private key of `entity`.
    fn private_key_exists(&self, entity: &str) -> bool;

    fn public_key_as_jwk(&self, entity: &str) -> Result<Jwk>;

    fn sign(&self, data: &[u8], entity: &str) -> Result<Vec<u8>>;

    /// Encrypt `plain_text` under a fresh symmetric key and wrap that key for each recipient.
    fn encrypt_key_and_plain_text(
        &self,
        plain_text: &[u8],
        recipients: &[Jwk],
    ) -> Result<DoubleEncryptedCipherText>;

    /// Unwrap `wrapped_key` with the private key of `entity` and decrypt `cipher_text`.
    fn decrypt_key_and_cipher_text(
        &self,
        cipher_text: &[u8],
        wrapped_key: &[u8],
        nonce: &[u8],
        entity: &str,
    ) -> Result<Vec<u8>>;

    /// Deterministic identifier for a subject/actor pair under the key of `entity`.
    fn calculate_external_id(&self, subject: &str, actor: &str, entity: &str) -> Result<Vec<u8>>;

    fn generate_key_pair(&self, entity: &str) -> Result<()>;
}
