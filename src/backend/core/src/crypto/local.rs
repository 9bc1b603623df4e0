//! In-process crypto provider.
//!
//! RSA keys live in memory. Payloads are sealed with AES-256-GCM and the
//! content key is wrapped per recipient with RSA-OAEP (SHA-256). Signatures
//! are RSASSA-PKCS1-v1_5 over SHA-256.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use dashmap::DashMap;
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PrivateKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::{CryptoProvider, DoubleEncryptedCipherText, Jwk};
use crate::error::{ConsentError, ErrorCode, Result};

const CONTENT_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const DEFAULT_KEY_BITS: usize = 2048;

pub struct LocalCryptoProvider {
    keys: DashMap<String, RsaPrivateKey>,
    key_bits: usize,
}

impl Default for LocalCryptoProvider {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_BITS)
    }
}

impl LocalCryptoProvider {
    pub fn new(key_bits: usize) -> Self {
        Self {
            keys: DashMap::new(),
            key_bits,
        }
    }

    /// Entities with a local private key.
    pub fn entities(&self) -> Vec<String> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    fn private_key(&self, entity: &str) -> Result<RsaPrivateKey> {
        self.keys
            .get(entity)
            .map(|k| k.value().clone())
            .ok_or_else(|| ConsentError::key_not_found(entity))
    }
}

/// Check a PKCS#1 v1.5 SHA-256 signature against a public JWK.
pub fn verify_signature(public_key: &Jwk, data: &[u8], signature: &[u8]) -> Result<bool> {
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.to_public_key()?);
    let Ok(signature) = Signature::try_from(signature) else {
        return Ok(false);
    };
    Ok(verifying_key.verify(data, &signature).is_ok())
}

impl CryptoProvider for LocalCryptoProvider {
    fn private_key_exists(&self, entity: &str) -> bool {
        self.keys.contains_key(entity)
    }

    fn public_key_as_jwk(&self, entity: &str) -> Result<Jwk> {
        let key = self.private_key(entity)?;
        Ok(Jwk::from_public_key(&RsaPublicKey::from(&key)))
    }

    fn sign(&self, data: &[u8], entity: &str) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key(entity)?);
        let signature = signing_key.try_sign(data).map_err(|e| {
            ConsentError::with_internal(ErrorCode::SigningFailed, "could not sign", e.to_string())
        })?;
        Ok(signature.to_vec())
    }

    fn encrypt_key_and_plain_text(
        &self,
        plain_text: &[u8],
        recipients: &[Jwk],
    ) -> Result<DoubleEncryptedCipherText> {
        let mut rng = rand::thread_rng();
        let mut content_key = [0u8; CONTENT_KEY_LEN];
        rng.fill_bytes(&mut content_key);
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new_from_slice(&content_key)
            .map_err(|e| ConsentError::crypto(format!("failed to create cipher: {e}")))?;
        let cipher_text = cipher
            .encrypt(Nonce::from_slice(&nonce), plain_text)
            .map_err(|e| ConsentError::crypto(format!("encryption failed: {e}")))?;

        let mut cipher_text_keys = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let public_key = recipient.to_public_key()?;
            cipher_text_keys.push(public_key.encrypt(&mut rng, Oaep::new::<Sha256>(), &content_key)?);
        }

        Ok(DoubleEncryptedCipherText {
            cipher_text,
            cipher_text_keys,
            nonce: nonce.to_vec(),
        })
    }

    fn decrypt_key_and_cipher_text(
        &self,
        cipher_text: &[u8],
        wrapped_key: &[u8],
        nonce: &[u8],
        entity: &str,
    ) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(ConsentError::with_internal(
                ErrorCode::DecryptionFailed,
                "decryption failed",
                format!("nonce of {} bytes", nonce.len()),
            ));
        }

        let content_key = self.private_key(entity)?.decrypt(Oaep::new::<Sha256>(), wrapped_key)?;
        let cipher = Aes256Gcm::new_from_slice(&content_key).map_err(|e| {
            ConsentError::with_internal(ErrorCode::DecryptionFailed, "decryption failed", e.to_string())
        })?;
        cipher
            .decrypt(Nonce::from_slice(nonce), cipher_text)
            .map_err(|e| {
                ConsentError::with_internal(ErrorCode::DecryptionFailed, "decryption failed", e.to_string())
            })
    }

    fn calculate_external_id(&self, subject: &str, actor: &str, entity: &str) -> Result<Vec<u8>> {
        let key = self.private_key(entity)?;
        let mut hasher = Sha256::new();
        hasher.update(subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(actor.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.d().to_bytes_be());
        Ok(hasher.finalize().to_vec())
    }

    fn generate_key_pair(&self, entity: &str) -> Result<()> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), self.key_bits)?;
        self.keys.insert(entity.to_string(), key);
        tracing::info!(entity = entity, bits = self.key_bits, "Key pair generated");
        Ok(())
    }
}
