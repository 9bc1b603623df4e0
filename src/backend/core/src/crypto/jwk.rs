//! RSA public keys as JSON Web Keys.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{ConsentError, ErrorCode, Result};

const KEY_TYPE_RSA: &str = "RSA";

/// An RSA public JWK (`kty`, `n`, `e`, base64url without padding).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub n: String,
    pub e: String,
}

impl Jwk {
    pub fn from_public_key(key: &RsaPublicKey) -> Self {
        Self {
            kty: KEY_TYPE_RSA.to_string(),
            n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        }
    }

    pub fn to_public_key(&self) -> Result<RsaPublicKey> {
        if self.kty != KEY_TYPE_RSA {
            return Err(invalid_key(format!("unsupported key type {}", self.kty)));
        }
        let n = URL_SAFE_NO_PAD
            .decode(&self.n)
            .map_err(|e| invalid_key(format!("modulus: {e}")))?;
        let e = URL_SAFE_NO_PAD
            .decode(&self.e)
            .map_err(|e| invalid_key(format!("exponent: {e}")))?;

        RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
            .map_err(|e| invalid_key(e.to_string()))
    }

    /// Parse and validate a JWK from an untyped JSON value.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let jwk: Jwk = serde_json::from_value(value.clone())
            .map_err(|e| invalid_key(e.to_string()))?;
        jwk.to_public_key()?;
        Ok(jwk)
    }
}

fn invalid_key(internal: String) -> ConsentError {
    ConsentError::with_internal(ErrorCode::InvalidPublicKey, "invalid public key", internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    #[test]
    fn test_public_key_round_trip() {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = RsaPublicKey::from(&private);

        let jwk = Jwk::from_public_key(&public);
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.e, "AQAB");
        assert_eq!(jwk.to_public_key().unwrap(), public);
    }

    #[test]
    fn test_from_value_rejects_garbage() {
        let err = Jwk::from_value(&serde_json::json!({ "kty": "RSA" })).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPublicKey);

        let err = Jwk::from_value(&serde_json::json!({ "kty": "EC", "n": "AQAB", "e": "AQAB" }))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPublicKey);
    }
}
