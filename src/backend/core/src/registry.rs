//! Registry collaborator: the directory of organizations and their published keys.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::crypto::Jwk;
use crate::error::{ConsentError, Result};

/// A published key and the window in which it is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationKey {
    pub jwk: Jwk,
    pub not_before: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl OrganizationKey {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && self.not_after.map_or(true, |end| at < end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub identifier: String,
    pub name: String,
    #[serde(default)]
    pub keys: Vec<OrganizationKey>,
}

impl Organization {
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
            keys: Vec::new(),
        }
    }

    /// The most recently activated key valid at `at`.
    pub fn current_public_key(&self, at: DateTime<Utc>) -> Option<&Jwk> {
        self.keys
            .iter()
            .filter(|k| k.is_valid_at(at))
            .max_by_key(|k| k.not_before)
            .map(|k| &k.jwk)
    }

    /// Whether `jwk` is one of this organization's keys and valid at `at`.
    ///
    /// Keys are compared by modulus and exponent, so encodings that differ only
    /// in leading zero bytes still match. Fails when `jwk` or a published key
    /// valid at `at` is not a usable RSA key.
    pub fn has_key(&self, jwk: &Jwk, at: DateTime<Utc>) -> Result<bool> {
        let wanted = jwk.to_public_key()?;
        for key in self.keys.iter().filter(|k| k.is_valid_at(at)) {
            if key.jwk.to_public_key()? == wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn organization_by_id(&self, id: &str) -> Result<Organization>;
}

/// Process-local registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    organizations: DashMap<String, Organization>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, organization: Organization) {
        self.organizations
            .insert(organization.identifier.clone(), organization);
    }

    /// Publish a key for an organization, creating the organization when absent.
    pub fn publish_key(&self, identifier: &str, jwk: Jwk, not_before: DateTime<Utc>) {
        let mut entry = self
            .organizations
            .entry(identifier.to_string())
            .or_insert_with(|| Organization::new(identifier, identifier));
        entry.keys.push(OrganizationKey {
            jwk,
            not_before,
            not_after: None,
        });
    }

    /// Close the validity window of every key of `identifier` still open at `at`.
    pub fn revoke_keys(&self, identifier: &str, at: DateTime<Utc>) {
        if let Some(mut organization) = self.organizations.get_mut(identifier) {
            for key in organization.keys.iter_mut().filter(|k| k.not_after.is_none()) {
                key.not_after = Some(at);
            }
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn organization_by_id(&self, id: &str) -> Result<Organization> {
        self.organizations
            .get(id)
            .map(|o| o.value().clone())
            .ok_or_else(|| ConsentError::organization_not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use chrono::Duration;

    fn jwk() -> Jwk {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        Jwk::from_public_key(&rsa::RsaPublicKey::from(&key))
    }

    #[tokio::test]
    async fn test_key_validity_window() {
        let registry = InMemoryRegistry::new();
        let (first, second) = (jwk(), jwk());
        let t0 = Utc::now();
        registry.publish_key("org", first.clone(), t0);
        registry.revoke_keys("org", t0 + Duration::hours(1));
        registry.publish_key("org", second.clone(), t0 + Duration::hours(1));

        let org = registry.organization_by_id("org").await.unwrap();
        assert!(org.has_key(&first, t0 + Duration::minutes(30)).unwrap());
        assert!(!org.has_key(&first, t0 + Duration::hours(2)).unwrap());
        assert!(!org.has_key(&second, t0).unwrap());
        assert_eq!(org.current_public_key(t0 + Duration::hours(2)), Some(&second));
    }

    #[test]
    fn test_has_key_fails_on_unusable_key() {
        let mut org = Organization::new("org", "Org");
        org.keys.push(OrganizationKey {
            jwk: Jwk {
                kty: "RSA".into(),
                n: "!!".into(),
                e: "AQAB".into(),
            },
            not_before: Utc::now() - Duration::hours(1),
            not_after: None,
        });

        let err = org.has_key(&jwk(), Utc::now()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPublicKey);
    }

    #[tokio::test]
    async fn test_unknown_organization() {
        let registry = InMemoryRegistry::new();
        let err = registry.organization_by_id("nobody").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::OrganizationNotFound);
    }
}
