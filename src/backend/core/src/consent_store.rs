//! Consent store collaborator: the local read model of finalized consents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

/// One finalized consent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub data_classes: Vec<String>,
    pub valid_from: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
}

/// All records of one negotiation, keyed by its external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientConsent {
    pub id: String,
    pub actor: String,
    pub custodian: String,
    pub subject: String,
    pub records: Vec<ConsentRecord>,
}

#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Persist consents. Records already stored under the same hash are kept once.
    async fn record_consent(&self, consents: Vec<PatientConsent>) -> Result<()>;

    async fn find(&self, id: &str) -> Result<Option<PatientConsent>>;

    /// Consents where every given party matches.
    async fn query(
        &self,
        actor: Option<&str>,
        custodian: Option<&str>,
        subject: Option<&str>,
    ) -> Result<Vec<PatientConsent>>;
}

#[derive(Default)]
pub struct InMemoryConsentStore {
    consents: RwLock<HashMap<String, PatientConsent>>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.consents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConsentStore for InMemoryConsentStore {
    async fn record_consent(&self, consents: Vec<PatientConsent>) -> Result<()> {
        let mut stored = self.consents.write();
        for consent in consents {
            match stored.get_mut(&consent.id) {
                Some(existing) => {
                    for record in consent.records {
                        if !existing.records.iter().any(|r| r.hash == record.hash) {
                            existing.records.push(record);
                        }
                    }
                }
                None => {
                    tracing::debug!(consent_id = %consent.id, "Consent stored");
                    stored.insert(consent.id.clone(), consent);
                }
            }
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<PatientConsent>> {
        Ok(self.consents.read().get(id).cloned())
    }

    async fn query(
        &self,
        actor: Option<&str>,
        custodian: Option<&str>,
        subject: Option<&str>,
    ) -> Result<Vec<PatientConsent>> {
        let matches = |filter: Option<&str>, value: &str| filter.map_or(true, |f| f == value);
        Ok(self
            .consents
            .read()
            .values()
            .filter(|c| {
                matches(actor, &c.actor) && matches(custodian, &c.custodian) && matches(subject, &c.subject)
            })
            .cloned()
            .collect())
    }
}
