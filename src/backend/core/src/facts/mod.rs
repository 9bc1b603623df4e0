//! Consent facts: the encoding-independent view of a consent document.

pub mod fhir;

pub use fhir::FhirConsentFactBuilder;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::events::ConsentData;

/// A parsed consent document.
///
/// The hash is a function of the payload bytes only, so two facts parsed from
/// identical bytes always hash the same.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentFact {
    pub id: Option<String>,
    pub subject: String,
    pub actors: Vec<String>,
    pub custodian: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub classes: Vec<String>,
    payload: Vec<u8>,
}

impl ConsentFact {
    pub fn new(
        subject: impl Into<String>,
        actors: Vec<String>,
        custodian: impl Into<String>,
        start: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: None,
            subject: subject.into(),
            actors,
            custodian: custodian.into(),
            start,
            end: None,
            classes: Vec::new(),
            payload,
        }
    }

    /// First actor of the provision.
    pub fn actor(&self) -> Option<&str> {
        self.actors.first().map(String::as_str)
    }

    /// Hex encoded SHA-256 of the payload.
    pub fn hash(&self) -> String {
        hash_payload(&self.payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

pub fn hash_payload(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Encodes consent data into a concrete document format and parses it back.
pub trait ConsentFactBuilder: Send + Sync {
    fn build_fact(&self, data: &ConsentData) -> Result<Vec<u8>>;

    /// Structural and business validation. `Ok(false)` means well-formed but invalid.
    fn verify_fact(&self, payload: &[u8]) -> Result<bool>;

    fn fact_from_bytes(&self, payload: &[u8]) -> Result<ConsentFact>;
}
