//! When a signer's published key must have been valid.
//!
//! Signatures carry no signing time, so checking against the time of
//! verification is the default. The signing-time policy approximates it with
//! the last update of the bridge state, which is when the latest signature
//! was attached.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::state::{FullConsentRequestState, PartyAttachmentSignature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyValidityMode {
    #[default]
    VerificationTime,
    SigningTime,
}

pub trait KeyValidityPolicy: Send + Sync {
    /// Instant at which `signature`'s key must be valid.
    fn check_time(
        &self,
        signature: &PartyAttachmentSignature,
        state: &FullConsentRequestState,
    ) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VerificationTimePolicy;

impl KeyValidityPolicy for VerificationTimePolicy {
    fn check_time(&self, _: &PartyAttachmentSignature, _: &FullConsentRequestState) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SigningTimePolicy;

impl KeyValidityPolicy for SigningTimePolicy {
    fn check_time(&self, _: &PartyAttachmentSignature, state: &FullConsentRequestState) -> DateTime<Utc> {
        state
            .updated_at
            .or(state.created_at)
            .unwrap_or_else(Utc::now)
    }
}

impl KeyValidityMode {
    pub fn policy(self) -> Arc<dyn KeyValidityPolicy> {
        match self {
            Self::VerificationTime => Arc::new(VerificationTimePolicy),
            Self::SigningTime => Arc::new(SigningTimePolicy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::state::{ConsentId, SignatureWithKey};
    use chrono::TimeZone;

    #[test]
    fn test_signing_time_uses_state_update() {
        let updated = Utc.with_ymd_and_hms(2020, 4, 1, 12, 0, 0).unwrap();
        let state = FullConsentRequestState {
            consent_id: ConsentId {
                external_id: None,
                uuid: "u".into(),
            },
            consent_records: vec![],
            legal_entities: vec![],
            initiating_legal_entity: String::new(),
            initiating_node: None,
            created_at: None,
            updated_at: Some(updated),
            comment: None,
        };
        let signature = PartyAttachmentSignature {
            attachment: "h".into(),
            legal_entity: "a".into(),
            signature: SignatureWithKey {
                data: String::new(),
                public_key: serde_json::Value::Null,
            },
        };

        assert_eq!(KeyValidityMode::SigningTime.policy().check_time(&signature, &state), updated);
        assert!(KeyValidityMode::VerificationTime.policy().check_time(&signature, &state) > updated);
    }

    #[test]
    fn test_mode_from_config_string() {
        let mode: KeyValidityMode = serde_json::from_str("\"signing-time\"").unwrap();
        assert_eq!(mode, KeyValidityMode::SigningTime);
    }
}
