//! Bridge wire format.
//!
//! The negotiation state exchanged with the ledger bridge, camelCase JSON,
//! transported as standard base64 inside a [`BridgeEvent`](super::BridgeEvent).
//! Binary values (cipher texts, keys, ivs, signatures) are standard base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConsentError, Result};

pub const SYMMETRIC_ALG: &str = "AES_GCM";
pub const ASYMMETRIC_ALG: &str = "RSA-OAEP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentId {
    #[serde(rename = "externalId", default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub valid_from: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKey {
    pub alg: String,
    pub iv: String,
}

/// The content key wrapped for one legal entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsymmetricKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_text: Option<String>,
    pub legal_entity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub domain: Vec<String>,
    pub period: Period,
    pub secure_key: SymmetricKey,
    pub organisation_secure_keys: Vec<AsymmetricKey>,
    pub consent_record_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_attachment_hash: Option<String>,
}

impl Metadata {
    /// Wrapped key of `legal_entity`, still base64 encoded.
    pub fn key_for(&self, legal_entity: &str) -> Option<&str> {
        self.organisation_secure_keys
            .iter()
            .filter(|k| k.legal_entity == legal_entity)
            .find_map(|k| k.cipher_text.as_deref())
    }
}

/// A signature and the public key it claims to be made with.
///
/// The key is kept untyped so a malformed JWK is reported as such instead of
/// failing the whole payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureWithKey {
    pub data: String,
    pub public_key: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyAttachmentSignature {
    pub attachment: String,
    pub legal_entity: String,
    pub signature: SignatureWithKey,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<PartyAttachmentSignature>>,
}

impl ConsentRecord {
    pub fn signatures(&self) -> &[PartyAttachmentSignature] {
        self.signatures.as_deref().unwrap_or_default()
    }

    pub fn is_signed_by(&self, legal_entity: &str) -> bool {
        self.signatures().iter().any(|s| s.legal_entity == legal_entity)
    }

    /// Exactly one signature per expected legal entity, and nothing else.
    pub fn is_fully_signed(&self, legal_entities: &[String]) -> bool {
        let signatures = self.signatures();
        signatures.len() == legal_entities.len()
            && legal_entities.iter().all(|entity| {
                signatures.iter().filter(|s| &s.legal_entity == entity).count() == 1
            })
    }

    pub fn add_signature(&mut self, signature: PartyAttachmentSignature) {
        self.signatures.get_or_insert_with(Vec::new).push(signature);
    }

    /// Hash the parties sign: the bridge's attachment hash when assigned, else the record hash.
    pub fn signing_hash(&self) -> Option<&str> {
        self.attachment_hash
            .as_deref()
            .or_else(|| self.metadata.as_ref().map(|m| m.consent_record_hash.as_str()))
    }
}

/// The negotiation state synchronized through the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullConsentRequestState {
    pub consent_id: ConsentId,
    #[serde(default)]
    pub consent_records: Vec<ConsentRecord>,
    #[serde(default)]
    pub legal_entities: Vec<String>,
    #[serde(default)]
    pub initiating_legal_entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiating_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl FullConsentRequestState {
    /// Every record carries one signature per legal entity.
    pub fn all_signed(&self) -> bool {
        self.consent_records
            .iter()
            .all(|r| r.is_fully_signed(&self.legal_entities))
    }
}

/// The finalized state delivered with `consent-distributed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentState {
    pub consent_id: ConsentId,
    #[serde(default)]
    pub consent_records: Vec<ConsentRecord>,
}

/// Serialize to JSON and base64 encode.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(value)?))
}

/// Reverse of [`encode_payload`]; the two failure modes carry distinct messages.
pub fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T> {
    let bytes = STANDARD.decode(payload).map_err(|e| {
        ConsentError::malformed_payload("could not base64 decode event payload").with_internal_message(e.to_string())
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        ConsentError::malformed_payload("could not unmarshall event payload").with_internal_message(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn signature(entity: &str) -> PartyAttachmentSignature {
        PartyAttachmentSignature {
            attachment: "hash".into(),
            legal_entity: entity.into(),
            signature: SignatureWithKey {
                data: "c2ln".into(),
                public_key: serde_json::json!({}),
            },
        }
    }

    #[test]
    fn test_fully_signed_requires_one_signature_per_entity() {
        let entities = vec!["a".to_string(), "b".to_string()];
        let mut record = ConsentRecord::default();
        assert!(!record.is_fully_signed(&entities));

        record.add_signature(signature("a"));
        assert!(!record.is_fully_signed(&entities));

        record.add_signature(signature("a"));
        assert!(!record.is_fully_signed(&entities), "duplicate signer is not a second party");

        let mut record = ConsentRecord::default();
        record.add_signature(signature("b"));
        record.add_signature(signature("a"));
        assert!(record.is_fully_signed(&entities));
    }

    #[test]
    fn test_wire_names() {
        let state = FullConsentRequestState {
            consent_id: ConsentId {
                external_id: Some("ext".into()),
                uuid: "u".into(),
            },
            consent_records: vec![ConsentRecord {
                attachment_hash: Some("h".into()),
                ..Default::default()
            }],
            legal_entities: vec!["a".into()],
            initiating_legal_entity: "a".into(),
            initiating_node: None,
            created_at: None,
            updated_at: None,
            comment: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["consentId"]["externalId"], "ext");
        assert_eq!(json["consentId"]["UUID"], "u");
        assert_eq!(json["consentRecords"][0]["attachmentHash"], "h");
        assert_eq!(json["initiatingLegalEntity"], "a");
    }

    #[test]
    fn test_decode_errors_are_distinct() {
        let err = decode_payload::<ConsentState>("%%%").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedPayload);
        assert_eq!(err.user_message(), "could not base64 decode event payload");

        let err = decode_payload::<ConsentState>(&STANDARD.encode("{}")).unwrap_err();
        assert_eq!(err.user_message(), "could not unmarshall event payload");
    }
}
