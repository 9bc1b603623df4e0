//! FHIR `Consent` resource as the consent fact encoding.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use super::{ConsentFact, ConsentFactBuilder};
use crate::error::{ConsentError, ErrorCode, ErrorContext, Result};
use crate::events::{ConsentData, ConsentProof};

/// Citizen service number identifier system.
pub const BSN_SYSTEM: &str = "urn:oid:2.16.840.1.113883.2.4.6.3";
/// Care provider identifier system.
pub const AGB_SYSTEM: &str = "urn:oid:2.16.840.1.113883.2.4.6.1";

const VERSION_ID: &str = "1";

/// Builds and parses FHIR consent facts.
#[derive(Debug, Default, Clone, Copy)]
pub struct FhirConsentFactBuilder;

impl FhirConsentFactBuilder {
    pub fn new() -> Self {
        Self
    }

    fn resource(data: &ConsentData, last_updated: DateTime<Utc>) -> Value {
        let (class_system, class_code) = split_class(&data.class);
        let subject = value_from_urn(&data.subject_id);

        let mut period = json!({ "start": rfc3339(data.start) });
        if let Some(end) = data.end {
            period["end"] = json!(rfc3339(end));
        }

        let mut resource = json!({
            "resourceType": "Consent",
            "id": data.id.to_string(),
            "meta": {
                "versionId": VERSION_ID,
                "lastUpdated": rfc3339(last_updated),
            },
            "scope": {
                "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/consentscope",
                    "code": "patient-privacy",
                }]
            },
            "category": [{
                "coding": [{ "system": "http://loinc.org", "code": "64292-6" }]
            }],
            "patient": {
                "identifier": { "system": BSN_SYSTEM, "value": subject }
            },
            "organization": [{
                "identifier": { "system": AGB_SYSTEM, "value": value_from_urn(&data.custodian_id) }
            }],
            "verification": [{
                "verified": true,
                "verifiedWith": {
                    "type": "Patient",
                    "identifier": { "system": BSN_SYSTEM, "value": subject }
                }
            }],
            "policyRule": {
                "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/v3-ActCode",
                    "code": "OPTIN",
                }]
            },
            "provision": {
                "actor": [{
                    "role": {
                        "coding": [{
                            "system": "http://terminology.hl7.org/CodeSystem/v3-ParticipationType",
                            "code": "PRCP",
                        }]
                    },
                    "reference": {
                        "identifier": { "system": AGB_SYSTEM, "value": value_from_urn(&data.actor_id) }
                    }
                }],
                "period": period,
                "provision": [{
                    "type": "permit",
                    "action": [{
                        "coding": [{
                            "system": "http://terminology.hl7.org/CodeSystem/consentaction",
                            "code": "access",
                        }]
                    }],
                    "class": [{ "system": class_system, "code": class_code }]
                }]
            }
        });

        if let Some(performer) = &data.performer_id {
            resource["performer"] = json!([{
                "type": "Organization",
                "identifier": { "system": AGB_SYSTEM, "value": value_from_urn(performer) }
            }]);
        }
        if let Some(proof) = &data.proof {
            resource["sourceAttachment"] = source_attachment(proof);
        }
        resource
    }
}

fn source_attachment(proof: &ConsentProof) -> Value {
    let mut attachment = json!({ "id": proof.id, "title": proof.title });
    if let Some(content_type) = &proof.content_type {
        attachment["contentType"] = json!(content_type);
    }
    if let Some(url) = &proof.url {
        attachment["url"] = json!(url);
    }
    if let Some(hash) = &proof.hash {
        attachment["hash"] = json!(hash);
    }
    attachment
}

impl ConsentFactBuilder for FhirConsentFactBuilder {
    fn build_fact(&self, data: &ConsentData) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&Self::resource(data, Utc::now()))?)
    }

    fn verify_fact(&self, payload: &[u8]) -> Result<bool> {
        let resource: Value = serde_json::from_slice(payload)?;
        match parse(&resource, payload) {
            Ok(_) => Ok(true),
            Err(reason) => {
                tracing::debug!(reason, "Consent fact failed verification");
                Ok(false)
            }
        }
    }

    fn fact_from_bytes(&self, payload: &[u8]) -> Result<ConsentFact> {
        let resource = serde_json::from_slice::<Value>(payload).with_error_code(ErrorCode::ConsentFactInvalid)?;
        parse(&resource, payload).map_err(ConsentError::invalid_fact)
    }
}

fn parse(resource: &Value, payload: &[u8]) -> std::result::Result<ConsentFact, &'static str> {
    if resource["resourceType"] != "Consent" {
        return Err("resource is not a Consent");
    }

    let subject = identifier(&resource["patient"]["identifier"]).ok_or("consent has no patient")?;
    let custodian = resource["organization"]
        .get(0)
        .and_then(|o| identifier(&o["identifier"]))
        .ok_or("consent has no custodian")?;

    let actors: Vec<String> = resource["provision"]["actor"]
        .as_array()
        .map(|actors| {
            actors
                .iter()
                .filter_map(|a| identifier(&a["reference"]["identifier"]))
                .collect()
        })
        .unwrap_or_default();
    if actors.is_empty() {
        return Err("consent has no actor");
    }

    let period = &resource["provision"]["period"];
    let start = period["start"]
        .as_str()
        .and_then(parse_time)
        .ok_or("consent has no valid period start")?;
    let end = match period.get("end") {
        Some(end) => Some(end.as_str().and_then(parse_time).ok_or("consent has an invalid period end")?),
        None => None,
    };

    let classes: Vec<String> = resource["provision"]["provision"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|p| p["class"].as_array())
        .flatten()
        .filter_map(|c| Some(format!("{}:{}", c["system"].as_str()?, c["code"].as_str()?)))
        .collect();
    if classes.is_empty() {
        return Err("consent has no data class");
    }

    let mut fact = ConsentFact::new(subject, actors, custodian, start, payload.to_vec());
    fact.id = resource["id"].as_str().map(str::to_string);
    fact.end = end;
    fact.classes = classes;
    Ok(fact)
}

fn identifier(value: &Value) -> Option<String> {
    Some(format!("{}:{}", value["system"].as_str()?, value["value"].as_str()?))
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Last `:` segment of a URN.
fn value_from_urn(urn: &str) -> &str {
    urn.rsplit(':').next().unwrap_or(urn)
}

/// Split a class URN at its last `:` into system and code.
fn split_class(class: &str) -> (&str, &str) {
    match class.rfind(':') {
        Some(i) => (&class[..i], &class[i + 1..]),
        None => ("", class),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn data(end: Option<DateTime<Utc>>) -> ConsentData {
        ConsentData {
            id: Uuid::new_v4(),
            custodian_id: "urn:oid:2.16.840.1.113883.2.4.6.1:00000001".into(),
            subject_id: "urn:oid:2.16.840.1.113883.2.4.6.3:999999990".into(),
            actor_id: "urn:oid:2.16.840.1.113883.2.4.6.1:00000002".into(),
            class: "urn:oid:1.3.6.1.4.1.54851.1:MEDICAL".into(),
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end,
            performer_id: None,
            proof: None,
        }
    }

    #[test]
    fn test_build_then_parse() {
        let builder = FhirConsentFactBuilder::new();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let input = data(Some(end));
        let payload = builder.build_fact(&input).unwrap();

        assert!(builder.verify_fact(&payload).unwrap());
        let fact = builder.fact_from_bytes(&payload).unwrap();
        assert_eq!(fact.subject, input.subject_id);
        assert_eq!(fact.custodian, input.custodian_id);
        assert_eq!(fact.actor(), Some(input.actor_id.as_str()));
        assert_eq!(fact.start, input.start);
        assert_eq!(fact.end, Some(end));
        assert_eq!(fact.classes, vec![input.class.clone()]);
        assert_eq!(fact.id, Some(input.id.to_string()));
        assert_eq!(fact.hash().len(), 64);
    }

    #[test]
    fn test_open_ended_period() {
        let builder = FhirConsentFactBuilder::new();
        let payload = builder.build_fact(&data(None)).unwrap();
        let resource: Value = serde_json::from_slice(&payload).unwrap();
        assert!(resource["provision"]["period"].get("end").is_none());
        assert_eq!(resource["provision"]["period"]["start"], "2024-01-01T00:00:00Z");
        assert_eq!(builder.fact_from_bytes(&payload).unwrap().end, None);
    }

    #[test]
    fn test_proof_and_performer_in_resource() {
        let builder = FhirConsentFactBuilder::new();
        let mut input = data(None);
        input.performer_id = Some("urn:oid:2.16.840.1.113883.2.4.6.1:00000003".into());
        input.proof = Some(ConsentProof {
            id: "proof-1".into(),
            title: "signed form".into(),
            content_type: Some("application/pdf".into()),
            url: Some("https://example.org/proof.pdf".into()),
            hash: None,
        });

        let payload = builder.build_fact(&input).unwrap();
        let resource: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            resource["sourceAttachment"],
            json!({
                "id": "proof-1",
                "title": "signed form",
                "contentType": "application/pdf",
                "url": "https://example.org/proof.pdf",
            })
        );
        assert_eq!(resource["performer"][0]["type"], "Organization");
        assert_eq!(resource["performer"][0]["identifier"]["system"], AGB_SYSTEM);
        assert_eq!(resource["performer"][0]["identifier"]["value"], "00000003");
        assert!(builder.verify_fact(&payload).unwrap());
    }

    #[test]
    fn test_no_proof_no_attachment() {
        let payload = FhirConsentFactBuilder::new().build_fact(&data(None)).unwrap();
        let resource: Value = serde_json::from_slice(&payload).unwrap();
        assert!(resource.get("sourceAttachment").is_none());
        assert!(resource.get("performer").is_none());
    }

    #[test]
    fn test_verify_rejects_missing_actor() {
        let builder = FhirConsentFactBuilder::new();
        let mut resource: Value = serde_json::from_slice(&builder.build_fact(&data(None)).unwrap()).unwrap();
        resource["provision"]["actor"] = json!([]);
        let payload = serde_json::to_vec(&resource).unwrap();

        assert!(!builder.verify_fact(&payload).unwrap());
        let err = builder.fact_from_bytes(&payload).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConsentFactInvalid);
    }

    #[test]
    fn test_verify_errors_on_non_json() {
        let builder = FhirConsentFactBuilder::new();
        assert!(builder.verify_fact(b"not json").is_err());
    }

    #[test]
    fn test_urn_helpers() {
        assert_eq!(value_from_urn("urn:oid:2.16.840.1.113883.2.4.6.3:123"), "123");
        assert_eq!(value_from_urn("plain"), "plain");
        assert_eq!(
            split_class("urn:oid:1.3.6.1.4.1.54851.1:MEDICAL"),
            ("urn:oid:1.3.6.1.4.1.54851.1", "MEDICAL")
        );
    }
}
