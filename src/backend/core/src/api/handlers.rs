//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, ConsentError>`; a validation
//! failure becomes `400 {"message": ...}` with the first failing rule. Body
//! extraction failures take the same shape.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::error::{ConsentError, Result};
use crate::events::{ConsentData, ConsentProof};
use crate::sync::BridgeEvent;

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Consent Intake
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsentRequest {
    #[serde(default)]
    pub custodian: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performer: Option<String>,
    #[serde(default)]
    pub records: Vec<ConsentRecordDto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecordDto {
    #[serde(default)]
    pub period: PeriodDto,
    #[serde(default)]
    pub consent_proof: ConsentProofDto,
    #[serde(default)]
    pub data_class: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_record_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodDto {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Reference to the document proving the consent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentProofDto {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "URL", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ConsentProofDto {
    pub fn to_proof(&self) -> ConsentProof {
        ConsentProof {
            id: self.id.clone(),
            title: self.title.clone(),
            content_type: self.content_type.clone(),
            url: self.url.clone(),
            hash: self.hash.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreatedResponse {
    pub result_code: String,
    pub job_id: Uuid,
}

impl CreateConsentRequest {
    /// Check the request; the first failing rule wins.
    pub fn validate(&self, class_prefix: &str) -> Result<()> {
        if self.custodian.is_empty() {
            return Err(ConsentError::validation("the consent requires a custodian"));
        }
        if self.subject.is_empty() {
            return Err(ConsentError::validation("the consent requires a subject"));
        }
        if self.actor.is_empty() {
            return Err(ConsentError::validation("the consent requires an actor"));
        }
        if self.records.is_empty() {
            return Err(ConsentError::validation("the consent requires at least one record"));
        }

        for record in &self.records {
            if record.period.start.is_none() {
                return Err(ConsentError::validation("the consent record requires a period.start"));
            }
            if record.consent_proof.title.is_empty() || record.consent_proof.id.is_empty() {
                return Err(ConsentError::validation("the consent record requires a valid proof"));
            }
            if record.data_class.is_empty() {
                return Err(ConsentError::validation(
                    "the consent record requires at least one data class",
                ));
            }
            for class in &record.data_class {
                if class.is_empty() {
                    return Err(ConsentError::validation("a data class can not be empty"));
                }
                if !class.starts_with(class_prefix) {
                    return Err(ConsentError::validation(format!(
                        "a data class must start with {}",
                        class_prefix
                    )));
                }
            }
        }
        Ok(())
    }

    /// Consent data for the first record and its first data class.
    pub fn to_consent_data(&self) -> Option<ConsentData> {
        let record = self.records.first()?;
        Some(ConsentData {
            id: Uuid::new_v4(),
            custodian_id: self.custodian.clone(),
            subject_id: self.subject.clone(),
            actor_id: self.actor.clone(),
            class: record.data_class.first()?.clone(),
            start: record.period.start?,
            end: record.period.end,
            performer_id: self.performer.clone(),
            proof: Some(record.consent_proof.to_proof()),
        })
    }
}

pub async fn create_consent(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateConsentRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(req) = payload?;
    req.validate(&state.consent.class_prefix())?;
    let data = req
        .to_consent_data()
        .ok_or_else(|| ConsentError::validation("the consent requires at least one record"))?;

    let job_id = state.service.register_consent(data).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobCreatedResponse {
            result_code: "OK".to_string(),
            job_id,
        }),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bridge Ingress
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeEventAccepted {
    pub uuid: String,
    pub name: String,
}

pub async fn receive_bridge_event(
    State(state): State<AppState>,
    payload: std::result::Result<Json<BridgeEvent>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let Json(event) = payload?;
    state.service.handle_bridge_event(&event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(BridgeEventAccepted {
            uuid: event.uuid,
            name: event.name.to_string(),
        }),
    ))
}
