use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{format_rfc3339, EngineError, EngineResult, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    MetricUpsert,
    GoalSet,
    ReportGenerate,
    ReportAttachArtifact,
    MetricTypeDeactivate,
    UserRegister,
    UserDeactivate,
    VenueCreate,
    MembershipGrant,
    EventCreate,
    AccessDenied,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetricUpsert => "metric_upsert",
            Self::GoalSet => "goal_set",
            Self::ReportGenerate => "report_generate",
            Self::ReportAttachArtifact => "report_attach_artifact",
            Self::MetricTypeDeactivate => "metric_type_deactivate",
            Self::UserRegister => "user_register",
            Self::UserDeactivate => "user_deactivate",
            Self::VenueCreate => "venue_create",
            Self::MembershipGrant => "membership_grant",
            Self::EventCreate => "event_create",
            Self::AccessDenied => "access_denied",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "metric_upsert" => Some(Self::MetricUpsert),
            "goal_set" => Some(Self::GoalSet),
            "report_generate" => Some(Self::ReportGenerate),
            "report_attach_artifact" => Some(Self::ReportAttachArtifact),
            "metric_type_deactivate" => Some(Self::MetricTypeDeactivate),
            "user_register" => Some(Self::UserRegister),
            "user_deactivate" => Some(Self::UserDeactivate),
            "venue_create" => Some(Self::VenueCreate),
            "membership_grant" => Some(Self::MembershipGrant),
            "event_create" => Some(Self::EventCreate),
            "access_denied" => Some(Self::AccessDenied),
            _ => None,
        }
    }
}

/// What a caller hands to the recorder; sequencing and hashing are added at
/// write time.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub user_id: Option<UserId>,
    pub action: AuditAction,
    pub target_table: &'static str,
    pub target_id: String,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub user_id: Option<UserId>,
    pub action: AuditAction,
    pub target_table: String,
    pub target_id: String,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub payload_hash: String,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditChainReport {
    pub entries: usize,
    pub chain_valid: bool,
    pub first_broken_seq: Option<i64>,
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns [`EngineError::Validation`] if JSON serialization fails.
pub fn hash_json(value: &Value) -> EngineResult<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| EngineError::Validation(format!("failed to serialize JSON: {err}")))?;
    Ok(hash_bytes(&bytes))
}

/// Detail payload for update-class actions.
#[must_use]
pub fn update_details(prior: Value, new: Value) -> Value {
    json!({ "prior": prior, "new": new })
}

/// Hash linking one audit entry to its predecessor.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the timestamp cannot be formatted.
#[allow(clippy::too_many_arguments)]
pub fn compute_entry_hash(
    entry_id: Ulid,
    user_id: Option<UserId>,
    action: AuditAction,
    target_table: &str,
    target_id: &str,
    payload_hash: &str,
    recorded_at: OffsetDateTime,
    prev_hash: Option<&str>,
) -> EngineResult<String> {
    let material = json!({
        "entry_id": entry_id.to_string(),
        "user_id": user_id.map(|id| id.to_string()),
        "action": action.as_str(),
        "target_table": target_table,
        "target_id": target_id,
        "payload_hash": payload_hash,
        "recorded_at": format_rfc3339(recorded_at)?,
        "prev_hash": prev_hash,
    });
    hash_json(&material)
}

/// Re-derives every entry hash and checks predecessor links in sequence
/// order. `payload_hash` values must already have been checked against the
/// stored payload text.
///
/// # Errors
/// Returns [`EngineError::Validation`] when hashing itself fails.
pub fn verify_chain(entries: &[AuditEntry]) -> EngineResult<AuditChainReport> {
    let mut prev: Option<&str> = None;

    for entry in entries {
        let recomputed = compute_entry_hash(
            entry.entry_id,
            entry.user_id,
            entry.action,
            &entry.target_table,
            &entry.target_id,
            &entry.payload_hash,
            entry.recorded_at,
            entry.prev_hash.as_deref(),
        )?;

        if entry.prev_hash.as_deref() != prev || recomputed != entry.entry_hash {
            return Ok(AuditChainReport {
                entries: entries.len(),
                chain_valid: false,
                first_broken_seq: Some(entry.entry_seq),
            });
        }
        prev = Some(entry.entry_hash.as_str());
    }

    Ok(AuditChainReport {
        entries: entries.len(),
        chain_valid: true,
        first_broken_seq: None,
    })
}
