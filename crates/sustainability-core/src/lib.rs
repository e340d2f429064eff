//! Domain model for the sustainability reporting engine.
//!
//! Everything in this crate is pure: entity types, the metric catalog and its
//! value rules, goal evaluation, venue access policy and audit hash chaining.
//! Persistence and transactions live in `sustainability-store-sqlite`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod audit;
pub mod catalog;
pub mod goals;
pub mod policy;
pub mod report;

pub use audit::{
    compute_entry_hash, hash_bytes, hash_json, update_details, verify_chain, AuditAction,
    AuditChainReport, AuditDraft, AuditEntry,
};
pub use catalog::{
    ensure_ingestible, normalize_code, rule_for, validate_metric_value, CatalogEntry,
    MetricRegistry, ValueRule, CATALOG_V1,
};
pub use goals::{
    evaluate_event_goals, evaluate_goals, goal_status, period_window, GoalEvaluation,
    GoalObservation, PeriodWindow,
};
pub use policy::{authorize, resolve_effective_role, EffectiveRole, Principal};
pub use report::{
    compile_summary, ObservedMetric, ReportMetricLine, ReportSummary, SummaryOutcome,
};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown metric type: {0}")]
    UnknownMetricType(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("metric type {0} is inactive; only existing observations may be updated")]
    TypeInactiveForNewEntry(String),
    #[error("event {0} has no metric observations")]
    NoMetrics(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("dependency error: {0}")]
    Dependency(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    Dependency,
    Storage,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::Dependency => "dependency_error",
            Self::Storage => "storage_error",
        }
    }
}

impl EngineError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidValue(_)
            | Self::Validation(_)
            | Self::TypeInactiveForNewEntry(_)
            | Self::NoMetrics(_) => ErrorClass::Validation,
            Self::UnknownMetricType(_) | Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Forbidden(_) => ErrorClass::Forbidden,
            Self::Dependency(_) => ErrorClass::Dependency,
            Self::Storage(_) => ErrorClass::Storage,
        }
    }

    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string into this identifier.
            ///
            /// # Errors
            /// Returns [`EngineError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> EngineResult<Self> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    EngineError::Validation(format!("invalid {} id {raw}: {err}", $label))
                })
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(UserId, "user");
ulid_id!(VenueId, "venue");
ulid_id!(EventId, "event");
ulid_id!(MetricTypeId, "metric type");
ulid_id!(ObservationId, "observation");
ulid_id!(GoalId, "goal");
ulid_id!(ReportId, "report");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    SuperAdmin,
    VenueAdmin,
    Staff,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::VenueAdmin => "venue_admin",
            Self::Staff => "staff",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "super_admin" => Some(Self::SuperAdmin),
            "venue_admin" => Some(Self::VenueAdmin),
            "staff" => Some(Self::Staff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VenueRole {
    VenueAdmin,
    Staff,
}

impl VenueRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VenueAdmin => "venue_admin",
            Self::Staff => "staff",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "venue_admin" => Some(Self::VenueAdmin),
            "staff" => Some(Self::Staff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Write,
    ManageGoals,
    ManageVenue,
    Administer,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ManageGoals => "manage_goals",
            Self::ManageVenue => "manage_venue",
            Self::Administer => "administer",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Energy,
    Water,
    Waste,
    Recycling,
    Transportation,
    Emissions,
}

/// Which side of a target counts as meeting it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum GoalDirection {
    Reduction,
    IncreaseDesired,
}

impl MetricCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::Water => "water",
            Self::Waste => "waste",
            Self::Recycling => "recycling",
            Self::Transportation => "transportation",
            Self::Emissions => "emissions",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "energy" => Some(Self::Energy),
            "water" => Some(Self::Water),
            "waste" => Some(Self::Waste),
            "recycling" => Some(Self::Recycling),
            "transportation" => Some(Self::Transportation),
            "emissions" => Some(Self::Emissions),
            _ => None,
        }
    }

    #[must_use]
    pub fn direction(self) -> GoalDirection {
        match self {
            Self::Recycling => GoalDirection::IncreaseDesired,
            Self::Energy | Self::Water | Self::Waste | Self::Transportation | Self::Emissions => {
                GoalDirection::Reduction
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Kwh,
    Liters,
    Kg,
    Percent,
    Km,
    KgCo2e,
}

impl MetricUnit {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kwh => "kwh",
            Self::Liters => "liters",
            Self::Kg => "kg",
            Self::Percent => "percent",
            Self::Km => "km",
            Self::KgCo2e => "kg_co2e",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "kwh" => Some(Self::Kwh),
            "liters" => Some(Self::Liters),
            "kg" => Some(Self::Kg),
            "percent" => Some(Self::Percent),
            "km" => Some(Self::Km),
            "kg_co2e" => Some(Self::KgCo2e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalPeriod {
    Year,
    Quarter,
    Event,
}

impl GoalPeriod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Year => "year",
            Self::Quarter => "quarter",
            Self::Event => "event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "year" => Some(Self::Year),
            "quarter" => Some(Self::Quarter),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    OnTarget,
    OffTarget,
}

impl GoalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnTarget => "on_target",
            Self::OffTarget => "off_target",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Draft,
    Complete,
    Error,
}

impl ReportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Only `draft` moves, and only into a terminal state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Complete) | (Self::Draft, Self::Error)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub role: UserRole,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Venue {
    pub venue_id: VenueId,
    pub name: String,
    pub contact_user_id: Option<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VenueMembership {
    pub user_id: UserId,
    pub venue_id: VenueId,
    pub role: VenueRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: EventId,
    pub venue_id: VenueId,
    pub name: String,
    #[serde(with = "iso_date")]
    pub start_date: Date,
    #[serde(with = "iso_date")]
    pub end_date: Date,
    pub expected_attendees: Option<i64>,
    pub actual_attendees: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventInput {
    pub venue_id: VenueId,
    pub name: String,
    #[serde(with = "iso_date")]
    pub start_date: Date,
    #[serde(with = "iso_date")]
    pub end_date: Date,
    pub expected_attendees: Option<i64>,
    pub actual_attendees: Option<i64>,
}

impl EventInput {
    /// Validates the event before it is persisted.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] for an empty name, an inverted date
    /// range or negative attendee counts.
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "event name MUST be provided".to_string(),
            ));
        }

        if self.start_date > self.end_date {
            return Err(EngineError::Validation(format!(
                "start_date {} MUST be <= end_date {}",
                format_date(self.start_date),
                format_date(self.end_date)
            )));
        }

        for (name, value) in [
            ("expected_attendees", self.expected_attendees),
            ("actual_attendees", self.actual_attendees),
        ] {
            if value.is_some_and(|count| count < 0) {
                return Err(EngineError::Validation(format!(
                    "{name} MUST be >= 0 when present"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricType {
    pub metric_type_id: MetricTypeId,
    pub code: String,
    pub name: String,
    pub category: MetricCategory,
    pub unit: MetricUnit,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricObservation {
    pub observation_id: ObservationId,
    pub event_id: EventId,
    pub metric_type_id: MetricTypeId,
    pub value: f64,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub goal_id: GoalId,
    pub venue_id: VenueId,
    pub metric_type_id: MetricTypeId,
    pub period: GoalPeriod,
    pub target_value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub report_id: ReportId,
    pub event_id: EventId,
    pub status: ReportStatus,
    pub summary: Option<ReportSummary>,
    pub error_message: Option<String>,
    pub report_url: Option<String>,
    pub generated_by: Option<UserId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Normalises an email address for uniqueness checks.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the address is empty or has no `@`.
pub fn normalize_email(raw: &str) -> EngineResult<String> {
    let email = raw.trim().to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(EngineError::Validation(format!(
            "email MUST look like local@domain: {raw}"
        ))),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EngineError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> EngineResult<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> EngineResult<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            EngineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses a calendar date in `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the input is not a valid date.
pub fn parse_date(value: &str) -> EngineResult<Date> {
    Date::parse(
        value.trim(),
        time::macros::format_description!("[year]-[month]-[day]"),
    )
    .map_err(|err| EngineError::Validation(format!("invalid date {value}: {err}")))
}

#[must_use]
pub fn format_date(value: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        value.year(),
        u8::from(value.month()),
        value.day()
    )
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
