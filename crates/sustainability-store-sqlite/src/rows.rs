use rusqlite::types::Type;
use rusqlite::Row;
use serde_json::Value;
use sustainability_core::{
    parse_date, parse_rfc3339_utc, AuditAction, AuditEntry, EngineResult, Event, EventId, Goal,
    GoalId, GoalObservation, GoalPeriod, MetricCategory, MetricObservation, MetricType,
    MetricTypeId, MetricUnit, ObservationId, Report, ReportId, ReportStatus, ReportSummary, User,
    UserId, UserRole, Venue, VenueId,
};
use ulid::Ulid;

pub(crate) const USER_COLUMNS: &str =
    "user_id, email, display_name, role, is_active, created_at";
pub(crate) const VENUE_COLUMNS: &str = "venue_id, name, contact_user_id, created_at";
pub(crate) const EVENT_COLUMNS: &str = "event_id, venue_id, name, start_date, end_date,
     expected_attendees, actual_attendees, created_at";
pub(crate) const METRIC_TYPE_COLUMNS: &str =
    "metric_type_id, code, name, category, unit, is_active";
pub(crate) const OBSERVATION_COLUMNS: &str =
    "observation_id, event_id, metric_type_id, value, notes, collected_at";
pub(crate) const GOAL_COLUMNS: &str =
    "goal_id, venue_id, metric_type_id, period, target_value, updated_at";
pub(crate) const REPORT_COLUMNS: &str = "report_id, event_id, status, summary_json, error_message,
     report_url, generated_by, created_at, completed_at";
pub(crate) const AUDIT_COLUMNS: &str = "entry_seq, entry_id, user_id, action, target_table,
     target_id, details_json, recorded_at, payload_hash, prev_hash, entry_hash";

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn text_with<T>(
    row: &Row<'_>,
    index: usize,
    parse: impl FnOnce(&str) -> EngineResult<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn optional_text_with<T>(
    row: &Row<'_>,
    index: usize,
    parse: impl FnOnce(&str) -> EngineResult<T>,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(index)?;
    raw.as_deref()
        .map(parse)
        .transpose()
        .map_err(|err| invalid_column(index, Type::Text, err.to_string()))
}

fn enum_column<T>(
    row: &Row<'_>,
    index: usize,
    label: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).ok_or_else(|| invalid_column(index, Type::Text, format!("invalid {label}: {raw}")))
}

fn flag_column(row: &Row<'_>, index: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i64>(index)? == 1)
}

pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn parse_user_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: text_with(row, 0, UserId::parse)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        role: enum_column(row, 3, "role", UserRole::parse)?,
        is_active: flag_column(row, 4)?,
        created_at: text_with(row, 5, parse_rfc3339_utc)?,
    })
}

pub(crate) fn parse_venue_row(row: &Row<'_>) -> rusqlite::Result<Venue> {
    Ok(Venue {
        venue_id: text_with(row, 0, VenueId::parse)?,
        name: row.get(1)?,
        contact_user_id: optional_text_with(row, 2, UserId::parse)?,
        created_at: text_with(row, 3, parse_rfc3339_utc)?,
    })
}

pub(crate) fn parse_event_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        event_id: text_with(row, 0, EventId::parse)?,
        venue_id: text_with(row, 1, VenueId::parse)?,
        name: row.get(2)?,
        start_date: text_with(row, 3, parse_date)?,
        end_date: text_with(row, 4, parse_date)?,
        expected_attendees: row.get(5)?,
        actual_attendees: row.get(6)?,
        created_at: text_with(row, 7, parse_rfc3339_utc)?,
    })
}

pub(crate) fn parse_metric_type_row(row: &Row<'_>) -> rusqlite::Result<MetricType> {
    Ok(MetricType {
        metric_type_id: text_with(row, 0, MetricTypeId::parse)?,
        code: row.get(1)?,
        name: row.get(2)?,
        category: enum_column(row, 3, "category", MetricCategory::parse)?,
        unit: enum_column(row, 4, "unit", MetricUnit::parse)?,
        is_active: flag_column(row, 5)?,
    })
}

pub(crate) fn parse_observation_row(row: &Row<'_>) -> rusqlite::Result<MetricObservation> {
    Ok(MetricObservation {
        observation_id: text_with(row, 0, ObservationId::parse)?,
        event_id: text_with(row, 1, EventId::parse)?,
        metric_type_id: text_with(row, 2, MetricTypeId::parse)?,
        value: row.get(3)?,
        notes: row.get(4)?,
        collected_at: text_with(row, 5, parse_rfc3339_utc)?,
    })
}

/// Expects `event_id, start_date, end_date, metric_type_id, value, collected_at`.
pub(crate) fn parse_goal_observation_row(row: &Row<'_>) -> rusqlite::Result<GoalObservation> {
    Ok(GoalObservation {
        event_id: text_with(row, 0, EventId::parse)?,
        event_start: text_with(row, 1, parse_date)?,
        event_end: text_with(row, 2, parse_date)?,
        metric_type_id: text_with(row, 3, MetricTypeId::parse)?,
        value: row.get(4)?,
        collected_at: text_with(row, 5, parse_rfc3339_utc)?,
    })
}

pub(crate) fn parse_goal_row(row: &Row<'_>) -> rusqlite::Result<Goal> {
    Ok(Goal {
        goal_id: text_with(row, 0, GoalId::parse)?,
        venue_id: text_with(row, 1, VenueId::parse)?,
        metric_type_id: text_with(row, 2, MetricTypeId::parse)?,
        period: enum_column(row, 3, "period", GoalPeriod::parse)?,
        target_value: row.get(4)?,
        updated_at: text_with(row, 5, parse_rfc3339_utc)?,
    })
}

pub(crate) fn parse_report_row(row: &Row<'_>) -> rusqlite::Result<Report> {
    let summary_raw: Option<String> = row.get(3)?;
    let summary = summary_raw
        .as_deref()
        .map(serde_json::from_str::<ReportSummary>)
        .transpose()
        .map_err(|err| invalid_column(3, Type::Text, format!("invalid summary_json: {err}")))?;

    Ok(Report {
        report_id: text_with(row, 0, ReportId::parse)?,
        event_id: text_with(row, 1, EventId::parse)?,
        status: enum_column(row, 2, "status", ReportStatus::parse)?,
        summary,
        error_message: row.get(4)?,
        report_url: row.get(5)?,
        generated_by: optional_text_with(row, 6, UserId::parse)?,
        created_at: text_with(row, 7, parse_rfc3339_utc)?,
        completed_at: optional_text_with(row, 8, parse_rfc3339_utc)?,
    })
}

/// Returns the entry together with the exact stored payload text, which is
/// what `payload_hash` was computed over.
pub(crate) fn parse_audit_row(row: &Row<'_>) -> rusqlite::Result<(AuditEntry, String)> {
    let entry_id_raw: String = row.get(1)?;
    let entry_id = Ulid::from_string(&entry_id_raw).map_err(|_| {
        invalid_column(1, Type::Text, format!("invalid entry_id ULID: {entry_id_raw}"))
    })?;
    let details_text: String = row.get(6)?;
    let details: Value = serde_json::from_str(&details_text)
        .map_err(|err| invalid_column(6, Type::Text, format!("invalid details_json: {err}")))?;

    let entry = AuditEntry {
        entry_seq: row.get(0)?,
        entry_id,
        user_id: optional_text_with(row, 2, UserId::parse)?,
        action: enum_column(row, 3, "action", AuditAction::parse)?,
        target_table: row.get(4)?,
        target_id: row.get(5)?,
        details,
        recorded_at: text_with(row, 7, parse_rfc3339_utc)?,
        payload_hash: row.get(8)?,
        prev_hash: row.get(9)?,
        entry_hash: row.get(10)?,
    };

    Ok((entry, details_text))
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
