use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::catalog::{validate_metric_value, MetricRegistry};
use crate::goals::GoalEvaluation;
use crate::{
    Event, EventId, GoalStatus, MetricCategory, MetricObservation, MetricType, MetricTypeId,
    MetricUnit, VenueId,
};

/// An observation together with the catalog entry it was recorded against.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedMetric {
    pub observation: MetricObservation,
    pub metric_type: MetricType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportMetricLine {
    pub metric_type_id: MetricTypeId,
    pub code: String,
    pub name: String,
    pub category: MetricCategory,
    pub unit: MetricUnit,
    pub type_active: bool,
    pub value: f64,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
    pub per_attendee: Option<f64>,
    pub target_value: Option<f64>,
    pub variance: Option<f64>,
    pub goal_status: Option<GoalStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSummary {
    pub event_id: EventId,
    pub venue_id: VenueId,
    pub event_name: String,
    #[serde(with = "crate::iso_date")]
    pub start_date: Date,
    #[serde(with = "crate::iso_date")]
    pub end_date: Date,
    pub actual_attendees: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub snapshot_at: OffsetDateTime,
    pub metrics: Vec<ReportMetricLine>,
    pub on_target: usize,
    pub off_target: usize,
    pub without_goal: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    Complete(ReportSummary),
    Inconsistent(String),
}

/// Joins an event's observations with its per-event goal evaluations.
///
/// Returns [`SummaryOutcome::Inconsistent`] when no metric type in the
/// catalog is active or a stored value no longer satisfies its value rule;
/// the caller records that as a report in `error` status.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compile_summary(
    event: &Event,
    observed: &[ObservedMetric],
    evaluations: &[GoalEvaluation],
    active_type_count: usize,
    snapshot_at: OffsetDateTime,
) -> SummaryOutcome {
    if active_type_count == 0 {
        return SummaryOutcome::Inconsistent(
            "no active metric types are configured".to_string(),
        );
    }

    let goal_rows: BTreeMap<MetricTypeId, &GoalEvaluation> = evaluations
        .iter()
        .filter(|row| row.event_id == Some(event.event_id))
        .map(|row| (row.metric_type_id, row))
        .collect();

    let attendees = event.actual_attendees.filter(|count| *count > 0);
    let mut metrics = Vec::with_capacity(observed.len());
    let (mut on_target, mut off_target, mut without_goal) = (0_usize, 0_usize, 0_usize);

    for item in observed {
        if item.observation.event_id != event.event_id {
            return SummaryOutcome::Inconsistent(format!(
                "observation {} belongs to another event",
                item.observation.observation_id
            ));
        }

        if let Err(err) = validate_metric_value(&item.metric_type, item.observation.value) {
            return SummaryOutcome::Inconsistent(err.to_string());
        }

        let goal = goal_rows.get(&item.metric_type.metric_type_id);
        match goal.map(|row| row.status) {
            Some(GoalStatus::OnTarget) => on_target += 1,
            Some(GoalStatus::OffTarget) => off_target += 1,
            None => without_goal += 1,
        }

        metrics.push(ReportMetricLine {
            metric_type_id: item.metric_type.metric_type_id,
            code: item.metric_type.code.clone(),
            name: item.metric_type.name.clone(),
            category: item.metric_type.category,
            unit: item.metric_type.unit,
            type_active: MetricRegistry::is_active(&item.metric_type),
            value: item.observation.value,
            notes: item.observation.notes.clone(),
            collected_at: item.observation.collected_at,
            per_attendee: attendees.map(|count| item.observation.value / count as f64),
            target_value: goal.map(|row| row.target_value),
            variance: goal.map(|row| row.variance),
            goal_status: goal.map(|row| row.status),
        });
    }

    metrics.sort_by(|lhs, rhs| lhs.code.cmp(&rhs.code));

    SummaryOutcome::Complete(ReportSummary {
        event_id: event.event_id,
        venue_id: event.venue_id,
        event_name: event.name.clone(),
        start_date: event.start_date,
        end_date: event.end_date,
        actual_attendees: event.actual_attendees,
        snapshot_at,
        metrics,
        on_target,
        off_target,
        without_goal,
    })
}
