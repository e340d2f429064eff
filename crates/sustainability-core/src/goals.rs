use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use crate::catalog::MetricRegistry;
use crate::{
    EngineError, EngineResult, EventId, Goal, GoalDirection, GoalId, GoalPeriod, GoalStatus,
    MetricCategory, MetricTypeId, MetricUnit, VenueId,
};

/// One stored observation joined with its event's date range.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalObservation {
    pub event_id: EventId,
    pub event_start: Date,
    pub event_end: Date,
    pub metric_type_id: MetricTypeId,
    pub value: f64,
    pub collected_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalEvaluation {
    pub goal_id: GoalId,
    pub metric_type_id: MetricTypeId,
    pub metric_type_code: String,
    pub category: MetricCategory,
    pub unit: MetricUnit,
    pub period: GoalPeriod,
    pub event_id: Option<EventId>,
    pub aggregate_value: f64,
    pub target_value: f64,
    pub variance: f64,
    pub status: GoalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindow {
    pub start: Date,
    pub end: Date,
}

impl PeriodWindow {
    #[must_use]
    pub fn intersects(&self, start: Date, end: Date) -> bool {
        start <= self.end && end >= self.start
    }
}

#[must_use]
pub fn goal_status(
    category: MetricCategory,
    aggregate_value: f64,
    target_value: f64,
) -> GoalStatus {
    let on_target = match category.direction() {
        GoalDirection::Reduction => aggregate_value <= target_value,
        GoalDirection::IncreaseDesired => aggregate_value >= target_value,
    };

    if on_target {
        GoalStatus::OnTarget
    } else {
        GoalStatus::OffTarget
    }
}

/// Calendar window containing `as_of`; `None` for per-event goals.
///
/// # Errors
/// Returns [`EngineError::Validation`] when the window cannot be represented.
pub fn period_window(
    period: GoalPeriod,
    as_of: OffsetDateTime,
) -> EngineResult<Option<PeriodWindow>> {
    let today = as_of.date();
    let year = today.year();

    let window = match period {
        GoalPeriod::Event => return Ok(None),
        GoalPeriod::Year => PeriodWindow {
            start: calendar_date(year, Month::January, 1)?,
            end: calendar_date(year, Month::December, 31)?,
        },
        GoalPeriod::Quarter => {
            let first_month = ((u8::from(today.month()) - 1) / 3) * 3 + 1;
            let start = calendar_date(year, month_from(first_month)?, 1)?;
            let end = if first_month == 10 {
                calendar_date(year, Month::December, 31)?
            } else {
                calendar_date(year, month_from(first_month + 3)?, 1)?
                    .previous_day()
                    .ok_or_else(|| {
                        EngineError::Validation("quarter end is out of range".to_string())
                    })?
            };
            PeriodWindow { start, end }
        }
    };

    Ok(Some(window))
}

/// Compares a venue's goals for `period` against the observations visible at
/// `as_of`.
///
/// `event` goals produce one row per qualifying event; `year` and `quarter`
/// goals sum every observation whose event intersects the calendar window.
/// Goals without any qualifying observation are left out. The result is
/// ordered by metric type code, then event start date, then event id.
///
/// # Errors
/// Returns [`EngineError::NotFound`] when a goal references a metric type
/// missing from `registry`, and [`EngineError::InvalidValue`] when an
/// aggregate is not finite. No partial result is returned.
pub fn evaluate_goals(
    venue_id: VenueId,
    period: GoalPeriod,
    as_of: OffsetDateTime,
    goals: &[Goal],
    registry: &MetricRegistry,
    observations: &[GoalObservation],
) -> EngineResult<Vec<GoalEvaluation>> {
    let window = period_window(period, as_of)?;
    let scope = GoalScope {
        venue_id,
        period,
        as_of,
        window,
    };
    evaluate_scoped(&scope, goals, registry, observations, |item| match window {
        Some(window) => window.intersects(item.event_start, item.event_end),
        None => item.event_start <= as_of.date(),
    })
}

/// Event-period goals of one event, whatever its start date.
///
/// Used when compiling that event's report, where a future-dated event still
/// gets its goal comparison. Visibility by `as_of` still applies to
/// observations and goals.
///
/// # Errors
/// Same as [`evaluate_goals`].
pub fn evaluate_event_goals(
    venue_id: VenueId,
    event_id: EventId,
    as_of: OffsetDateTime,
    goals: &[Goal],
    registry: &MetricRegistry,
    observations: &[GoalObservation],
) -> EngineResult<Vec<GoalEvaluation>> {
    let scope = GoalScope {
        venue_id,
        period: GoalPeriod::Event,
        as_of,
        window: None,
    };
    evaluate_scoped(&scope, goals, registry, observations, |item| {
        item.event_id == event_id
    })
}

struct GoalScope {
    venue_id: VenueId,
    period: GoalPeriod,
    as_of: OffsetDateTime,
    window: Option<PeriodWindow>,
}

fn evaluate_scoped(
    scope: &GoalScope,
    goals: &[Goal],
    registry: &MetricRegistry,
    observations: &[GoalObservation],
    include: impl Fn(&GoalObservation) -> bool,
) -> EngineResult<Vec<GoalEvaluation>> {
    let visible: Vec<&GoalObservation> = observations
        .iter()
        .filter(|item| item.collected_at <= scope.as_of)
        .filter(|item| include(item))
        .collect();

    let mut keyed: BTreeMap<(String, Date, EventId), GoalEvaluation> = BTreeMap::new();

    for goal in goals
        .iter()
        .filter(|goal| goal.venue_id == scope.venue_id && goal.period == scope.period)
        .filter(|goal| goal.updated_at <= scope.as_of)
    {
        let metric_type = registry
            .get(goal.metric_type_id)
            .ok_or_else(|| EngineError::not_found("metric type", goal.metric_type_id))?;

        let matching = visible
            .iter()
            .filter(|item| item.metric_type_id == goal.metric_type_id);

        let rows: Vec<(Option<&GoalObservation>, f64)> = if scope.window.is_some() {
            let mut count = 0_usize;
            let mut total = 0.0_f64;
            for item in matching {
                count += 1;
                total += item.value;
            }
            if count == 0 {
                continue;
            }
            vec![(None, total)]
        } else {
            matching.map(|item| (Some(*item), item.value)).collect()
        };

        for (observation, aggregate_value) in rows {
            if !aggregate_value.is_finite() {
                return Err(EngineError::InvalidValue(format!(
                    "aggregate for {} is not finite",
                    metric_type.code
                )));
            }

            let key = (
                metric_type.code.clone(),
                observation.map_or(Date::MIN, |item| item.event_start),
                observation.map_or(EventId(ulid::Ulid::nil()), |item| item.event_id),
            );

            keyed.insert(
                key,
                GoalEvaluation {
                    goal_id: goal.goal_id,
                    metric_type_id: metric_type.metric_type_id,
                    metric_type_code: metric_type.code.clone(),
                    category: metric_type.category,
                    unit: metric_type.unit,
                    period: scope.period,
                    event_id: observation.map(|item| item.event_id),
                    aggregate_value,
                    target_value: goal.target_value,
                    variance: aggregate_value - goal.target_value,
                    status: goal_status(
                        metric_type.category,
                        aggregate_value,
                        goal.target_value,
                    ),
                },
            );
        }
    }

    Ok(keyed.into_values().collect())
}

fn calendar_date(year: i32, month: Month, day: u8) -> EngineResult<Date> {
    Date::from_calendar_date(year, month, day)
        .map_err(|err| EngineError::Validation(format!("invalid calendar date: {err}")))
}

fn month_from(value: u8) -> EngineResult<Month> {
    Month::try_from(value)
        .map_err(|err| EngineError::Validation(format!("invalid month {value}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parse_date, parse_rfc3339_utc, MetricType};
    use proptest::prelude::*;

    fn must<T>(result: EngineResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    struct Fixture {
        venue_id: VenueId,
        registry: MetricRegistry,
        electricity: MetricTypeId,
        recycled: MetricTypeId,
    }

    fn fixture() -> Fixture {
        let electricity = MetricTypeId::generate();
        let recycled = MetricTypeId::generate();
        let registry = MetricRegistry::new(vec![
            MetricType {
                metric_type_id: electricity,
                code: "electricity".to_string(),
                name: "Electricity".to_string(),
                category: MetricCategory::Energy,
                unit: MetricUnit::Kwh,
                is_active: true,
            },
            MetricType {
                metric_type_id: recycled,
                code: "recycled_waste".to_string(),
                name: "Recycled Waste".to_string(),
                category: MetricCategory::Recycling,
                unit: MetricUnit::Kg,
                is_active: true,
            },
        ]);

        Fixture {
            venue_id: VenueId::generate(),
            registry,
            electricity,
            recycled,
        }
    }

    fn goal(
        venue_id: VenueId,
        metric_type_id: MetricTypeId,
        period: GoalPeriod,
        target: f64,
    ) -> Goal {
        Goal {
            goal_id: GoalId::generate(),
            venue_id,
            metric_type_id,
            period,
            target_value: target,
            updated_at: must(parse_rfc3339_utc("2026-01-01T00:00:00Z")),
        }
    }

    fn observation(
        metric_type_id: MetricTypeId,
        start: &str,
        end: &str,
        value: f64,
    ) -> GoalObservation {
        GoalObservation {
            event_id: EventId::generate(),
            event_start: must(parse_date(start)),
            event_end: must(parse_date(end)),
            metric_type_id,
            value,
            collected_at: must(parse_rfc3339_utc("2026-02-01T00:00:00Z")),
        }
    }

    fn as_of(raw: &str) -> OffsetDateTime {
        must(parse_rfc3339_utc(raw))
    }

    #[test]
    fn event_period_reports_each_event_with_variance() {
        let fx = fixture();
        let goals = vec![goal(fx.venue_id, fx.electricity, GoalPeriod::Event, 1500.0)];
        let observations = vec![observation(fx.electricity, "2026-03-01", "2026-03-02", 1800.0)];

        let rows = must(evaluate_goals(
            fx.venue_id,
            GoalPeriod::Event,
            as_of("2026-06-01T00:00:00Z"),
            &goals,
            &fx.registry,
            &observations,
        ));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric_type_code, "electricity");
        assert!((rows[0].aggregate_value - 1800.0).abs() < f64::EPSILON);
        assert!((rows[0].target_value - 1500.0).abs() < f64::EPSILON);
        assert!((rows[0].variance - 300.0).abs() < f64::EPSILON);
        assert_eq!(rows[0].status, GoalStatus::OffTarget);
        assert_eq!(rows[0].event_id, Some(observations[0].event_id));
    }

    #[test]
    fn event_scope_includes_its_own_future_dated_event() {
        let fx = fixture();
        let goals = vec![goal(fx.venue_id, fx.electricity, GoalPeriod::Event, 1500.0)];
        let upcoming = observation(fx.electricity, "2099-06-01", "2099-06-02", 1800.0);
        let other = observation(fx.electricity, "2026-03-01", "2026-03-02", 900.0);
        let observations = vec![upcoming.clone(), other];
        let snapshot = as_of("2026-06-01T00:00:00Z");

        let venue_rows = must(evaluate_goals(
            fx.venue_id,
            GoalPeriod::Event,
            snapshot,
            &goals,
            &fx.registry,
            &observations,
        ));
        assert!(venue_rows
            .iter()
            .all(|row| row.event_id != Some(upcoming.event_id)));

        let rows = must(evaluate_event_goals(
            fx.venue_id,
            upcoming.event_id,
            snapshot,
            &goals,
            &fx.registry,
            &observations,
        ));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_id, Some(upcoming.event_id));
        assert!((rows[0].variance - 300.0).abs() < f64::EPSILON);
        assert_eq!(rows[0].status, GoalStatus::OffTarget);
    }

    #[test]
    fn increase_desired_category_is_on_target_above_goal() {
        assert_eq!(
            goal_status(MetricCategory::Recycling, 620.0, 500.0),
            GoalStatus::OnTarget
        );
        assert_eq!(
            goal_status(MetricCategory::Recycling, 480.0, 500.0),
            GoalStatus::OffTarget
        );
        assert_eq!(
            goal_status(MetricCategory::Energy, 1500.0, 1500.0),
            GoalStatus::OnTarget
        );
    }

    #[test]
    fn quarter_sums_events_intersecting_the_window() {
        let fx = fixture();
        let goals = vec![goal(fx.venue_id, fx.recycled, GoalPeriod::Quarter, 500.0)];
        let observations = vec![
            observation(fx.recycled, "2026-04-10", "2026-04-11", 200.0),
            observation(fx.recycled, "2026-06-29", "2026-07-02", 150.0),
            observation(fx.recycled, "2026-03-30", "2026-04-01", 100.0),
            observation(fx.recycled, "2026-07-05", "2026-07-06", 999.0),
        ];

        let rows = must(evaluate_goals(
            fx.venue_id,
            GoalPeriod::Quarter,
            as_of("2026-05-15T00:00:00Z"),
            &goals,
            &fx.registry,
            &observations,
        ));

        assert_eq!(rows.len(), 1);
        assert!((rows[0].aggregate_value - 450.0).abs() < f64::EPSILON);
        assert_eq!(rows[0].event_id, None);
        assert_eq!(rows[0].status, GoalStatus::OffTarget);
    }

    #[test]
    fn year_window_covers_whole_calendar_year() {
        let window = must(period_window(GoalPeriod::Year, as_of("2026-08-09T10:00:00Z")));
        assert_eq!(
            window,
            Some(PeriodWindow {
                start: must(parse_date("2026-01-01")),
                end: must(parse_date("2026-12-31")),
            })
        );

        let q4 = must(period_window(GoalPeriod::Quarter, as_of("2026-11-30T10:00:00Z")));
        assert_eq!(
            q4,
            Some(PeriodWindow {
                start: must(parse_date("2026-10-01")),
                end: must(parse_date("2026-12-31")),
            })
        );

        let q1 = must(period_window(GoalPeriod::Quarter, as_of("2028-02-10T10:00:00Z")));
        assert_eq!(
            q1.map(|window| window.end),
            Some(must(parse_date("2028-03-31")))
        );
    }

    #[test]
    fn metric_types_without_goal_are_omitted() {
        let fx = fixture();
        let goals = vec![goal(fx.venue_id, fx.electricity, GoalPeriod::Event, 1500.0)];
        let observations = vec![
            observation(fx.electricity, "2026-03-01", "2026-03-02", 900.0),
            observation(fx.recycled, "2026-03-01", "2026-03-02", 900.0),
        ];

        let rows = must(evaluate_goals(
            fx.venue_id,
            GoalPeriod::Event,
            as_of("2026-06-01T00:00:00Z"),
            &goals,
            &fx.registry,
            &observations,
        ));

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric_type_id, fx.electricity);
    }

    #[test]
    fn writes_after_as_of_are_invisible() {
        let fx = fixture();
        let goals = vec![goal(fx.venue_id, fx.electricity, GoalPeriod::Year, 1500.0)];
        let mut late = observation(fx.electricity, "2026-03-01", "2026-03-02", 900.0);
        late.collected_at = as_of("2026-09-01T00:00:00Z");

        let rows = must(evaluate_goals(
            fx.venue_id,
            GoalPeriod::Year,
            as_of("2026-06-01T00:00:00Z"),
            &goals,
            &fx.registry,
            &[late],
        ));
        assert!(rows.is_empty());
    }

    #[test]
    fn goals_of_other_venues_and_periods_are_ignored() {
        let fx = fixture();
        let goals = vec![
            goal(VenueId::generate(), fx.electricity, GoalPeriod::Event, 10.0),
            goal(fx.venue_id, fx.electricity, GoalPeriod::Year, 10.0),
        ];
        let observations = vec![observation(fx.electricity, "2026-03-01", "2026-03-02", 900.0)];

        let rows = must(evaluate_goals(
            fx.venue_id,
            GoalPeriod::Event,
            as_of("2026-06-01T00:00:00Z"),
            &goals,
            &fx.registry,
            &observations,
        ));
        assert!(rows.is_empty());
    }

    #[test]
    fn goal_with_unknown_metric_type_fails_whole_evaluation() {
        let fx = fixture();
        let goals = vec![
            goal(fx.venue_id, fx.electricity, GoalPeriod::Event, 1500.0),
            goal(fx.venue_id, MetricTypeId::generate(), GoalPeriod::Event, 1.0),
        ];
        let observations = vec![observation(fx.electricity, "2026-03-01", "2026-03-02", 900.0)];

        let result = evaluate_goals(
            fx.venue_id,
            GoalPeriod::Event,
            as_of("2026-06-01T00:00:00Z"),
            &goals,
            &fx.registry,
            &observations,
        );
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    proptest! {
        #[test]
        fn prop_evaluation_is_deterministic(
            values in prop::collection::vec(0.0f64..10_000.0, 0..30),
            target in 0.0f64..50_000.0,
        ) {
            let fx = fixture();
            let goals = vec![
                goal(fx.venue_id, fx.electricity, GoalPeriod::Year, target),
                goal(fx.venue_id, fx.recycled, GoalPeriod::Year, target),
            ];
            let observations: Vec<GoalObservation> = values
                .iter()
                .enumerate()
                .map(|(index, value)| {
                    let metric = if index % 2 == 0 { fx.electricity } else { fx.recycled };
                    observation(metric, "2026-03-01", "2026-03-02", *value)
                })
                .collect();
            let when = as_of("2026-06-01T00:00:00Z");

            let first = must(evaluate_goals(
                fx.venue_id,
                GoalPeriod::Year,
                when,
                &goals,
                &fx.registry,
                &observations,
            ));
            let second = must(evaluate_goals(
                fx.venue_id,
                GoalPeriod::Year,
                when,
                &goals,
                &fx.registry,
                &observations,
            ));
            prop_assert_eq!(&first, &second);

            for row in &first {
                let expected = row.aggregate_value - row.target_value;
                prop_assert!((row.variance - expected).abs() < 1e-9);
            }
        }
    }
}
