#![allow(clippy::missing_errors_doc)]

//! SQLite-backed sustainability reporting engine.
//!
//! Every mutating operation runs inside one `BEGIN IMMEDIATE` transaction
//! together with its audit entry. A failed audit write fails the whole
//! operation.

mod artifact;
mod rows;
mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sustainability_core::{
    authorize, compile_summary, compute_entry_hash, ensure_ingestible, evaluate_event_goals,
    evaluate_goals, format_date, format_rfc3339, hash_bytes, normalize_email, now_utc,
    update_details, validate_metric_value, verify_chain, AuditAction, AuditChainReport,
    AuditDraft, AuditEntry, Capability, EffectiveRole, EngineError, EngineResult, ErrorClass,
    Event, EventId, EventInput, Goal, GoalEvaluation, GoalId, GoalObservation, GoalPeriod,
    MetricObservation, MetricRegistry, MetricType, ObservationId, ObservedMetric, Principal,
    Report, ReportId, ReportStatus, SummaryOutcome, User, UserId, UserRole, Venue, VenueId,
    VenueMembership, VenueRole, CATALOG_V1,
};
use tracing::{debug, info, warn};
use ulid::Ulid;

pub use artifact::{ArtifactStore, FileArtifactStore};

use rows::{
    bool_to_sql, collect_rows, parse_audit_row, parse_event_row, parse_goal_observation_row,
    parse_goal_row, parse_metric_type_row, parse_observation_row, parse_report_row,
    parse_user_row, parse_venue_row, AUDIT_COLUMNS, EVENT_COLUMNS, GOAL_COLUMNS,
    METRIC_TYPE_COLUMNS, OBSERVATION_COLUMNS, REPORT_COLUMNS, USER_COLUMNS, VENUE_COLUMNS,
};
use schema::{ENGINE_MIGRATION_VERSION, SCHEMA_ENGINE_V1};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    pub busy_timeout_ms: u64,
    pub max_conflict_retries: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            max_conflict_retries: 3,
        }
    }
}

pub struct SqliteEngineStore {
    conn: Connection,
    options: StoreOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedReport {
    pub report: Report,
    /// Set when the report committed but its artifact could not be attached.
    pub artifact_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditFilter {
    pub target_table: Option<String>,
    pub target_id: Option<String>,
    pub limit: Option<usize>,
}

struct Denied {
    operation: &'static str,
    capability: Capability,
    target_table: &'static str,
    target_id: String,
}

impl SqliteEngineStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    pub fn open_with_options(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            options.busy_timeout_ms
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, options })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ENGINE_V1)
            .context("failed to apply engine schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ENGINE_MIGRATION_VERSION, now],
            )
            .context("failed to register engine schema migration")?;

        for entry in CATALOG_V1 {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO metric_types(
                       metric_type_id, code, name, category, unit, is_active
                     )
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    params![
                        Ulid::new().to_string(),
                        entry.code,
                        entry.name,
                        entry.category.as_str(),
                        entry.unit.as_str(),
                    ],
                )
                .with_context(|| format!("failed to seed metric type {}", entry.code))?;
        }

        Ok(())
    }

    /// Records a user handed over by the auth provider. System-initiated, so
    /// the audit entry carries no acting user.
    pub fn register_user(
        &mut self,
        email: &str,
        display_name: &str,
        role: UserRole,
    ) -> EngineResult<User> {
        let email = normalize_email(email)?;
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(EngineError::Validation(
                "display_name MUST be provided".to_string(),
            ));
        }

        let registered = self.write_tx("register_user", |tx| {
            let taken: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM users WHERE email = ?1",
                    params![email],
                    |row| row.get(0),
                )
                .optional()
                .sql_context("failed to check email uniqueness")?;
            if let Some(existing) = taken {
                return Ok(Err(existing));
            }

            let user = User {
                user_id: UserId::generate(),
                email: email.clone(),
                display_name: display_name.to_string(),
                role,
                is_active: true,
                created_at: now_utc(),
            };

            tx.execute(
                "INSERT INTO users(user_id, email, display_name, role, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.user_id.to_string(),
                    user.email,
                    user.display_name,
                    user.role.as_str(),
                    bool_to_sql(user.is_active),
                    format_rfc3339(user.created_at)?,
                ],
            )
            .sql_context("failed to insert user")?;

            record_audit(
                tx,
                &AuditDraft {
                    user_id: None,
                    action: AuditAction::UserRegister,
                    target_table: "users",
                    target_id: user.user_id.to_string(),
                    details: json!({ "email": user.email, "role": user.role.as_str() }),
                },
            )?;

            Ok(Ok(user))
        })?;

        // A taken email is settled by committed state, so it skips the retry loop.
        let user = registered.map_err(|existing| {
            EngineError::Conflict(format!("email {email} already belongs to user {existing}"))
        })?;

        info!(user_id = %user.user_id, role = user.role.as_str(), "user registered");
        Ok(user)
    }

    pub fn deactivate_user(&mut self, user_id: UserId, acting: UserId) -> EngineResult<User> {
        let result = self.write_tx("deactivate_user", |tx| {
            authorize_in(tx, acting, None, Capability::Administer)?;
            let mut user = get_user_in(tx, user_id)?
                .ok_or_else(|| EngineError::not_found("user", user_id))?;
            let prior = user.is_active;

            tx.execute(
                "UPDATE users SET is_active = 0 WHERE user_id = ?1",
                params![user_id.to_string()],
            )
            .sql_context("failed to deactivate user")?;
            user.is_active = false;

            record_audit(
                tx,
                &AuditDraft {
                    user_id: Some(acting),
                    action: AuditAction::UserDeactivate,
                    target_table: "users",
                    target_id: user_id.to_string(),
                    details: update_details(
                        json!({ "is_active": prior }),
                        json!({ "is_active": false }),
                    ),
                },
            )?;

            Ok(user)
        });

        let user = self.deny_audited(
            acting,
            &Denied {
                operation: "deactivate_user",
                capability: Capability::Administer,
                target_table: "users",
                target_id: user_id.to_string(),
            },
            result,
        )?;
        info!(user_id = %user_id, acting = %acting, "user deactivated");
        Ok(user)
    }

    pub fn create_venue(
        &mut self,
        name: &str,
        contact_user_id: Option<UserId>,
        acting: UserId,
    ) -> EngineResult<Venue> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation(
                "venue name MUST be provided".to_string(),
            ));
        }

        let result = self.write_tx("create_venue", |tx| {
            authorize_in(tx, acting, None, Capability::Administer)?;
            if let Some(contact) = contact_user_id {
                get_user_in(tx, contact)?.ok_or_else(|| EngineError::not_found("user", contact))?;
            }

            let venue = Venue {
                venue_id: VenueId::generate(),
                name: name.to_string(),
                contact_user_id,
                created_at: now_utc(),
            };

            tx.execute(
                "INSERT INTO venues(venue_id, name, contact_user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    venue.venue_id.to_string(),
                    venue.name,
                    venue.contact_user_id.map(|id| id.to_string()),
                    format_rfc3339(venue.created_at)?,
                ],
            )
            .sql_context("failed to insert venue")?;

            record_audit(
                tx,
                &AuditDraft {
                    user_id: Some(acting),
                    action: AuditAction::VenueCreate,
                    target_table: "venues",
                    target_id: venue.venue_id.to_string(),
                    details: json!({
                        "name": venue.name,
                        "contact_user_id": venue.contact_user_id.map(|id| id.to_string()),
                    }),
                },
            )?;

            Ok(venue)
        });

        let venue = self.deny_audited(
            acting,
            &Denied {
                operation: "create_venue",
                capability: Capability::Administer,
                target_table: "venues",
                target_id: String::new(),
            },
            result,
        )?;
        info!(venue_id = %venue.venue_id, "venue created");
        Ok(venue)
    }

    /// Grants or changes `user_id`'s role on `venue_id`. There is at most one
    /// membership row per pair; a second grant replaces the role.
    pub fn grant_membership(
        &mut self,
        user_id: UserId,
        venue_id: VenueId,
        role: VenueRole,
        acting: UserId,
    ) -> EngineResult<VenueMembership> {
        let result = self.write_tx("grant_membership", |tx| {
            load_venue(tx, venue_id)?;
            authorize_in(tx, acting, Some(venue_id), Capability::ManageVenue)?;
            get_user_in(tx, user_id)?.ok_or_else(|| EngineError::not_found("user", user_id))?;
            let prior = membership_role(tx, user_id, venue_id)?;

            tx.execute(
                "INSERT INTO venue_memberships(user_id, venue_id, role, granted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, venue_id) DO UPDATE SET
                   role = excluded.role,
                   granted_at = excluded.granted_at",
                params![
                    user_id.to_string(),
                    venue_id.to_string(),
                    role.as_str(),
                    format_rfc3339(now_utc())?,
                ],
            )
            .sql_context("failed to upsert venue membership")?;

            record_audit(
                tx,
                &AuditDraft {
                    user_id: Some(acting),
                    action: AuditAction::MembershipGrant,
                    target_table: "venue_memberships",
                    target_id: format!("{user_id}:{venue_id}"),
                    details: update_details(
                        json!({ "role": prior.map(VenueRole::as_str) }),
                        json!({ "role": role.as_str() }),
                    ),
                },
            )?;

            Ok(VenueMembership {
                user_id,
                venue_id,
                role,
            })
        });

        let membership = self.deny_audited(
            acting,
            &Denied {
                operation: "grant_membership",
                capability: Capability::ManageVenue,
                target_table: "venues",
                target_id: venue_id.to_string(),
            },
            result,
        )?;
        info!(user_id = %user_id, venue_id = %venue_id, role = role.as_str(), "membership granted");
        Ok(membership)
    }

    pub fn create_event(&mut self, input: &EventInput, acting: UserId) -> EngineResult<Event> {
        input.validate()?;

        let result = self.write_tx("create_event", |tx| {
            load_venue(tx, input.venue_id)?;
            authorize_in(tx, acting, Some(input.venue_id), Capability::ManageVenue)?;

            let event = Event {
                event_id: EventId::generate(),
                venue_id: input.venue_id,
                name: input.name.trim().to_string(),
                start_date: input.start_date,
                end_date: input.end_date,
                expected_attendees: input.expected_attendees,
                actual_attendees: input.actual_attendees,
                created_at: now_utc(),
            };

            tx.execute(
                "INSERT INTO events(
                    event_id, venue_id, name, start_date, end_date,
                    expected_attendees, actual_attendees, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.event_id.to_string(),
                    event.venue_id.to_string(),
                    event.name,
                    format_date(event.start_date),
                    format_date(event.end_date),
                    event.expected_attendees,
                    event.actual_attendees,
                    format_rfc3339(event.created_at)?,
                ],
            )
            .sql_context("failed to insert event")?;

            record_audit(
                tx,
                &AuditDraft {
                    user_id: Some(acting),
                    action: AuditAction::EventCreate,
                    target_table: "events",
                    target_id: event.event_id.to_string(),
                    details: json!({
                        "venue_id": event.venue_id.to_string(),
                        "name": event.name,
                        "start_date": format_date(event.start_date),
                        "end_date": format_date(event.end_date),
                    }),
                },
            )?;

            Ok(event)
        });

        let event = self.deny_audited(
            acting,
            &Denied {
                operation: "create_event",
                capability: Capability::ManageVenue,
                target_table: "venues",
                target_id: input.venue_id.to_string(),
            },
            result,
        )?;
        info!(event_id = %event.event_id, venue_id = %event.venue_id, "event created");
        Ok(event)
    }

    /// Takes a metric type out of new ingestion. Existing observations and
    /// reports referencing it are untouched.
    pub fn deactivate_metric_type(
        &mut self,
        identifier: &str,
        acting: UserId,
    ) -> EngineResult<MetricType> {
        let result = self.write_tx("deactivate_metric_type", |tx| {
            authorize_in(tx, acting, None, Capability::Administer)?;
            let registry = load_registry(tx)?;
            let mut metric_type = registry.resolve(identifier)?.clone();
            let prior = MetricRegistry::is_active(&metric_type);

            tx.execute(
                "UPDATE metric_types SET is_active = 0 WHERE metric_type_id = ?1",
                params![metric_type.metric_type_id.to_string()],
            )
            .sql_context("failed to deactivate metric type")?;
            metric_type.is_active = false;

            record_audit(
                tx,
                &AuditDraft {
                    user_id: Some(acting),
                    action: AuditAction::MetricTypeDeactivate,
                    target_table: "metric_types",
                    target_id: metric_type.metric_type_id.to_string(),
                    details: update_details(
                        json!({ "is_active": prior }),
                        json!({ "is_active": false }),
                    ),
                },
            )?;

            Ok(metric_type)
        });

        let metric_type = self.deny_audited(
            acting,
            &Denied {
                operation: "deactivate_metric_type",
                capability: Capability::Administer,
                target_table: "metric_types",
                target_id: identifier.trim().to_string(),
            },
            result,
        )?;
        info!(code = %metric_type.code, "metric type deactivated");
        Ok(metric_type)
    }

    /// Upserts the single observation for (event, metric type).
    ///
    /// A repeat call replaces value and notes and refreshes `collected_at`.
    /// Every call is audited, including ones that store an unchanged value.
    pub fn ingest_metric(
        &mut self,
        event_id: EventId,
        metric_type: &str,
        value: f64,
        notes: Option<&str>,
        acting: UserId,
    ) -> EngineResult<MetricObservation> {
        let result = self.write_tx("ingest_metric", |tx| {
            let event = load_event(tx, event_id)?;
            authorize_in(tx, acting, Some(event.venue_id), Capability::Write)?;

            let registry = load_registry(tx)?;
            let metric_type = registry.resolve(metric_type)?;
            validate_metric_value(metric_type, value)?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {OBSERVATION_COLUMNS} FROM metric_observations
                         WHERE event_id = ?1 AND metric_type_id = ?2"
                    ),
                    params![event_id.to_string(), metric_type.metric_type_id.to_string()],
                    parse_observation_row,
                )
                .optional()
                .sql_context("failed to load existing observation")?;
            ensure_ingestible(metric_type, existing.is_some())?;

            let observation = MetricObservation {
                observation_id: existing
                    .as_ref()
                    .map_or_else(ObservationId::generate, |row| row.observation_id),
                event_id,
                metric_type_id: metric_type.metric_type_id,
                value,
                notes: notes.map(str::to_string),
                collected_at: now_utc(),
            };

            tx.execute(
                "INSERT INTO metric_observations(
                    observation_id, event_id, metric_type_id, value, notes, collected_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(event_id, metric_type_id) DO UPDATE SET
                   value = excluded.value,
                   notes = excluded.notes,
                   collected_at = excluded.collected_at",
                params![
                    observation.observation_id.to_string(),
                    observation.event_id.to_string(),
                    observation.metric_type_id.to_string(),
                    observation.value,
                    observation.notes,
                    format_rfc3339(observation.collected_at)?,
                ],
            )
            .sql_context("failed to upsert metric observation")?;

            let prior = existing.as_ref().map_or(Value::Null, |row| {
                json!({ "value": row.value, "notes": row.notes })
            });
            record_audit(
                tx,
                &AuditDraft {
                    user_id: Some(acting),
                    action: AuditAction::MetricUpsert,
                    target_table: "metric_observations",
                    target_id: observation.observation_id.to_string(),
                    details: update_details(
                        prior,
                        json!({
                            "event_id": event_id.to_string(),
                            "metric_type": metric_type.code,
                            "value": observation.value,
                            "notes": observation.notes,
                        }),
                    ),
                },
            )?;

            Ok(observation)
        });

        let observation = self.deny_audited(
            acting,
            &Denied {
                operation: "ingest_metric",
                capability: Capability::Write,
                target_table: "events",
                target_id: event_id.to_string(),
            },
            result,
        )?;
        info!(
            event_id = %event_id,
            observation_id = %observation.observation_id,
            value = observation.value,
            "metric observation upserted"
        );
        Ok(observation)
    }

    /// Sets the single goal for (venue, metric type, period).
    pub fn set_goal(
        &mut self,
        venue_id: VenueId,
        metric_type: &str,
        target_value: f64,
        period: GoalPeriod,
        acting: UserId,
    ) -> EngineResult<Goal> {
        let result = self.write_tx("set_goal", |tx| {
            load_venue(tx, venue_id)?;
            authorize_in(tx, acting, Some(venue_id), Capability::ManageGoals)?;

            let registry = load_registry(tx)?;
            let metric_type = registry.resolve(metric_type)?;
            validate_metric_value(metric_type, target_value)?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {GOAL_COLUMNS} FROM goals
                         WHERE venue_id = ?1 AND metric_type_id = ?2 AND period = ?3"
                    ),
                    params![
                        venue_id.to_string(),
                        metric_type.metric_type_id.to_string(),
                        period.as_str(),
                    ],
                    parse_goal_row,
                )
                .optional()
                .sql_context("failed to load existing goal")?;

            let goal = Goal {
                goal_id: existing
                    .as_ref()
                    .map_or_else(GoalId::generate, |row| row.goal_id),
                venue_id,
                metric_type_id: metric_type.metric_type_id,
                period,
                target_value,
                updated_at: now_utc(),
            };

            tx.execute(
                "INSERT INTO goals(
                   goal_id, venue_id, metric_type_id, period, target_value, updated_at
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(venue_id, metric_type_id, period) DO UPDATE SET
                   target_value = excluded.target_value,
                   updated_at = excluded.updated_at",
                params![
                    goal.goal_id.to_string(),
                    goal.venue_id.to_string(),
                    goal.metric_type_id.to_string(),
                    goal.period.as_str(),
                    goal.target_value,
                    format_rfc3339(goal.updated_at)?,
                ],
            )
            .sql_context("failed to upsert goal")?;

            record_audit(
                tx,
                &AuditDraft {
                    user_id: Some(acting),
                    action: AuditAction::GoalSet,
                    target_table: "goals",
                    target_id: goal.goal_id.to_string(),
                    details: update_details(
                        existing
                            .as_ref()
                            .map_or(Value::Null, |row| json!({ "target_value": row.target_value })),
                        json!({
                            "metric_type": metric_type.code,
                            "period": period.as_str(),
                            "target_value": target_value,
                        }),
                    ),
                },
            )?;

            Ok(goal)
        });

        let goal = self.deny_audited(
            acting,
            &Denied {
                operation: "set_goal",
                capability: Capability::ManageGoals,
                target_table: "venues",
                target_id: venue_id.to_string(),
            },
            result,
        )?;
        info!(
            venue_id = %venue_id,
            goal_id = %goal.goal_id,
            period = period.as_str(),
            target_value,
            "goal set"
        );
        Ok(goal)
    }

    /// Compiles a new report row for `event_id`.
    ///
    /// Each call creates a fresh report; earlier reports stay untouched. When
    /// `artifacts` is given and the report completed, the artifact is stored
    /// after commit and its URL attached; a failure there is returned in
    /// [`GeneratedReport::artifact_error`] and does not change the report.
    pub fn generate_report(
        &mut self,
        event_id: EventId,
        acting: UserId,
        artifacts: Option<&dyn ArtifactStore>,
    ) -> EngineResult<GeneratedReport> {
        let result = self.write_tx("generate_report", |tx| compile_report(tx, event_id, acting));
        let report = self.deny_audited(
            acting,
            &Denied {
                operation: "generate_report",
                capability: Capability::Write,
                target_table: "events",
                target_id: event_id.to_string(),
            },
            result,
        )?;
        info!(
            report_id = %report.report_id,
            event_id = %event_id,
            status = report.status.as_str(),
            "report generated"
        );

        let mut generated = GeneratedReport {
            report,
            artifact_error: None,
        };

        let Some(artifacts) = artifacts else {
            return Ok(generated);
        };
        if generated.report.status != ReportStatus::Complete {
            return Ok(generated);
        }

        let report_id = generated.report.report_id;
        let attached = artifacts
            .store(&generated.report)
            .map_err(|err| format!("artifact storage failed: {err:#}"))
            .and_then(|url| {
                self.attach_report_artifact(report_id, &url)
                    .map_err(|err| err.to_string())
            });

        match attached {
            Ok(report) => generated.report = report,
            Err(message) => {
                warn!(report_id = %report_id, error = %message, "report artifact not attached");
                generated.artifact_error = Some(message);
            }
        }

        Ok(generated)
    }

    /// Writes back the artifact reference of a `complete` report. Only one
    /// attachment per report is accepted.
    pub fn attach_report_artifact(
        &mut self,
        report_id: ReportId,
        url: &str,
    ) -> EngineResult<Report> {
        let url = url.trim();
        if url.is_empty() {
            return Err(EngineError::Validation(
                "report_url MUST be provided".to_string(),
            ));
        }

        let report = self.write_tx("attach_report_artifact", |tx| {
            let mut report = load_report(tx, report_id)?;
            if report.status != ReportStatus::Complete {
                return Err(EngineError::Validation(format!(
                    "report {report_id} is {}; only complete reports accept an artifact",
                    report.status.as_str()
                )));
            }
            if let Some(existing) = &report.report_url {
                return Err(EngineError::Validation(format!(
                    "report {report_id} already has artifact {existing}"
                )));
            }

            tx.execute(
                "UPDATE reports SET report_url = ?2 WHERE report_id = ?1",
                params![report_id.to_string(), url],
            )
            .sql_context("failed to attach report artifact")?;
            report.report_url = Some(url.to_string());

            record_audit(
                tx,
                &AuditDraft {
                    user_id: None,
                    action: AuditAction::ReportAttachArtifact,
                    target_table: "reports",
                    target_id: report_id.to_string(),
                    details: update_details(Value::Null, json!({ "report_url": url })),
                },
            )?;

            Ok(report)
        })?;

        info!(report_id = %report_id, "report artifact attached");
        Ok(report)
    }

    /// Evaluates the venue's goals for `period` against state visible at
    /// `as_of`. Read-only; repeated calls without intervening writes return
    /// identical results.
    pub fn get_venue_goal_status(
        &mut self,
        venue_id: VenueId,
        period: GoalPeriod,
        as_of: time::OffsetDateTime,
        acting: Option<UserId>,
    ) -> EngineResult<Vec<GoalEvaluation>> {
        let result = self.read_tx(|tx| {
            load_venue(tx, venue_id)?;
            if let Some(acting) = acting {
                authorize_in(tx, acting, Some(venue_id), Capability::Read)?;
            }

            let registry = load_registry(tx)?;
            let goals = load_goals(tx, venue_id)?;
            let observations = load_goal_observations(tx, venue_id)?;
            debug!(
                venue_id = %venue_id,
                goals = goals.len(),
                observations = observations.len(),
                "evaluating venue goals"
            );

            evaluate_goals(venue_id, period, as_of, &goals, &registry, &observations)
        });

        match acting {
            Some(acting) => self.deny_audited(
                acting,
                &Denied {
                    operation: "get_venue_goal_status",
                    capability: Capability::Read,
                    target_table: "venues",
                    target_id: venue_id.to_string(),
                },
                result,
            ),
            None => result,
        }
    }

    pub fn get_user(&self, user_id: UserId) -> EngineResult<User> {
        get_user_in(&self.conn, user_id)?.ok_or_else(|| EngineError::not_found("user", user_id))
    }

    pub fn get_venue(&self, venue_id: VenueId) -> EngineResult<Venue> {
        load_venue(&self.conn, venue_id)
    }

    pub fn get_event(&self, event_id: EventId) -> EngineResult<Event> {
        load_event(&self.conn, event_id)
    }

    pub fn get_report(&self, report_id: ReportId) -> EngineResult<Report> {
        load_report(&self.conn, report_id)
    }

    pub fn list_reports_for_event(&self, event_id: EventId) -> EngineResult<Vec<Report>> {
        load_event(&self.conn, event_id)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {REPORT_COLUMNS} FROM reports
                 WHERE event_id = ?1
                 ORDER BY created_at ASC, report_id ASC"
            ))
            .sql_context("failed to prepare report listing")?;
        let rows = stmt
            .query_map(params![event_id.to_string()], parse_report_row)
            .sql_context("failed to list reports")?;
        collect_rows(rows).sql_context("failed to read report row")
    }

    pub fn list_observations_for_event(
        &self,
        event_id: EventId,
    ) -> EngineResult<Vec<MetricObservation>> {
        load_event(&self.conn, event_id)?;
        list_observations_in(&self.conn, event_id)
    }

    pub fn list_metric_types(&self) -> EngineResult<Vec<MetricType>> {
        Ok(load_registry(&self.conn)?.types().to_vec())
    }

    pub fn list_audit_entries(&self, filter: &AuditFilter) -> EngineResult<Vec<AuditEntry>> {
        Ok(self
            .load_audit_rows(filter)?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    /// Re-derives payload and entry hashes over the whole log and checks
    /// predecessor links.
    pub fn verify_audit_chain(&self) -> EngineResult<AuditChainReport> {
        let rows = self.load_audit_rows(&AuditFilter::default())?;

        let payload_break = rows
            .iter()
            .find(|(entry, details_text)| hash_bytes(details_text.as_bytes()) != entry.payload_hash)
            .map(|(entry, _)| entry.entry_seq);

        let entries: Vec<AuditEntry> = rows.into_iter().map(|(entry, _)| entry).collect();
        let mut report = verify_chain(&entries)?;

        let first_broken = match (report.first_broken_seq, payload_break) {
            (Some(chain), Some(payload)) => Some(chain.min(payload)),
            (chain, payload) => chain.or(payload),
        };
        report.first_broken_seq = first_broken;
        report.chain_valid = first_broken.is_none();

        if !report.chain_valid {
            warn!(first_broken_seq = ?first_broken, "audit chain verification failed");
        }
        Ok(report)
    }

    fn load_audit_rows(&self, filter: &AuditFilter) -> EngineResult<Vec<(AuditEntry, String)>> {
        let mut query = format!("SELECT {AUDIT_COLUMNS} FROM audit_log");
        let mut values: Vec<String> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();

        if let Some(table) = &filter.target_table {
            values.push(table.clone());
            clauses.push(format!("target_table = ?{}", values.len()));
        }
        if let Some(target_id) = &filter.target_id {
            values.push(target_id.clone());
            clauses.push(format!("target_id = ?{}", values.len()));
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY entry_seq ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ");
            query.push_str(&limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&query)
            .sql_context("failed to prepare audit listing")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), parse_audit_row)
            .sql_context("failed to list audit entries")?;
        collect_rows(rows).sql_context("failed to read audit row")
    }

    fn write_tx<T>(
        &mut self,
        operation: &'static str,
        mut work: impl FnMut(&Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut attempt = 0_u32;
        loop {
            match run_immediate(&mut self.conn, &mut work) {
                Err(err)
                    if err.class() == ErrorClass::Conflict
                        && attempt < self.options.max_conflict_retries =>
                {
                    attempt += 1;
                    warn!(operation, attempt, error = %err, "retrying after write conflict");
                    std::thread::sleep(Duration::from_millis(u64::from(attempt) * 10));
                }
                other => return other,
            }
        }
    }

    fn read_tx<T>(
        &mut self,
        work: impl FnOnce(&Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .sql_context("failed to begin read transaction")?;
        let value = work(&tx)?;
        tx.commit().sql_context("failed to end read transaction")?;
        Ok(value)
    }

    /// On a guard denial, appends a minimal `access_denied` entry in its own
    /// transaction and hands the original error back.
    fn deny_audited<T>(
        &mut self,
        acting: UserId,
        denied: &Denied,
        result: EngineResult<T>,
    ) -> EngineResult<T> {
        if let Err(EngineError::Forbidden(reason)) = &result {
            warn!(
                user_id = %acting,
                operation = denied.operation,
                capability = denied.capability.as_str(),
                reason = %reason,
                "access denied"
            );

            let draft = AuditDraft {
                user_id: Some(acting),
                action: AuditAction::AccessDenied,
                target_table: denied.target_table,
                target_id: denied.target_id.clone(),
                details: json!({
                    "operation": denied.operation,
                    "capability": denied.capability.as_str(),
                }),
            };
            if let Err(err) = self.write_tx("record_access_denied", |tx| {
                record_audit(tx, &draft).map(|_| ())
            }) {
                warn!(error = %err, "failed to record access denial");
            }
        }

        result
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn run_immediate<T>(
    conn: &mut Connection,
    work: &mut impl FnMut(&Transaction<'_>) -> EngineResult<T>,
) -> EngineResult<T> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .sql_context("failed to begin write transaction")?;
    let value = work(&tx)?;
    tx.commit().sql_context("failed to commit write transaction")?;
    Ok(value)
}

fn compile_report(tx: &Connection, event_id: EventId, acting: UserId) -> EngineResult<Report> {
    let event = load_event(tx, event_id)?;
    authorize_in(tx, acting, Some(event.venue_id), Capability::Write)?;

    let observations = list_observations_in(tx, event_id)?;
    if observations.is_empty() {
        return Err(EngineError::NoMetrics(event_id.to_string()));
    }

    let registry = load_registry(tx)?;
    let snapshot_at = now_utc();
    let report_id = ReportId::generate();

    tx.execute(
        "INSERT INTO reports(report_id, event_id, status, generated_by, created_at)
         VALUES (?1, ?2, 'draft', ?3, ?4)",
        params![
            report_id.to_string(),
            event_id.to_string(),
            acting.to_string(),
            format_rfc3339(snapshot_at)?,
        ],
    )
    .sql_context("failed to insert draft report")?;

    let observation_count = observations.len();
    let observed = observations
        .into_iter()
        .map(|observation| {
            registry
                .get(observation.metric_type_id)
                .cloned()
                .map(|metric_type| ObservedMetric {
                    observation,
                    metric_type,
                })
                .ok_or_else(|| {
                    EngineError::Storage("observation references a missing metric type".to_string())
                })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let goals = load_goals(tx, event.venue_id)?;
    let goal_observations = load_goal_observations(tx, event.venue_id)?;
    let outcome = match evaluate_event_goals(
        event.venue_id,
        event_id,
        snapshot_at,
        &goals,
        &registry,
        &goal_observations,
    ) {
        Ok(evaluations) => compile_summary(
            &event,
            &observed,
            &evaluations,
            registry.active_count(),
            snapshot_at,
        ),
        Err(err) => SummaryOutcome::Inconsistent(format!("goal evaluation failed: {err}")),
    };

    let (status, summary, error_message) = match outcome {
        SummaryOutcome::Complete(summary) => (ReportStatus::Complete, Some(summary), None),
        SummaryOutcome::Inconsistent(message) => (ReportStatus::Error, None, Some(message)),
    };
    let summary_json = summary
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| EngineError::Storage(format!("failed to serialize report summary: {err}")))?;
    if !ReportStatus::Draft.can_transition_to(status) {
        return Err(EngineError::Storage(format!(
            "report {report_id} cannot move from draft to {}",
            status.as_str()
        )));
    }
    let completed_at = now_utc();

    tx.execute(
        "UPDATE reports
         SET status = ?2, summary_json = ?3, error_message = ?4, completed_at = ?5
         WHERE report_id = ?1",
        params![
            report_id.to_string(),
            status.as_str(),
            summary_json,
            error_message,
            format_rfc3339(completed_at)?,
        ],
    )
    .sql_context("failed to finalize report")?;

    record_audit(
        tx,
        &AuditDraft {
            user_id: Some(acting),
            action: AuditAction::ReportGenerate,
            target_table: "reports",
            target_id: report_id.to_string(),
            details: json!({
                "event_id": event_id.to_string(),
                "status": status.as_str(),
                "observation_count": observation_count,
                "error_message": error_message,
            }),
        },
    )?;

    Ok(Report {
        report_id,
        event_id,
        status,
        summary,
        error_message,
        report_url: None,
        generated_by: Some(acting),
        created_at: snapshot_at,
        completed_at: Some(completed_at),
    })
}

/// Appends one hash-linked audit entry on the caller's transaction. Any
/// failure surfaces as [`EngineError::Dependency`] so the caller rolls back.
fn record_audit(conn: &Connection, draft: &AuditDraft) -> EngineResult<AuditEntry> {
    append_audit(conn, draft).map_err(|err| match err {
        EngineError::Dependency(_) => err,
        other => EngineError::Dependency(format!("audit write failed: {other}")),
    })
}

fn append_audit(conn: &Connection, draft: &AuditDraft) -> EngineResult<AuditEntry> {
    let prev_hash: Option<String> = conn
        .query_row(
            "SELECT entry_hash FROM audit_log ORDER BY entry_seq DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .sql_context("failed to read audit chain head")?;

    let details_text = serde_json::to_string(&draft.details)
        .map_err(|err| {
            EngineError::Dependency(format!("failed to serialize audit details: {err}"))
        })?;
    let payload_hash = hash_bytes(details_text.as_bytes());
    let entry_id = Ulid::new();
    let recorded_at = now_utc();
    let entry_hash = compute_entry_hash(
        entry_id,
        draft.user_id,
        draft.action,
        draft.target_table,
        &draft.target_id,
        &payload_hash,
        recorded_at,
        prev_hash.as_deref(),
    )?;

    conn.execute(
        "INSERT INTO audit_log(
            entry_id, user_id, action, target_table, target_id,
            details_json, recorded_at, payload_hash, prev_hash, entry_hash
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry_id.to_string(),
            draft.user_id.map(|id| id.to_string()),
            draft.action.as_str(),
            draft.target_table,
            draft.target_id,
            details_text,
            format_rfc3339(recorded_at)?,
            payload_hash,
            prev_hash,
            entry_hash,
        ],
    )
    .sql_context("failed to append audit entry")?;

    Ok(AuditEntry {
        entry_seq: conn.last_insert_rowid(),
        entry_id,
        user_id: draft.user_id,
        action: draft.action,
        target_table: draft.target_table.to_string(),
        target_id: draft.target_id.clone(),
        details: draft.details.clone(),
        recorded_at,
        payload_hash,
        prev_hash,
        entry_hash,
    })
}

fn authorize_in(
    conn: &Connection,
    acting: UserId,
    venue_id: Option<VenueId>,
    required: Capability,
) -> EngineResult<EffectiveRole> {
    let user = get_user_in(conn, acting)?
        .ok_or_else(|| EngineError::Forbidden(format!("unknown user {acting}")))?;
    let principal = Principal {
        user_id: user.user_id,
        role: user.role,
        is_active: user.is_active,
    };
    let membership = match venue_id {
        Some(venue_id) => membership_role(conn, acting, venue_id)?,
        None => None,
    };

    authorize(&principal, venue_id, membership, required)
}

fn membership_role(
    conn: &Connection,
    user_id: UserId,
    venue_id: VenueId,
) -> EngineResult<Option<VenueRole>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT role FROM venue_memberships WHERE user_id = ?1 AND venue_id = ?2",
            params![user_id.to_string(), venue_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .sql_context("failed to load venue membership")?;

    raw.map(|role| {
        VenueRole::parse(&role)
            .ok_or_else(|| EngineError::Storage(format!("invalid stored venue role: {role}")))
    })
    .transpose()
}

fn get_user_in(conn: &Connection, user_id: UserId) -> EngineResult<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
        params![user_id.to_string()],
        parse_user_row,
    )
    .optional()
    .sql_context("failed to load user")
}

fn load_venue(conn: &Connection, venue_id: VenueId) -> EngineResult<Venue> {
    conn.query_row(
        &format!("SELECT {VENUE_COLUMNS} FROM venues WHERE venue_id = ?1"),
        params![venue_id.to_string()],
        parse_venue_row,
    )
    .optional()
    .sql_context("failed to load venue")?
    .ok_or_else(|| EngineError::not_found("venue", venue_id))
}

fn load_event(conn: &Connection, event_id: EventId) -> EngineResult<Event> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
        params![event_id.to_string()],
        parse_event_row,
    )
    .optional()
    .sql_context("failed to load event")?
    .ok_or_else(|| EngineError::not_found("event", event_id))
}

fn load_report(conn: &Connection, report_id: ReportId) -> EngineResult<Report> {
    conn.query_row(
        &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE report_id = ?1"),
        params![report_id.to_string()],
        parse_report_row,
    )
    .optional()
    .sql_context("failed to load report")?
    .ok_or_else(|| EngineError::not_found("report", report_id))
}

fn load_registry(conn: &Connection) -> EngineResult<MetricRegistry> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {METRIC_TYPE_COLUMNS} FROM metric_types ORDER BY code ASC"
        ))
        .sql_context("failed to prepare metric type listing")?;
    let rows = stmt
        .query_map([], parse_metric_type_row)
        .sql_context("failed to list metric types")?;
    Ok(MetricRegistry::new(
        collect_rows(rows).sql_context("failed to read metric type row")?,
    ))
}

fn list_observations_in(
    conn: &Connection,
    event_id: EventId,
) -> EngineResult<Vec<MetricObservation>> {
    let mut stmt = conn
        .prepare(
            "SELECT o.observation_id, o.event_id, o.metric_type_id, o.value, o.notes, o.collected_at
             FROM metric_observations o
             JOIN metric_types t ON t.metric_type_id = o.metric_type_id
             WHERE o.event_id = ?1
             ORDER BY t.code ASC",
        )
        .sql_context("failed to prepare observation listing")?;
    let rows = stmt
        .query_map(params![event_id.to_string()], parse_observation_row)
        .sql_context("failed to list observations")?;
    collect_rows(rows).sql_context("failed to read observation row")
}

fn load_goals(conn: &Connection, venue_id: VenueId) -> EngineResult<Vec<Goal>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {GOAL_COLUMNS} FROM goals WHERE venue_id = ?1 ORDER BY goal_id ASC"
        ))
        .sql_context("failed to prepare goal listing")?;
    let rows = stmt
        .query_map(params![venue_id.to_string()], parse_goal_row)
        .sql_context("failed to list goals")?;
    collect_rows(rows).sql_context("failed to read goal row")
}

fn load_goal_observations(
    conn: &Connection,
    venue_id: VenueId,
) -> EngineResult<Vec<GoalObservation>> {
    let mut stmt = conn
        .prepare(
            "SELECT o.event_id, e.start_date, e.end_date, o.metric_type_id, o.value, o.collected_at
             FROM metric_observations o
             JOIN events e ON e.event_id = o.event_id
             WHERE e.venue_id = ?1
             ORDER BY o.observation_id ASC",
        )
        .sql_context("failed to prepare venue observation listing")?;
    let rows = stmt
        .query_map(params![venue_id.to_string()], parse_goal_observation_row)
        .sql_context("failed to list venue observations")?;
    collect_rows(rows).sql_context("failed to read venue observation row")
}

trait SqlContext<T> {
    fn sql_context(self, context: &str) -> EngineResult<T>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn sql_context(self, context: &str) -> EngineResult<T> {
        self.map_err(|err| classify_sql_error(context, &err))
    }
}

/// Uniqueness violations and lock contention are conflicts; anything else
/// is a storage failure.
fn classify_sql_error(context: &str, err: &rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(failure, _) = err {
        let conflict = matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY;
        if conflict {
            return EngineError::Conflict(format!("{context}: {err}"));
        }
    }

    EngineError::Storage(format!("{context}: {err}"))
}
