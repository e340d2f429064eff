pub(crate) const ENGINE_MIGRATION_VERSION: i64 = 1;

pub(crate) const SCHEMA_ENGINE_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  display_name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('super_admin', 'venue_admin', 'staff')),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_users_no_delete
BEFORE DELETE ON users
BEGIN
  SELECT RAISE(FAIL, 'users are deactivated, never deleted');
END;

CREATE TABLE IF NOT EXISTS venues (
  venue_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  contact_user_id TEXT REFERENCES users(user_id) ON DELETE SET NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS venue_memberships (
  user_id TEXT NOT NULL REFERENCES users(user_id),
  venue_id TEXT NOT NULL REFERENCES venues(venue_id) ON DELETE CASCADE,
  role TEXT NOT NULL CHECK (role IN ('venue_admin', 'staff')),
  granted_at TEXT NOT NULL,
  PRIMARY KEY (user_id, venue_id)
);

CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  venue_id TEXT NOT NULL REFERENCES venues(venue_id),
  name TEXT NOT NULL,
  start_date TEXT NOT NULL,
  end_date TEXT NOT NULL,
  expected_attendees INTEGER CHECK (expected_attendees >= 0 OR expected_attendees IS NULL),
  actual_attendees INTEGER CHECK (actual_attendees >= 0 OR actual_attendees IS NULL),
  created_at TEXT NOT NULL,
  CHECK (start_date <= end_date)
);

CREATE INDEX IF NOT EXISTS idx_events_venue_start
  ON events(venue_id, start_date);

CREATE TABLE IF NOT EXISTS metric_types (
  metric_type_id TEXT PRIMARY KEY,
  code TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  category TEXT NOT NULL CHECK (
    category IN ('energy', 'water', 'waste', 'recycling', 'transportation', 'emissions')
  ),
  unit TEXT NOT NULL CHECK (unit IN ('kwh', 'liters', 'kg', 'percent', 'km', 'kg_co2e')),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1))
);

CREATE TRIGGER IF NOT EXISTS trg_metric_types_immutable
BEFORE UPDATE ON metric_types
WHEN NEW.metric_type_id IS NOT OLD.metric_type_id
  OR NEW.code IS NOT OLD.code
  OR NEW.name IS NOT OLD.name
  OR NEW.category IS NOT OLD.category
  OR NEW.unit IS NOT OLD.unit
  OR (OLD.is_active = 0 AND NEW.is_active = 1)
BEGIN
  SELECT RAISE(FAIL, 'metric_types entries are immutable; only deactivation is allowed');
END;

CREATE TRIGGER IF NOT EXISTS trg_metric_types_no_delete
BEFORE DELETE ON metric_types
BEGIN
  SELECT RAISE(FAIL, 'metric_types entries are retained for history');
END;

CREATE TABLE IF NOT EXISTS metric_observations (
  observation_id TEXT PRIMARY KEY,
  event_id TEXT NOT NULL REFERENCES events(event_id),
  metric_type_id TEXT NOT NULL REFERENCES metric_types(metric_type_id),
  value REAL NOT NULL CHECK (value >= 0),
  notes TEXT,
  collected_at TEXT NOT NULL,
  UNIQUE (event_id, metric_type_id)
);

CREATE TABLE IF NOT EXISTS goals (
  goal_id TEXT PRIMARY KEY,
  venue_id TEXT NOT NULL REFERENCES venues(venue_id),
  metric_type_id TEXT NOT NULL REFERENCES metric_types(metric_type_id),
  period TEXT NOT NULL CHECK (period IN ('year', 'quarter', 'event')),
  target_value REAL NOT NULL CHECK (target_value >= 0),
  updated_at TEXT NOT NULL,
  UNIQUE (venue_id, metric_type_id, period)
);

CREATE TABLE IF NOT EXISTS reports (
  report_id TEXT PRIMARY KEY,
  event_id TEXT NOT NULL REFERENCES events(event_id),
  status TEXT NOT NULL CHECK (status IN ('draft', 'complete', 'error')),
  summary_json TEXT,
  error_message TEXT,
  report_url TEXT,
  generated_by TEXT,
  created_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_reports_event_created
  ON reports(event_id, created_at);

CREATE TRIGGER IF NOT EXISTS trg_reports_draft_transitions
BEFORE UPDATE ON reports
WHEN OLD.status = 'draft' AND NEW.status NOT IN ('complete', 'error')
BEGIN
  SELECT RAISE(FAIL, 'draft reports may only move to complete or error');
END;

CREATE TRIGGER IF NOT EXISTS trg_reports_terminal_immutable
BEFORE UPDATE ON reports
WHEN OLD.status IN ('complete', 'error') AND NOT (
  OLD.status = 'complete'
  AND OLD.report_url IS NULL
  AND NEW.report_url IS NOT NULL
  AND NEW.report_id IS OLD.report_id
  AND NEW.event_id IS OLD.event_id
  AND NEW.status IS OLD.status
  AND NEW.summary_json IS OLD.summary_json
  AND NEW.error_message IS OLD.error_message
  AND NEW.generated_by IS OLD.generated_by
  AND NEW.created_at IS OLD.created_at
  AND NEW.completed_at IS OLD.completed_at
)
BEGIN
  SELECT RAISE(FAIL, 'reports are immutable once complete or error');
END;

CREATE TRIGGER IF NOT EXISTS trg_reports_no_delete
BEFORE DELETE ON reports
BEGIN
  SELECT RAISE(FAIL, 'reports are immutable history');
END;

CREATE TABLE IF NOT EXISTS audit_log (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  user_id TEXT,
  action TEXT NOT NULL CHECK (
    action IN (
      'metric_upsert',
      'goal_set',
      'report_generate',
      'report_attach_artifact',
      'metric_type_deactivate',
      'user_register',
      'user_deactivate',
      'venue_create',
      'membership_grant',
      'event_create',
      'access_denied'
    )
  ),
  target_table TEXT NOT NULL,
  target_id TEXT NOT NULL,
  details_json TEXT NOT NULL DEFAULT '{}',
  recorded_at TEXT NOT NULL,
  payload_hash TEXT NOT NULL,
  prev_hash TEXT,
  entry_hash TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
  SELECT RAISE(FAIL, 'audit_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_audit_log_target_seq
  ON audit_log(target_table, target_id, entry_seq);
";
