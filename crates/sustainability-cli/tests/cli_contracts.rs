#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

fn sre_command() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_sre"));
    for var in [
        "SRE_CONFIG",
        "SRE_DB",
        "SRE_BUSY_TIMEOUT_MS",
        "SRE_MAX_CONFLICT_RETRIES",
        "SRE_ARTIFACT_DIR",
        "SRE_LOG",
    ] {
        command.env_remove(var);
    }
    command.env("RUST_LOG", "warn");
    command
}

fn sre_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = sre_command();
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sre command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn succeed(db_path: &Path, args: &[&str]) -> Value {
    let output = sre_output(db_path, args);
    assert!(
        output.status.success(),
        "command {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn string_field(value: &Value, key: &str) -> String {
    match value.get(key).and_then(Value::as_str) {
        Some(field) => field.to_string(),
        None => panic!("missing string field `{key}` in {value}"),
    }
}

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("sre-cli-contract-{}.sqlite3", Ulid::new()))
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match sre_command().arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "migrate",
        "user",
        "venue",
        "event",
        "metric-types",
        "metric",
        "goal",
        "report",
        "audit",
    ] {
        assert!(
            stdout.contains(required),
            "missing subcommand `{required}` in help output:\n{stdout}"
        );
    }
}

#[test]
fn migrate_reports_success_and_lists_seeded_catalog() {
    let db_path = temp_db();

    let migrated = succeed(&db_path, &["migrate"]);
    assert_eq!(migrated["migrated"], Value::Bool(true));

    let types = succeed(&db_path, &["metric-types", "list"]);
    let codes: Vec<&str> = match types.as_array() {
        Some(rows) => rows
            .iter()
            .filter_map(|row| row.get("code").and_then(Value::as_str))
            .collect(),
        None => panic!("metric-types list must return an array"),
    };
    assert_eq!(codes.len(), 9);
    assert!(codes.contains(&"electricity"));
    assert!(codes.contains(&"recycling_rate"));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn venue_lifecycle_contract_end_to_end() {
    let db_path = temp_db();

    let admin = succeed(
        &db_path,
        &[
            "user",
            "register",
            "--email",
            "Admin@Example.org",
            "--display-name",
            "Venue Admin",
            "--role",
            "super-admin",
        ],
    );
    assert_eq!(admin["email"], Value::String("admin@example.org".to_string()));
    let admin_id = string_field(&admin, "user_id");

    let staff = succeed(
        &db_path,
        &[
            "user",
            "register",
            "--email",
            "floor@example.org",
            "--display-name",
            "Floor Staff",
            "--role",
            "staff",
        ],
    );
    let staff_id = string_field(&staff, "user_id");

    let venue = succeed(
        &db_path,
        &["venue", "create", "--name", "Harbour Hall", "--as", &admin_id],
    );
    let venue_id = string_field(&venue, "venue_id");

    let shown_venue = succeed(&db_path, &["venue", "show", "--venue-id", &venue_id]);
    assert_eq!(shown_venue["name"], Value::String("Harbour Hall".to_string()));
    let shown_staff = succeed(&db_path, &["user", "show", "--user-id", &staff_id]);
    assert_eq!(shown_staff["role"], Value::String("staff".to_string()));
    assert_eq!(shown_staff["is_active"], Value::Bool(true));

    succeed(
        &db_path,
        &[
            "venue", "grant", "--venue-id", &venue_id, "--user-id", &staff_id, "--role", "staff",
            "--as", &admin_id,
        ],
    );

    let event = succeed(
        &db_path,
        &[
            "event",
            "create",
            "--venue-id",
            &venue_id,
            "--name",
            "Spring Expo",
            "--start-date",
            "2025-03-01",
            "--end-date",
            "2025-03-02",
            "--actual-attendees",
            "900",
            "--as",
            &admin_id,
        ],
    );
    let event_id = string_field(&event, "event_id");

    let observation = succeed(
        &db_path,
        &[
            "metric",
            "ingest",
            "--event-id",
            &event_id,
            "--metric-type",
            "electricity",
            "--value",
            "1800",
            "--as",
            &staff_id,
        ],
    );
    assert_eq!(observation["value"].as_f64(), Some(1800.0));

    let denied = sre_output(
        &db_path,
        &[
            "goal",
            "set",
            "--venue-id",
            &venue_id,
            "--metric-type",
            "electricity",
            "--target",
            "1500",
            "--period",
            "event",
            "--as",
            &staff_id,
        ],
    );
    assert!(!denied.status.success());
    assert!(denied.stdout.is_empty());
    assert!(String::from_utf8_lossy(&denied.stderr).contains("forbidden"));

    let goal = succeed(
        &db_path,
        &[
            "goal",
            "set",
            "--venue-id",
            &venue_id,
            "--metric-type",
            "electricity",
            "--target",
            "1500",
            "--period",
            "event",
            "--as",
            &admin_id,
        ],
    );
    assert_eq!(goal["target_value"].as_f64(), Some(1500.0));

    let status = succeed(
        &db_path,
        &[
            "goal", "status", "--venue-id", &venue_id, "--period", "event", "--as", &staff_id,
        ],
    );
    assert_eq!(status[0]["variance"].as_f64(), Some(300.0));
    assert_eq!(status[0]["status"], Value::String("off_target".to_string()));

    let generated = succeed(
        &db_path,
        &["report", "generate", "--event-id", &event_id, "--as", &staff_id],
    );
    assert_eq!(
        generated["report"]["status"],
        Value::String("complete".to_string())
    );
    let line = &generated["report"]["summary"]["metrics"][0];
    assert_eq!(line["code"], Value::String("electricity".to_string()));
    assert_eq!(line["per_attendee"].as_f64(), Some(2.0));
    assert_eq!(line["goal_status"], Value::String("off_target".to_string()));

    let reports = succeed(&db_path, &["report", "list", "--event-id", &event_id]);
    assert_eq!(reports.as_array().map(Vec::len), Some(1));

    let chain = succeed(&db_path, &["audit", "verify"]);
    assert_eq!(chain["chain_valid"], Value::Bool(true));

    let audit_actions = |args: &[&str]| -> Vec<String> {
        let rows = succeed(&db_path, args);
        match rows.as_array() {
            Some(rows) => rows
                .iter()
                .filter_map(|row| row.get("action").and_then(Value::as_str))
                .map(str::to_string)
                .collect(),
            None => panic!("audit list must return an array"),
        }
    };
    let venue_actions = audit_actions(&[
        "audit",
        "list",
        "--target-table",
        "venues",
        "--target-id",
        &venue_id,
    ]);
    assert!(venue_actions.iter().any(|action| action == "access_denied"));
    let goal_actions = audit_actions(&["audit", "list", "--target-table", "goals"]);
    assert_eq!(goal_actions, vec!["goal_set".to_string()]);

    let _ = std::fs::remove_file(&db_path);
}
