//! `sre` command surface over the `SQLite` engine store.
//!
//! Hosts that embed the engine can skip argument parsing and call
//! [`run_engine_with_db`] or [`run_engine`] directly.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sustainability_core::{
    now_utc, parse_date, parse_rfc3339_utc, EventId, EventInput, GoalPeriod, ReportId, UserId,
    UserRole, VenueId, VenueRole,
};
use sustainability_store_sqlite::{
    ArtifactStore, AuditFilter, FileArtifactStore, SqliteEngineStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

pub use config::EngineConfig;

#[derive(Debug, Parser)]
#[command(name = "sre")]
#[command(about = "Sustainability reporting engine CLI")]
pub struct Cli {
    /// Optional TOML file with engine settings.
    #[arg(long, env = "SRE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "SRE_DB", default_value = "./sustainability.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "SRE_BUSY_TIMEOUT_MS")]
    busy_timeout_ms: Option<u64>,

    #[arg(long, env = "SRE_MAX_CONFLICT_RETRIES")]
    max_conflict_retries: Option<u32>,

    /// Directory that receives rendered report artifacts.
    #[arg(long, env = "SRE_ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    #[arg(long, env = "SRE_LOG")]
    log_filter: Option<String>,

    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Resolves settings: flags and `SRE_*` variables, then `RUST_LOG` for
    /// the filter, then the config file, then defaults.
    ///
    /// # Errors
    /// Returns an error when the config file cannot be loaded or the merged
    /// settings are invalid.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };

        if let Some(value) = self.busy_timeout_ms {
            config.busy_timeout_ms = value;
        }
        if let Some(value) = self.max_conflict_retries {
            config.max_conflict_retries = value;
        }
        if let Some(dir) = &self.artifact_dir {
            config.artifact_dir = Some(dir.clone());
        }
        if let Some(filter) = &self.log_filter {
            config.log_filter.clone_from(filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            if !filter.trim().is_empty() {
                config.log_filter = filter;
            }
        }
        if self.log_json {
            config.log_json = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Applies schema migrations and seeds the metric catalog.
    Migrate,
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Venue {
        #[command(subcommand)]
        command: Box<VenueCommand>,
    },
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    MetricTypes {
        #[command(subcommand)]
        command: Box<MetricTypesCommand>,
    },
    Metric {
        #[command(subcommand)]
        command: Box<MetricCommand>,
    },
    Goal {
        #[command(subcommand)]
        command: Box<GoalCommand>,
    },
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Register(UserRegisterArgs),
    Deactivate(UserDeactivateArgs),
    Show(UserShowArgs),
}

#[derive(Debug, Args)]
pub struct UserRegisterArgs {
    #[arg(long)]
    pub email: String,

    #[arg(long)]
    pub display_name: String,

    #[arg(long, value_enum)]
    pub role: UserRoleArg,
}

#[derive(Debug, Args)]
pub struct UserDeactivateArgs {
    #[arg(long)]
    pub user_id: String,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Args)]
pub struct UserShowArgs {
    #[arg(long)]
    pub user_id: String,
}

#[derive(Debug, Subcommand)]
pub enum VenueCommand {
    Create(VenueCreateArgs),
    Grant(VenueGrantArgs),
    Show(VenueShowArgs),
}

#[derive(Debug, Args)]
pub struct VenueShowArgs {
    #[arg(long)]
    pub venue_id: String,
}

#[derive(Debug, Args)]
pub struct VenueCreateArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub contact_user_id: Option<String>,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Args)]
pub struct VenueGrantArgs {
    #[arg(long)]
    pub venue_id: String,

    #[arg(long)]
    pub user_id: String,

    #[arg(long, value_enum)]
    pub role: VenueRoleArg,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Create(EventCreateArgs),
    Show(EventShowArgs),
}

#[derive(Debug, Args)]
pub struct EventCreateArgs {
    #[arg(long)]
    pub venue_id: String,

    #[arg(long)]
    pub name: String,

    /// `YYYY-MM-DD`.
    #[arg(long)]
    pub start_date: String,

    /// `YYYY-MM-DD`.
    #[arg(long)]
    pub end_date: String,

    #[arg(long)]
    pub expected_attendees: Option<i64>,

    #[arg(long)]
    pub actual_attendees: Option<i64>,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Args)]
pub struct EventShowArgs {
    #[arg(long)]
    pub event_id: String,
}

#[derive(Debug, Subcommand)]
pub enum MetricTypesCommand {
    List,
    Deactivate(MetricTypeDeactivateArgs),
}

#[derive(Debug, Args)]
pub struct MetricTypeDeactivateArgs {
    /// Metric type code or id.
    #[arg(long)]
    pub metric_type: String,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Subcommand)]
pub enum MetricCommand {
    Ingest(MetricIngestArgs),
    List(MetricListArgs),
}

#[derive(Debug, Args)]
pub struct MetricIngestArgs {
    #[arg(long)]
    pub event_id: String,

    /// Metric type code or id.
    #[arg(long)]
    pub metric_type: String,

    #[arg(long, allow_negative_numbers = true)]
    pub value: f64,

    #[arg(long)]
    pub notes: Option<String>,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Args)]
pub struct MetricListArgs {
    #[arg(long)]
    pub event_id: String,
}

#[derive(Debug, Subcommand)]
pub enum GoalCommand {
    Set(GoalSetArgs),
    Status(GoalStatusArgs),
}

#[derive(Debug, Args)]
pub struct GoalSetArgs {
    #[arg(long)]
    pub venue_id: String,

    #[arg(long)]
    pub metric_type: String,

    #[arg(long, allow_negative_numbers = true)]
    pub target: f64,

    #[arg(long, value_enum)]
    pub period: GoalPeriodArg,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Args)]
pub struct GoalStatusArgs {
    #[arg(long)]
    pub venue_id: String,

    #[arg(long, value_enum)]
    pub period: GoalPeriodArg,

    /// RFC3339 instant; defaults to now.
    #[arg(long)]
    pub as_of: Option<String>,

    #[arg(long = "as")]
    pub acting_user: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    Generate(ReportGenerateArgs),
    Show(ReportShowArgs),
    List(ReportListArgs),
}

#[derive(Debug, Args)]
pub struct ReportGenerateArgs {
    #[arg(long)]
    pub event_id: String,

    #[arg(long = "as")]
    pub acting_user: String,
}

#[derive(Debug, Args)]
pub struct ReportShowArgs {
    #[arg(long)]
    pub report_id: String,
}

#[derive(Debug, Args)]
pub struct ReportListArgs {
    #[arg(long)]
    pub event_id: String,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    List(AuditListArgs),
    Verify,
}

#[derive(Debug, Args)]
pub struct AuditListArgs {
    #[arg(long)]
    pub target_table: Option<String>,

    #[arg(long)]
    pub target_id: Option<String>,

    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UserRoleArg {
    SuperAdmin,
    VenueAdmin,
    Staff,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VenueRoleArg {
    VenueAdmin,
    Staff,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum GoalPeriodArg {
    Year,
    Quarter,
    Event,
}

/// Installs the global tracing subscriber. Logs go to stderr so stdout
/// carries only command output.
///
/// # Errors
/// Returns an error for an unparsable filter or when a subscriber is already
/// installed.
pub fn init_tracing(config: &EngineConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter `{}`", config.log_filter))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.log_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when settings are invalid, the store cannot be opened or
/// migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = cli.engine_config()?;
    run_engine_with_db(&cli.db, &config, cli.command)
}

/// Executes a parsed command against the `SQLite` database at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_engine_with_db(db_path: &Path, config: &EngineConfig, command: Command) -> Result<()> {
    let mut store = SqliteEngineStore::open_with_options(db_path, config.store_options())?;
    store.migrate()?;
    tracing::debug!(db = %db_path.display(), "engine store ready");
    run_engine(command, &mut store, config)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument parsing, authorization, validation or
/// persistence fails.
pub fn run_engine(
    command: Command,
    store: &mut SqliteEngineStore,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        Command::Migrate => {
            store.migrate()?;
            tracing::info!("schema migrated");
            print_json(&serde_json::json!({ "migrated": true }))
        }
        Command::User { command } => run_user(*command, store),
        Command::Venue { command } => run_venue(*command, store),
        Command::Event { command } => run_event(*command, store),
        Command::MetricTypes { command } => run_metric_types(*command, store),
        Command::Metric { command } => run_metric(*command, store),
        Command::Goal { command } => run_goal(*command, store),
        Command::Report { command } => run_report(*command, store, config),
        Command::Audit { command } => run_audit(*command, store),
    }
}

fn run_user(command: UserCommand, store: &mut SqliteEngineStore) -> Result<()> {
    match command {
        UserCommand::Register(args) => {
            let user =
                store.register_user(&args.email, &args.display_name, map_user_role(args.role))?;
            print_json(&user)
        }
        UserCommand::Deactivate(args) => {
            let user = store.deactivate_user(
                parse_user_id(&args.user_id)?,
                parse_user_id(&args.acting_user)?,
            )?;
            print_json(&user)
        }
        UserCommand::Show(args) => print_json(&store.get_user(parse_user_id(&args.user_id)?)?),
    }
}

fn run_venue(command: VenueCommand, store: &mut SqliteEngineStore) -> Result<()> {
    match command {
        VenueCommand::Create(args) => {
            let contact = args
                .contact_user_id
                .as_deref()
                .map(parse_user_id)
                .transpose()?;
            let venue =
                store.create_venue(&args.name, contact, parse_user_id(&args.acting_user)?)?;
            print_json(&venue)
        }
        VenueCommand::Grant(args) => {
            let membership = store.grant_membership(
                parse_user_id(&args.user_id)?,
                parse_venue_id(&args.venue_id)?,
                map_venue_role(args.role),
                parse_user_id(&args.acting_user)?,
            )?;
            print_json(&membership)
        }
        VenueCommand::Show(args) => {
            print_json(&store.get_venue(parse_venue_id(&args.venue_id)?)?)
        }
    }
}

fn run_event(command: EventCommand, store: &mut SqliteEngineStore) -> Result<()> {
    match command {
        EventCommand::Create(args) => {
            let input = EventInput {
                venue_id: parse_venue_id(&args.venue_id)?,
                name: args.name,
                start_date: parse_date(&args.start_date)?,
                end_date: parse_date(&args.end_date)?,
                expected_attendees: args.expected_attendees,
                actual_attendees: args.actual_attendees,
            };
            let event = store.create_event(&input, parse_user_id(&args.acting_user)?)?;
            print_json(&event)
        }
        EventCommand::Show(args) => {
            let event = store.get_event(parse_event_id(&args.event_id)?)?;
            print_json(&event)
        }
    }
}

fn run_metric_types(command: MetricTypesCommand, store: &mut SqliteEngineStore) -> Result<()> {
    match command {
        MetricTypesCommand::List => print_json(&store.list_metric_types()?),
        MetricTypesCommand::Deactivate(args) => {
            let metric_type = store
                .deactivate_metric_type(&args.metric_type, parse_user_id(&args.acting_user)?)?;
            print_json(&metric_type)
        }
    }
}

fn run_metric(command: MetricCommand, store: &mut SqliteEngineStore) -> Result<()> {
    match command {
        MetricCommand::Ingest(args) => {
            let observation = store.ingest_metric(
                parse_event_id(&args.event_id)?,
                &args.metric_type,
                args.value,
                args.notes.as_deref(),
                parse_user_id(&args.acting_user)?,
            )?;
            print_json(&observation)
        }
        MetricCommand::List(args) => {
            let observations = store.list_observations_for_event(parse_event_id(&args.event_id)?)?;
            print_json(&observations)
        }
    }
}

fn run_goal(command: GoalCommand, store: &mut SqliteEngineStore) -> Result<()> {
    match command {
        GoalCommand::Set(args) => {
            let goal = store.set_goal(
                parse_venue_id(&args.venue_id)?,
                &args.metric_type,
                args.target,
                map_goal_period(args.period),
                parse_user_id(&args.acting_user)?,
            )?;
            print_json(&goal)
        }
        GoalCommand::Status(args) => {
            let as_of = match args.as_of.as_deref() {
                Some(raw) => parse_rfc3339_utc(raw)?,
                None => now_utc(),
            };
            let acting = args.acting_user.as_deref().map(parse_user_id).transpose()?;
            let evaluations = store.get_venue_goal_status(
                parse_venue_id(&args.venue_id)?,
                map_goal_period(args.period),
                as_of,
                acting,
            )?;
            print_json(&evaluations)
        }
    }
}

fn run_report(
    command: ReportCommand,
    store: &mut SqliteEngineStore,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        ReportCommand::Generate(args) => {
            let artifacts = config
                .artifact_dir
                .as_ref()
                .map(|dir| FileArtifactStore::new(dir.clone()));
            let generated = store.generate_report(
                parse_event_id(&args.event_id)?,
                parse_user_id(&args.acting_user)?,
                artifacts.as_ref().map(|files| files as &dyn ArtifactStore),
            )?;
            if let Some(err) = &generated.artifact_error {
                tracing::warn!(
                    report_id = %generated.report.report_id,
                    error = %err,
                    "report artifact was not attached"
                );
            }
            print_json(&generated)
        }
        ReportCommand::Show(args) => {
            let report = store.get_report(parse_report_id(&args.report_id)?)?;
            print_json(&report)
        }
        ReportCommand::List(args) => {
            let reports = store.list_reports_for_event(parse_event_id(&args.event_id)?)?;
            print_json(&reports)
        }
    }
}

fn run_audit(command: AuditCommand, store: &mut SqliteEngineStore) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let entries = store.list_audit_entries(&AuditFilter {
                target_table: args.target_table,
                target_id: args.target_id,
                limit: args.limit,
            })?;
            print_json(&entries)
        }
        AuditCommand::Verify => {
            let report = store.verify_audit_chain()?;
            print_json(&report)?;
            if report.chain_valid {
                Ok(())
            } else {
                Err(anyhow!(
                    "audit chain broken at entry_seq {}",
                    report
                        .first_broken_seq
                        .map_or_else(|| "unknown".to_string(), |seq| seq.to_string())
                ))
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    UserId::parse(raw).with_context(|| format!("invalid user id `{raw}`"))
}

fn parse_venue_id(raw: &str) -> Result<VenueId> {
    VenueId::parse(raw).with_context(|| format!("invalid venue id `{raw}`"))
}

fn parse_event_id(raw: &str) -> Result<EventId> {
    EventId::parse(raw).with_context(|| format!("invalid event id `{raw}`"))
}

fn parse_report_id(raw: &str) -> Result<ReportId> {
    ReportId::parse(raw).with_context(|| format!("invalid report id `{raw}`"))
}

fn map_user_role(value: UserRoleArg) -> UserRole {
    match value {
        UserRoleArg::SuperAdmin => UserRole::SuperAdmin,
        UserRoleArg::VenueAdmin => UserRole::VenueAdmin,
        UserRoleArg::Staff => UserRole::Staff,
    }
}

fn map_venue_role(value: VenueRoleArg) -> VenueRole {
    match value {
        VenueRoleArg::VenueAdmin => VenueRole::VenueAdmin,
        VenueRoleArg::Staff => VenueRole::Staff,
    }
}

fn map_goal_period(value: GoalPeriodArg) -> GoalPeriod {
    match value {
        GoalPeriodArg::Year => GoalPeriod::Year,
        GoalPeriodArg::Quarter => GoalPeriod::Quarter,
        GoalPeriodArg::Event => GoalPeriod::Event,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use sustainability_core::{
        now_utc, parse_date, EngineError, ErrorClass, Event, EventInput, GoalPeriod, GoalStatus,
        ReportStatus, User, UserRole, Venue, VenueRole,
    };
    use sustainability_store_sqlite::SqliteEngineStore;
    use ulid::Ulid;

    use super::*;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_path(label: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sre-cli-{label}-{}.{extension}", Ulid::new()))
    }

    fn path_str(path: &Path) -> String {
        match path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp path must be valid UTF-8"),
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn cli_args(db: &Path, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["sre".to_string(), "--db".to_string(), path_str(db)];
        args.extend(rest.iter().map(|value| (*value).to_string()));
        args
    }

    struct Seeded {
        admin: User,
        staff: User,
        venue: Venue,
        event: Event,
    }

    fn seed(db: &Path) -> Seeded {
        let mut store = must(SqliteEngineStore::open(db));
        must(store.migrate());
        let admin = must(store.register_user("admin@example.org", "Admin", UserRole::SuperAdmin));
        let staff = must(store.register_user("staff@example.org", "Staff", UserRole::Staff));
        let venue = must(store.create_venue("Harbour Hall", None, admin.user_id));
        must(store.grant_membership(
            staff.user_id,
            venue.venue_id,
            VenueRole::Staff,
            admin.user_id,
        ));
        let event = must(store.create_event(
            &EventInput {
                venue_id: venue.venue_id,
                name: "Spring Expo".to_string(),
                start_date: must(parse_date("2025-03-01")),
                end_date: must(parse_date("2025-03-02")),
                expected_attendees: Some(1_000),
                actual_attendees: Some(900),
            },
            admin.user_id,
        ));
        Seeded {
            admin,
            staff,
            venue,
            event,
        }
    }

    fn engine_class(err: &anyhow::Error) -> Option<ErrorClass> {
        err.downcast_ref::<EngineError>().map(EngineError::class)
    }

    #[test]
    fn goal_set_arguments_parse_into_domain_values() {
        let cli = must(Cli::try_parse_from([
            "sre",
            "goal",
            "set",
            "--venue-id",
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            "--metric-type",
            "electricity",
            "--target",
            "1500",
            "--period",
            "event",
            "--as",
            "01J0SQQP7M70P6Y3R4T8D8G8M3",
        ]));

        match cli.command {
            Command::Goal { command } => match *command {
                GoalCommand::Set(args) => {
                    assert_eq!(args.metric_type, "electricity");
                    assert!((args.target - 1500.0).abs() < f64::EPSILON);
                    assert_eq!(map_goal_period(args.period), GoalPeriod::Event);
                }
                GoalCommand::Status(_) => panic!("expected goal set"),
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn role_arguments_use_kebab_case_names() {
        let cli = must(Cli::try_parse_from([
            "sre",
            "user",
            "register",
            "--email",
            "a@example.org",
            "--display-name",
            "A",
            "--role",
            "super-admin",
        ]));
        match cli.command {
            Command::User { command } => match *command {
                UserCommand::Register(args) => {
                    assert_eq!(map_user_role(args.role), UserRole::SuperAdmin);
                }
                UserCommand::Deactivate(_) | UserCommand::Show(_) => {
                    panic!("expected user register")
                }
            },
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "sre",
            "user",
            "register",
            "--email",
            "a@example.org",
            "--display-name",
            "A",
            "--role",
            "owner",
        ])
        .is_err());
    }

    #[test]
    fn ingest_and_goal_commands_reach_the_store() {
        let db = temp_path("ingest", "sqlite3");
        let seeded = seed(&db);
        let event_id = seeded.event.event_id.to_string();
        let venue_id = seeded.venue.venue_id.to_string();
        let staff_id = seeded.staff.user_id.to_string();
        let admin_id = seeded.admin.user_id.to_string();

        must(execute_cli(cli_args(
            &db,
            &[
                "metric",
                "ingest",
                "--event-id",
                &event_id,
                "--metric-type",
                "electricity",
                "--value",
                "1800",
                "--notes",
                "main meter",
                "--as",
                &staff_id,
            ],
        )));
        must(execute_cli(cli_args(
            &db,
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
        )));

        let mut store = must(SqliteEngineStore::open(&db));
        let observations = must(store.list_observations_for_event(seeded.event.event_id));
        assert_eq!(observations.len(), 1);
        assert!((observations[0].value - 1800.0).abs() < f64::EPSILON);
        assert_eq!(observations[0].notes.as_deref(), Some("main meter"));

        let status = must(store.get_venue_goal_status(
            seeded.venue.venue_id,
            GoalPeriod::Event,
            now_utc(),
            None,
        ));
        assert_eq!(status.len(), 1);
        assert!((status[0].variance - 300.0).abs() < 1e-9);
        assert_eq!(status[0].status, GoalStatus::OffTarget);

        let _ = fs::remove_file(&db);
    }

    #[test]
    fn staff_goal_set_surfaces_forbidden() {
        let db = temp_path("forbidden", "sqlite3");
        let seeded = seed(&db);
        let venue_id = seeded.venue.venue_id.to_string();
        let staff_id = seeded.staff.user_id.to_string();

        let err = match execute_cli(cli_args(
            &db,
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
                "year",
                "--as",
                &staff_id,
            ],
        )) {
            Ok(()) => panic!("staff must not set goals"),
            Err(err) => err,
        };
        assert_eq!(engine_class(&err), Some(ErrorClass::Forbidden));

        let err = match execute_cli(cli_args(
            &db,
            &[
                "metric",
                "ingest",
                "--event-id",
                &seeded.event.event_id.to_string(),
                "--metric-type",
                "water_usage",
                "--value",
                "-4",
                "--as",
                &staff_id,
            ],
        )) {
            Ok(()) => panic!("negative values must be rejected"),
            Err(err) => err,
        };
        assert_eq!(engine_class(&err), Some(ErrorClass::Validation));

        let _ = fs::remove_file(&db);
    }

    #[test]
    fn malformed_identifiers_fail_before_touching_the_store() {
        let db = temp_path("bad-id", "sqlite3");
        let result = execute_cli(cli_args(
            &db,
            &["event", "show", "--event-id", "not-a-ulid"],
        ));
        assert!(result.is_err());
        let _ = fs::remove_file(&db);
    }

    #[test]
    fn config_file_is_merged_under_flags() {
        let config_path = temp_path("config", "toml");
        must(fs::write(
            &config_path,
            "busy_timeout_ms = 250\nmax_conflict_retries = 9\nlog_filter = \"debug\"\n",
        ));

        let cli = must(Cli::try_parse_from([
            "sre".to_string(),
            "--config".to_string(),
            path_str(&config_path),
            "--max-conflict-retries".to_string(),
            "1".to_string(),
            "--log-filter".to_string(),
            "warn".to_string(),
            "migrate".to_string(),
        ]));
        let config = must(cli.engine_config());
        assert_eq!(config.busy_timeout_ms, 250);
        assert_eq!(config.max_conflict_retries, 1);
        assert_eq!(config.log_filter, "warn");

        let _ = fs::remove_file(&config_path);
    }

    #[test]
    fn zero_busy_timeout_flag_is_rejected() {
        let cli = must(Cli::try_parse_from([
            "sre",
            "--busy-timeout-ms",
            "0",
            "migrate",
        ]));
        assert!(cli.engine_config().is_err());
    }

    #[test]
    fn stable_embed_api_generates_report_with_artifact() {
        let db = temp_path("embed", "sqlite3");
        let artifact_dir = temp_path("artifacts", "d");
        let seeded = seed(&db);
        let config = EngineConfig {
            artifact_dir: Some(artifact_dir.clone()),
            ..EngineConfig::default()
        };

        must(run_engine_with_db(
            &db,
            &config,
            Command::Metric {
                command: Box::new(MetricCommand::Ingest(MetricIngestArgs {
                    event_id: seeded.event.event_id.to_string(),
                    metric_type: "general_waste".to_string(),
                    value: 120.0,
                    notes: None,
                    acting_user: seeded.staff.user_id.to_string(),
                })),
            },
        ));

        let mut store = must(SqliteEngineStore::open_with_options(
            &db,
            config.store_options(),
        ));
        must(store.migrate());
        must(run_engine(
            Command::Report {
                command: Box::new(ReportCommand::Generate(ReportGenerateArgs {
                    event_id: seeded.event.event_id.to_string(),
                    acting_user: seeded.staff.user_id.to_string(),
                })),
            },
            &mut store,
            &config,
        ));

        let reports = must(store.list_reports_for_event(seeded.event.event_id));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ReportStatus::Complete);
        let url = match reports[0].report_url.as_deref() {
            Some(value) => value.to_string(),
            None => panic!("artifact url must be attached"),
        };
        assert!(url.starts_with("file://"));
        assert!(artifact_dir
            .join(format!("{}.json", reports[0].report_id))
            .exists());

        must(run_engine(
            Command::Audit {
                command: Box::new(AuditCommand::Verify),
            },
            &mut store,
            &config,
        ));

        let _ = fs::remove_dir_all(&artifact_dir);
        let _ = fs::remove_file(&db);
    }
}
