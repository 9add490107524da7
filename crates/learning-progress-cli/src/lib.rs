//! Operator command surface for the learning progress store.
//!
//! Every command runs inside one unit of work and prints its result as pretty
//! JSON on stdout once the unit has committed. Embedders can call [`run_cli`]
//! with a parsed [`Cli`] or [`execute`] against a unit they already hold.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use learning_progress_core::{
    parse_rfc3339_utc, NewAchievement, NewCertificate, ProgressStatus, ProgressUpdate,
};
use learning_progress_store_sqlite::{SqliteProgressStore, UnitOfWork};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "lp")]
#[command(about = "Learning progress CLI")]
pub struct Cli {
    #[arg(long, default_value = "./learning_progress.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Progress {
        #[command(subcommand)]
        command: Box<ProgressCommand>,
    },
    Achievement {
        #[command(subcommand)]
        command: Box<AchievementCommand>,
    },
    Certificate {
        #[command(subcommand)]
        command: Box<CertificateCommand>,
    },
    Stats(UserArgs),
}

impl Command {
    /// True for commands that only read; they run on a read snapshot instead
    /// of taking the write lock.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        match self {
            Self::Db { .. } => false,
            Self::Progress { command } => !matches!(**command, ProgressCommand::Update(_)),
            Self::Achievement { command } => matches!(**command, AchievementCommand::List(_)),
            Self::Certificate { command } => matches!(
                **command,
                CertificateCommand::Show(_) | CertificateCommand::List(_)
            ),
            Self::Stats(_) => true,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
    Status,
}

#[derive(Debug, Subcommand)]
pub enum ProgressCommand {
    Update(ProgressUpdateArgs),
    Show(UserCourseArgs),
    List(UserOptionalCourseArgs),
    Completed(UserArgs),
    CourseStats(UserCourseArgs),
}

#[derive(Debug, Subcommand)]
pub enum AchievementCommand {
    Add(AchievementAddArgs),
    List(AchievementListArgs),
}

#[derive(Debug, Subcommand)]
pub enum CertificateCommand {
    Issue(CertificateIssueArgs),
    Generate(UserCourseArgs),
    Show(UserCourseArgs),
    List(UserOptionalCourseArgs),
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user_id: i64,
}

#[derive(Debug, Args)]
pub struct UserCourseArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    course_id: i64,
}

#[derive(Debug, Args)]
pub struct UserOptionalCourseArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    course_id: Option<i64>,
}

#[derive(Debug, Args)]
pub struct ProgressUpdateArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    course_id: i64,
    #[arg(long)]
    status: Option<StatusArg>,
    #[arg(long)]
    completion_percentage: Option<f64>,
    #[arg(long)]
    time_spent_seconds: Option<i64>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct AchievementAddArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long = "type")]
    achievement_type: String,
    #[arg(long = "name")]
    achievement_name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    metadata_json: Option<String>,
}

#[derive(Debug, Args)]
pub struct AchievementListArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long = "type")]
    achievement_type: Option<String>,
}

#[derive(Debug, Args)]
pub struct CertificateIssueArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    course_id: i64,
    #[arg(long)]
    final_score: Option<f64>,
    #[arg(long)]
    grade: Option<String>,
    #[arg(long)]
    completion_time: Option<f64>,
    #[arg(long)]
    expires_at: Option<String>,
    #[arg(long)]
    pdf_url: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    #[value(name = "not_started")]
    NotStarted,
    #[value(name = "in_progress")]
    InProgress,
    Completed,
    Abandoned,
}

/// Executes the parsed command graph against the database named by `--db`.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, when input
/// fails validation, or when the unit of work fails to commit.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteProgressStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(&command, &store),
        command => {
            store.migrate()?;
            let unit = if command.is_read_only() {
                store.begin_read()?
            } else {
                store.begin()?
            };
            let output = execute(command, &unit)?;
            unit.commit()?;
            print_json(&output)
        }
    }
}

/// Runs one data command inside `unit` and returns the JSON it would print.
/// The caller decides whether to commit.
///
/// # Errors
/// Returns an error when input parsing or the underlying store operation fails.
pub fn execute(command: Command, unit: &UnitOfWork) -> Result<Value> {
    match command {
        Command::Db { .. } => Err(anyhow::anyhow!(
            "internal dispatch error: db commands run outside a unit of work"
        )),
        Command::Progress { command } => run_progress(*command, unit),
        Command::Achievement { command } => run_achievement(*command, unit),
        Command::Certificate { command } => run_certificate(*command, unit),
        Command::Stats(args) => to_json(&unit.statistics(args.user_id)?),
    }
}

fn run_db(command: &DbCommand, store: &SqliteProgressStore) -> Result<()> {
    if matches!(command, DbCommand::Migrate) {
        store.migrate()?;
    }
    print_json(&to_json(&store.schema_status()?)?)
}

fn run_progress(command: ProgressCommand, unit: &UnitOfWork) -> Result<Value> {
    match command {
        ProgressCommand::Update(args) => {
            let update = ProgressUpdate {
                course_id: args.course_id,
                status: args.status.map(map_status),
                completion_percentage: args.completion_percentage,
                time_spent_seconds: args.time_spent_seconds,
                notes: args.notes,
            };
            to_json(&unit.upsert_progress(args.user_id, &update)?)
        }
        ProgressCommand::Show(args) => to_json(&unit.progress(args.user_id, args.course_id)?),
        ProgressCommand::List(args) => {
            to_json(&unit.progress_for_user(args.user_id, args.course_id)?)
        }
        ProgressCommand::Completed(args) => to_json(&unit.completed_course_ids(args.user_id)?),
        ProgressCommand::CourseStats(args) => {
            to_json(&unit.course_stats(args.user_id, args.course_id)?)
        }
    }
}

fn run_achievement(command: AchievementCommand, unit: &UnitOfWork) -> Result<Value> {
    match command {
        AchievementCommand::Add(args) => {
            let input = NewAchievement {
                achievement_type: args.achievement_type,
                achievement_name: args.achievement_name,
                description: args.description,
                metadata: args
                    .metadata_json
                    .as_deref()
                    .map(normalize_metadata_json)
                    .transpose()?,
            };
            to_json(&unit.record_achievement(args.user_id, &input)?)
        }
        AchievementCommand::List(args) => to_json(
            &unit.achievements(args.user_id, args.achievement_type.as_deref())?,
        ),
    }
}

fn run_certificate(command: CertificateCommand, unit: &UnitOfWork) -> Result<Value> {
    match command {
        CertificateCommand::Issue(args) => {
            let request = NewCertificate {
                course_id: args.course_id,
                final_score: args.final_score,
                grade: args.grade,
                completion_time: args.completion_time,
                expires_at: args
                    .expires_at
                    .as_deref()
                    .map(parse_rfc3339_utc)
                    .transpose()
                    .context("invalid --expires-at")?,
                pdf_url: args.pdf_url,
                notes: args.notes,
            };
            let issued = unit.issue_certificate(args.user_id, &request)?;
            if !issued.was_created() {
                tracing::info!(
                    user_id = args.user_id,
                    course_id = args.course_id,
                    "certificate already existed, request fields ignored"
                );
            }
            to_json(&issued.into_certificate())
        }
        CertificateCommand::Generate(args) => to_json(
            &unit.generate_certificate_if_eligible(args.user_id, args.course_id)?,
        ),
        CertificateCommand::Show(args) => {
            to_json(&unit.certificate(args.user_id, args.course_id)?)
        }
        CertificateCommand::List(args) => {
            to_json(&unit.certificates(args.user_id, args.course_id)?)
        }
    }
}

fn map_status(value: StatusArg) -> ProgressStatus {
    match value {
        StatusArg::NotStarted => ProgressStatus::NotStarted,
        StatusArg::InProgress => ProgressStatus::InProgress,
        StatusArg::Completed => ProgressStatus::Completed,
        StatusArg::Abandoned => ProgressStatus::Abandoned,
    }
}

/// Metadata is stored as text; reject anything that is not a JSON document.
fn normalize_metadata_json(raw: &str) -> Result<String> {
    let parsed: Value = serde_json::from_str(raw).context("--metadata-json must be valid JSON")?;
    Ok(parsed.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to encode command output")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
