//! `clipline` - pull interface over the workflow store.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clipline_core::config::RuntimeConfig;
use clipline_core::logging::init_tracing;
use clipline_core::models::{CoreError, TaskId};
use clipline_core::persistence::{ArtifactStore, MigrationStore, TaskStore};
use clipline_core::sqlite::SqliteStore;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "clipline", version, about = "Inspect clipline workflow state")]
struct Cli {
    /// SQLite database (defaults to CLIPLINE_DB_PATH, then clipline.sqlite3)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the database schema
    Migrate,
    /// List task summaries, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the client-facing summary of a task
    Status { task_id: String },
    /// Print the full task record
    Show { task_id: String },
    /// Print an artifact file with its sub-tasks
    Artifact { path: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();
    init_tracing(&config.log_filter);

    let store = SqliteStore::new(cli.db.unwrap_or(config.database_path));
    match run(&store, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::debug!(kind = ?error.kind, "command failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(store: &SqliteStore, command: Command) -> Result<(), CoreError> {
    match command {
        Command::Migrate => {
            let from = store.current_version()?;
            store.migrate_to_latest()?;
            let to = store.current_version()?;
            tracing::info!(
                database = %store.database_path().display(),
                from,
                to,
                "schema migrated"
            );
            println!("schema version {to}");
            Ok(())
        }
        Command::List { limit } => {
            let summaries: Vec<_> = store
                .list_tasks(limit)?
                .iter()
                .map(|task| task.summary())
                .collect();
            print_json(&summaries)
        }
        Command::Status { task_id } => {
            let task_id = TaskId::from(task_id.as_str());
            let task = store
                .load_task(&task_id)?
                .ok_or_else(|| CoreError::task_not_found(&task_id))?;
            print_json(&task.summary())
        }
        Command::Show { task_id } => {
            let task_id = TaskId::from(task_id.as_str());
            let task = store
                .load_task(&task_id)?
                .ok_or_else(|| CoreError::task_not_found(&task_id))?;
            print_json(&task)
        }
        Command::Artifact { path } => {
            let file = store
                .load_artifact(&path)?
                .ok_or_else(|| CoreError::artifact_not_found(&path))?;
            print_json(&file)
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<(), CoreError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|error| CoreError::internal(format!("failed to render JSON: {error}")))?;
    println!("{rendered}");
    Ok(())
}
