use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, ErrorCode, OptionalExtension};

use crate::models::{ArtifactFile, CoreError, CoreErrorKind, Task, TaskId, TaskStatus};
use crate::persistence::{ArtifactStore, MigrationStore, PersistenceResult, TaskStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "clipline_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Up migrations only use IF NOT EXISTS DDL, so re-running them
                // repairs a recorded version whose tables were dropped.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn load_task(&self, task_id: &TaskId) -> PersistenceResult<Option<Task>> {
        self.with_connection("load_task", |connection| {
            ensure_schema_ready(connection)?;
            let document: Option<String> = connection
                .query_row(
                    "SELECT document FROM task_records WHERE task_id = ?1",
                    [task_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            document.as_deref().map(decode_document::<Task>).transpose()
        })
    }

    fn save_task(&self, task: &Task) -> PersistenceResult<()> {
        self.with_connection("save_task", |connection| {
            ensure_schema_ready(connection)?;
            let document = encode_document(task)?;
            connection.execute(
                "
INSERT INTO task_records (
    task_id, status, stage, progress, document, created_at_unix, updated_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(task_id) DO UPDATE SET
    status = excluded.status,
    stage = excluded.stage,
    progress = excluded.progress,
    document = excluded.document,
    updated_at_unix = excluded.updated_at_unix
",
                (
                    task.task_id.as_str(),
                    task.status.as_str(),
                    task.stage.as_str(),
                    task.progress,
                    document,
                    to_unix_seconds(task.created_at)?,
                    to_unix_seconds(task.updated_at)?,
                ),
            )?;
            Ok(())
        })
    }

    fn list_tasks(&self, limit: usize) -> PersistenceResult<Vec<Task>> {
        self.with_connection("list_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT document
FROM task_records
ORDER BY created_at_unix DESC, rowid DESC
LIMIT ?1
",
            )?;
            let rows = statement.query_map([to_i64(limit)?], |row| row.get::<_, String>(0))?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(decode_document::<Task>(&row?)?);
            }
            Ok(tasks)
        })
    }

    fn list_unfinished_tasks(&self) -> PersistenceResult<Vec<Task>> {
        self.with_connection("list_unfinished_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT document
FROM task_records
WHERE status NOT IN (?1, ?2)
ORDER BY created_at_unix ASC, rowid ASC
",
            )?;
            let rows = statement.query_map(
                (
                    TaskStatus::Completed.as_str(),
                    TaskStatus::Failed.as_str(),
                ),
                |row| row.get::<_, String>(0),
            )?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(decode_document::<Task>(&row?)?);
            }
            Ok(tasks)
        })
    }
}

impl ArtifactStore for SqliteStore {
    fn load_artifact(&self, file_path: &str) -> PersistenceResult<Option<ArtifactFile>> {
        self.with_connection("load_artifact", |connection| {
            ensure_schema_ready(connection)?;
            let document: Option<String> = connection
                .query_row(
                    "SELECT document FROM artifact_files WHERE file_path = ?1",
                    [file_path],
                    |row| row.get(0),
                )
                .optional()?;
            document
                .as_deref()
                .map(decode_document::<ArtifactFile>)
                .transpose()
        })
    }

    fn save_artifact(&self, file: &ArtifactFile) -> PersistenceResult<()> {
        self.with_connection("save_artifact", |connection| {
            ensure_schema_ready(connection)?;
            let document = encode_document(file)?;
            connection.execute(
                "
INSERT INTO artifact_files (file_path, task_id, document, updated_at_unix)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(file_path) DO UPDATE SET
    task_id = excluded.task_id,
    document = excluded.document,
    updated_at_unix = excluded.updated_at_unix
",
                (
                    file.file_path.as_str(),
                    file.task_id.as_ref().map(TaskId::as_str),
                    document,
                    to_unix_seconds(file.updated_at)?,
                ),
            )?;
            Ok(())
        })
    }

    fn list_artifacts_for_task(&self, task_id: &TaskId) -> PersistenceResult<Vec<ArtifactFile>> {
        self.with_connection("list_artifacts_for_task", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT document
FROM artifact_files
WHERE task_id = ?1
ORDER BY file_path ASC
",
            )?;
            let rows = statement.query_map([task_id.as_str()], |row| row.get::<_, String>(0))?;
            let mut files = Vec::new();
            for row in rows {
                files.push(decode_document::<ArtifactFile>(&row?)?);
            }
            Ok(files)
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS clipline_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before workflow operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn encode_document<T: serde::Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value)
        .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))
}

fn decode_document<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("malformed document in sqlite record: {error}"))
    })
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => CoreError::new(
            CoreErrorKind::ConcurrencyConflict,
            format!("sqlite store '{operation}' hit a locked database: {error}"),
        ),
        _ => storage_error_text(operation, error.to_string()),
    }
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    let seconds = i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))?;
    Ok(seconds)
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
