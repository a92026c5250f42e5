#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_workflow_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_records (
    task_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    stage TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    document TEXT NOT NULL,
    created_at_unix INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS artifact_files (
    file_path TEXT PRIMARY KEY,
    task_id TEXT,
    document TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS artifact_files;
DROP TABLE IF EXISTS task_records;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_status_and_owner_indexes",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_task_records_status_created
    ON task_records (status, created_at_unix);

CREATE INDEX IF NOT EXISTS idx_task_records_created
    ON task_records (created_at_unix DESC);

CREATE INDEX IF NOT EXISTS idx_artifact_files_task
    ON artifact_files (task_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_artifact_files_task;
DROP INDEX IF EXISTS idx_task_records_created;
DROP INDEX IF EXISTS idx_task_records_status_created;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
