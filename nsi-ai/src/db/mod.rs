//! SQLite persistence
//!
//! One database file (`nsi.db`) in the root folder. Tables are created idempotently at
//! startup; queries are plain runtime `sqlx::query` calls.

mod jobs;
mod records;
mod references;
mod results;
pub mod settings;

use nsi_common::db_retry::DEFAULT_MAX_LOCK_WAIT_MS;
use nsi_common::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (creating if needed) the database file and initialize tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Private in-memory database (single connection, so every query sees the same data)
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    const SCHEMA: [&str; 9] = [
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS source_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_table TEXT NOT NULL,
            category TEXT NOT NULL,
            raw_name TEXT NOT NULL,
            raw_code TEXT,
            created_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS reference_entries (
            ref_table TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            parent_code TEXT,
            PRIMARY KEY (ref_table, code)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS benchmarks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            code TEXT NOT NULL,
            label TEXT NOT NULL,
            approved INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE (category, normalized_name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS batch_jobs (
            job_id TEXT PRIMARY KEY,
            selector TEXT NOT NULL,
            status TEXT NOT NULL,
            total_count INTEGER NOT NULL DEFAULT 0,
            processed_count INTEGER NOT NULL DEFAULT 0,
            current_batch_id INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            manual_review_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            ended_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS job_records (
            job_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            record_id INTEGER NOT NULL,
            PRIMARY KEY (job_id, seq)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS classification_results (
            job_id TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            stage_reached TEXT NOT NULL,
            method TEXT NOT NULL,
            category_code TEXT,
            category_name TEXT,
            reference_table TEXT,
            matched_reference_id TEXT,
            confidence REAL,
            quality_level TEXT NOT NULL,
            manual_review INTEGER NOT NULL DEFAULT 0,
            provider_used TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (job_id, record_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            job_id TEXT PRIMARY KEY,
            processed_count INTEGER NOT NULL,
            total_count INTEGER NOT NULL,
            current_batch_id INTEGER NOT NULL,
            failed_count INTEGER NOT NULL DEFAULT 0,
            manual_review_count INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_results_record ON classification_results (record_id)",
    ];

    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!(
        "Database tables initialized (settings, source_records, reference_entries, benchmarks, \
         batch_jobs, job_records, classification_results, checkpoints)"
    );
    Ok(())
}

/// SQLite implementation of every repository trait
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn with_max_lock_wait(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str, column: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e| nsi_common::Error::Internal(format!("Bad {} column: {}", column, e)))
}

fn parse_uuid(value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| nsi_common::Error::Internal(format!("Bad uuid '{}': {}", value, e)))
}
