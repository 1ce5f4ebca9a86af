//! SQLite-backed [`Repository`] implementation.
//!
//! Timestamps are stored as Unix milliseconds so the detector's mtime
//! tolerance survives a round trip. Metadata, per-source stats, and the
//! list of processed sources are stored as JSON text columns.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{FileRecord, FileStatus, SourceStats, SyncMode, SyncRun};
use crate::repository::Repository;

/// SQLite implementation of the [`Repository`] trait.
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let status: String = row.try_get("status")?;
    let metadata_json: String = row.try_get("source_metadata_json")?;
    let size: i64 = row.try_get("size")?;
    let created: Option<i64> = row.try_get("source_created_at")?;
    let modified: Option<i64> = row.try_get("source_modified_at")?;

    Ok(FileRecord {
        knowledge_base: row.try_get("knowledge_base")?,
        source_id: row.try_get("source_id")?,
        original_uri: row.try_get("original_uri")?,
        file_hash: row.try_get("file_hash")?,
        identity: row.try_get("identity")?,
        sink_location: row.try_get("sink_location")?,
        status: status.parse()?,
        size: size.max(0) as u64,
        source_created_at: created.map(from_millis),
        source_modified_at: modified.map(from_millis),
        error_message: row.try_get("error_message")?,
        source_metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn run_from_row(row: &SqliteRow) -> Result<SyncRun> {
    let mode: String = row.try_get("mode")?;
    let status: String = row.try_get("status")?;
    let end_time: Option<i64> = row.try_get("end_time")?;
    let sources_json: String = row.try_get("sources_processed_json")?;
    let stats_json: String = row.try_get("per_source_stats_json")?;
    let errors_json: String = row.try_get("source_errors_json")?;

    let count = |col: &str| -> Result<u64> {
        let v: i64 = row.try_get(col)?;
        Ok(v.max(0) as u64)
    };

    Ok(SyncRun {
        id: row.try_get("id")?,
        knowledge_base: row.try_get("knowledge_base")?,
        mode: mode.parse()?,
        status: status.parse()?,
        start_time: from_millis(row.try_get("start_time")?),
        end_time: end_time.map(from_millis),
        totals: SourceStats {
            processed: count("processed")?,
            new: count("new_count")?,
            modified: count("modified_count")?,
            unchanged: count("unchanged_count")?,
            deleted: count("deleted_count")?,
            errors: count("error_count")?,
        },
        error_message: row.try_get("error_message")?,
        sources_processed: serde_json::from_str(&sources_json)?,
        per_source_stats: serde_json::from_str(&stats_json)?,
        source_errors: serde_json::from_str(&errors_json)?,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn prior_file_records(
        &self,
        knowledge_base: &str,
        source_id: Option<&str>,
    ) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM file_records
            WHERE knowledge_base = ? AND (? IS NULL OR source_id = ?)
            ORDER BY source_id, original_uri
            "#,
        )
        .bind(knowledge_base)
        .bind(source_id)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn upsert_file_record(&self, record: &FileRecord) -> Result<()> {
        let metadata_json = serde_json::to_string(&record.source_metadata)?;

        sqlx::query(
            r#"
            INSERT INTO file_records (knowledge_base, source_id, original_uri, file_hash,
                                      identity, sink_location, status, size,
                                      source_created_at, source_modified_at, error_message,
                                      source_metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(knowledge_base, source_id, original_uri) DO UPDATE SET
                file_hash = excluded.file_hash,
                identity = CASE WHEN file_records.identity = ''
                                THEN excluded.identity ELSE file_records.identity END,
                sink_location = CASE
                    WHEN file_records.sink_location = '' THEN excluded.sink_location
                    WHEN (file_records.status = 'deleted' OR file_records.file_hash = '')
                         AND excluded.sink_location <> '' THEN excluded.sink_location
                    ELSE file_records.sink_location END,
                status = excluded.status,
                size = excluded.size,
                source_created_at = excluded.source_created_at,
                source_modified_at = excluded.source_modified_at,
                error_message = excluded.error_message,
                source_metadata_json = excluded.source_metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.knowledge_base)
        .bind(&record.source_id)
        .bind(&record.original_uri)
        .bind(&record.file_hash)
        .bind(&record.identity)
        .bind(&record.sink_location)
        .bind(record.status.as_str())
        .bind(record.size as i64)
        .bind(record.source_created_at.map(to_millis))
        .bind(record.source_modified_at.map(to_millis))
        .bind(&record.error_message)
        .bind(&metadata_json)
        .bind(to_millis(record.created_at))
        .bind(to_millis(record.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_sync_run(
        &self,
        knowledge_base: &str,
        mode: SyncMode,
        start_time: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO sync_runs (knowledge_base, mode, status, start_time) VALUES (?, ?, 'running', ?)",
        )
        .bind(knowledge_base)
        .bind(mode.as_str())
        .bind(to_millis(start_time))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn finalize_sync_run(&self, run: &SyncRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs SET
                status = ?,
                end_time = ?,
                processed = ?,
                new_count = ?,
                modified_count = ?,
                unchanged_count = ?,
                deleted_count = ?,
                error_count = ?,
                error_message = ?,
                sources_processed_json = ?,
                per_source_stats_json = ?,
                source_errors_json = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.end_time.map(to_millis))
        .bind(run.totals.processed as i64)
        .bind(run.totals.new as i64)
        .bind(run.totals.modified as i64)
        .bind(run.totals.unchanged as i64)
        .bind(run.totals.deleted as i64)
        .bind(run.totals.errors as i64)
        .bind(&run.error_message)
        .bind(serde_json::to_string(&run.sources_processed)?)
        .bind(serde_json::to_string(&run.per_source_stats)?)
        .bind(serde_json::to_string(&run.source_errors)?)
        .bind(run.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("sync run {} does not exist or is already finalized", run.id);
        }
        Ok(())
    }

    async fn list_sync_runs(&self, knowledge_base: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_runs WHERE knowledge_base = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(knowledge_base)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }

    async fn list_error_records(&self, knowledge_base: &str) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM file_records
            WHERE knowledge_base = ? AND status = ?
            ORDER BY source_id, original_uri
            "#,
        )
        .bind(knowledge_base)
        .bind(FileStatus::Error.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}
