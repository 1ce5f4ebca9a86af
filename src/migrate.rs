use anyhow::Result;
use sqlx::SqlitePool;

/// Create the file-record and sync-run tables. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_records (
            knowledge_base TEXT NOT NULL,
            source_id TEXT NOT NULL,
            original_uri TEXT NOT NULL,
            file_hash TEXT NOT NULL DEFAULT '',
            identity TEXT NOT NULL DEFAULT '',
            sink_location TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            source_created_at INTEGER,
            source_modified_at INTEGER,
            error_message TEXT,
            source_metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (knowledge_base, source_id, original_uri)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            knowledge_base TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            processed INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            modified_count INTEGER NOT NULL DEFAULT 0,
            unchanged_count INTEGER NOT NULL DEFAULT 0,
            deleted_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            sources_processed_json TEXT NOT NULL DEFAULT '[]',
            per_source_stats_json TEXT NOT NULL DEFAULT '{}',
            source_errors_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_records_status ON file_records(knowledge_base, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_runs_kb ON sync_runs(knowledge_base, start_time DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
