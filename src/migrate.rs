use anyhow::Result;
use sqlx::SqlitePool;

/// Create the run-log schema. Safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per run; counts are denormalized for cheap listing.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id TEXT PRIMARY KEY,
            class TEXT NOT NULL,
            trigger TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            outcome TEXT NOT NULL,
            window_start INTEGER,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            fetched INTEGER NOT NULL DEFAULT 0,
            upserted INTEGER NOT NULL DEFAULT 0,
            would_upsert INTEGER NOT NULL DEFAULT 0,
            skipped_unchanged INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            outcomes_json TEXT NOT NULL DEFAULT '[]',
            listing_errors_json TEXT NOT NULL DEFAULT '[]',
            abort_reason TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            class TEXT PRIMARY KEY,
            checkpoint_at INTEGER NOT NULL,
            run_id TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_class_started ON pipeline_runs(class, started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_started ON pipeline_runs(started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
