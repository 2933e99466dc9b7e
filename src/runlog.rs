//! Durable record of pipeline runs and per-class checkpoints.
//!
//! Every run is written twice: once when it starts (status `running`) and
//! once when it ends. The second write is the only place a class
//! checkpoint moves, and both happen in one transaction, so a checkpoint
//! never points at a run the log does not show as successful.
//!
//! [`SqliteRunLog`] is the production store; [`MemoryRunLog`] backs tests
//! and one-off dry runs that should leave no trace on disk.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docsync_core::run::{PipelineRun, RunCounts};

#[async_trait]
pub trait RunLog: Send + Sync {
    /// Record a run that has just started.
    async fn start(&self, run: &PipelineRun) -> Result<()>;

    /// Record the terminal state of a started run, advancing the class
    /// checkpoint to `run.started_at` when `run.advances_checkpoint`.
    ///
    /// Fails if the run was never started or is already finished.
    async fn finish(&self, run: &PipelineRun) -> Result<()>;

    /// Most recent runs first, optionally for one class.
    async fn recent(&self, class: Option<&str>, limit: usize) -> Result<Vec<PipelineRun>>;

    async fn checkpoint(&self, class: &str) -> Result<Option<DateTime<Utc>>>;
}

// ============ SQLite ============

pub struct SqliteRunLog {
    pool: SqlitePool,
}

impl SqliteRunLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mark runs left `running` by a previous process as aborted.
    ///
    /// Nothing can finish them anymore; leaving them open would make the
    /// history claim work is in progress.
    pub async fn abandon_unfinished(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = 'aborted', outcome = 'aborted', finished_at = ?,
                abort_reason = 'process exited before the run finished'
            WHERE finished_at IS NULL
            "#,
        )
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn millis(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ts).ok_or_else(|| anyhow!("invalid timestamp {}", ts))
}

fn count(row: &SqliteRow, column: &str) -> u64 {
    row.get::<i64, _>(column).max(0) as u64
}

fn row_to_run(row: &SqliteRow) -> Result<PipelineRun> {
    let parse_err = |e: String| anyhow!(e);
    Ok(PipelineRun {
        id: row.get("id"),
        class: row.get("class"),
        trigger: row.get::<String, _>("trigger").parse().map_err(parse_err)?,
        mode: row.get::<String, _>("mode").parse().map_err(parse_err)?,
        status: row.get::<String, _>("status").parse().map_err(parse_err)?,
        outcome: row.get::<String, _>("outcome").parse().map_err(parse_err)?,
        window_start: row
            .get::<Option<i64>, _>("window_start")
            .map(millis)
            .transpose()?,
        started_at: millis(row.get("started_at"))?,
        finished_at: row
            .get::<Option<i64>, _>("finished_at")
            .map(millis)
            .transpose()?,
        counts: RunCounts {
            fetched: count(row, "fetched"),
            upserted: count(row, "upserted"),
            would_upsert: count(row, "would_upsert"),
            skipped_unchanged: count(row, "skipped_unchanged"),
            failed: count(row, "failed"),
        },
        outcomes: serde_json::from_str(&row.get::<String, _>("outcomes_json"))?,
        listing_errors: serde_json::from_str(&row.get::<String, _>("listing_errors_json"))?,
        abort_reason: row.get("abort_reason"),
        advances_checkpoint: false,
    })
}

#[async_trait]
impl RunLog for SqliteRunLog {
    async fn start(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, class, trigger, mode, status, outcome, window_start, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.class)
        .bind(run.trigger.as_str())
        .bind(run.mode.as_str())
        .bind(run.status.as_str())
        .bind(run.outcome.as_str())
        .bind(run.window_start.map(|t| t.timestamp_millis()))
        .bind(run.started_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(&self, run: &PipelineRun) -> Result<()> {
        let Some(finished_at) = run.finished_at else {
            bail!("run {} has no finish time", run.id);
        };
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = ?, outcome = ?, window_start = ?, finished_at = ?,
                fetched = ?, upserted = ?, would_upsert = ?, skipped_unchanged = ?, failed = ?,
                outcomes_json = ?, listing_errors_json = ?, abort_reason = ?
            WHERE id = ? AND finished_at IS NULL
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.outcome.as_str())
        .bind(run.window_start.map(|t| t.timestamp_millis()))
        .bind(finished_at.timestamp_millis())
        .bind(run.counts.fetched as i64)
        .bind(run.counts.upserted as i64)
        .bind(run.counts.would_upsert as i64)
        .bind(run.counts.skipped_unchanged as i64)
        .bind(run.counts.failed as i64)
        .bind(serde_json::to_string(&run.outcomes)?)
        .bind(serde_json::to_string(&run.listing_errors)?)
        .bind(&run.abort_reason)
        .bind(&run.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            bail!("run {} is not an unfinished run", run.id);
        }

        if run.advances_checkpoint {
            // Checkpoints only move forward.
            sqlx::query(
                r#"
                INSERT INTO checkpoints (class, checkpoint_at, run_id, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(class) DO UPDATE SET
                    checkpoint_at = excluded.checkpoint_at,
                    run_id = excluded.run_id,
                    updated_at = excluded.updated_at
                WHERE excluded.checkpoint_at > checkpoints.checkpoint_at
                "#,
            )
            .bind(&run.class)
            .bind(run.started_at.timestamp_millis())
            .bind(&run.id)
            .bind(finished_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn recent(&self, class: Option<&str>, limit: usize) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pipeline_runs
            WHERE (? IS NULL OR class = ?)
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(class)
        .bind(class)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn checkpoint(&self, class: &str) -> Result<Option<DateTime<Utc>>> {
        let at: Option<i64> =
            sqlx::query_scalar("SELECT checkpoint_at FROM checkpoints WHERE class = ?")
                .bind(class)
                .fetch_optional(&self.pool)
                .await?;
        at.map(millis).transpose()
    }
}

// ============ In-memory ============

#[derive(Default)]
pub struct MemoryRunLog {
    runs: Mutex<Vec<PipelineRun>>,
    checkpoints: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint, as if an earlier run had set it.
    pub fn set_checkpoint(&self, class: &str, at: DateTime<Utc>) {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(class.to_string(), at);
    }
}

#[async_trait]
impl RunLog for MemoryRunLog {
    async fn start(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.iter().any(|r| r.id == run.id) {
            bail!("run {} already recorded", run.id);
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn finish(&self, run: &PipelineRun) -> Result<()> {
        if run.finished_at.is_none() {
            bail!("run {} has no finish time", run.id);
        }
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let slot = runs
            .iter_mut()
            .find(|r| r.id == run.id && !r.is_finished())
            .ok_or_else(|| anyhow!("run {} is not an unfinished run", run.id))?;
        *slot = run.clone();
        slot.advances_checkpoint = false;

        if run.advances_checkpoint {
            let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
            let entry = checkpoints.entry(run.class.clone()).or_insert(run.started_at);
            if run.started_at > *entry {
                *entry = run.started_at;
            }
        }
        Ok(())
    }

    async fn recent(&self, class: Option<&str>, limit: usize) -> Result<Vec<PipelineRun>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<PipelineRun> = runs
            .iter()
            .filter(|r| class.map_or(true, |c| r.class == c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn checkpoint(&self, class: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(class)
            .copied())
    }
}
