//! Batch run history.
//!
//! Finished [`BatchRun`]s are stored as JSON alongside a few indexed
//! columns, so `prism status` and [`crate::engine::Engine::last_run_status`]
//! survive restarts.

use prism_core::models::{BatchRun, RunKind};
use sqlx::SqlitePool;

use crate::error::{Error, Result};

pub async fn record_run(pool: &SqlitePool, run: &BatchRun) -> Result<()> {
    let json = serde_json::to_string(run).map_err(|e| Error::Storage(e.to_string()))?;
    let state = serde_json::to_value(run.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    sqlx::query(
        r#"
        INSERT INTO batch_runs
            (run_id, kind, state, started_at, finished_at, item_count, succeeded, failed, retried, run_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET
            state = excluded.state,
            finished_at = excluded.finished_at,
            item_count = excluded.item_count,
            succeeded = excluded.succeeded,
            failed = excluded.failed,
            retried = excluded.retried,
            run_json = excluded.run_json
        "#,
    )
    .bind(&run.run_id)
    .bind(run.kind.as_str())
    .bind(state)
    .bind(run.started_at.timestamp_millis())
    .bind(run.finished_at.map(|t| t.timestamp_millis()))
    .bind(run.item_count as i64)
    .bind(run.succeeded as i64)
    .bind(run.failed as i64)
    .bind(run.retried as i64)
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}

fn decode(json: String) -> Result<BatchRun> {
    serde_json::from_str(&json).map_err(|e| Error::Storage(format!("corrupt batch run: {}", e)))
}

/// Most recent run of `kind`, by start time.
pub async fn last_run(pool: &SqlitePool, kind: RunKind) -> Result<Option<BatchRun>> {
    let json: Option<String> = sqlx::query_scalar(
        "SELECT run_json FROM batch_runs WHERE kind = ? ORDER BY started_at DESC LIMIT 1",
    )
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    json.map(decode).transpose()
}

/// Up to `limit` recent runs of any kind, newest first.
pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<BatchRun>> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT run_json FROM batch_runs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?;
    rows.into_iter().map(decode).collect()
}
