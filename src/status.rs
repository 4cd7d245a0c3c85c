//! `prism status`: recent runs and persisted state at a glance.
//!
//! Reads only the local SQLite database, so it works without credentials
//! and while `prism run` is active.

use anyhow::Result;
use chrono::{DateTime, Utc};
use prism_core::models::BatchRun;

use crate::config::Config;
use crate::{db, migrate, runs};

const RECENT_RUNS: i64 = 10;

pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let now = Utc::now().timestamp_millis();
    let cached: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM classification_cache WHERE expires_at > ?")
        .bind(now)
        .fetch_one(&pool)
        .await?;
    let checkpoints: Vec<(String, String, i64)> =
        sqlx::query_as("SELECT source, cursor, updated_at FROM checkpoints ORDER BY source")
            .fetch_all(&pool)
            .await?;
    let recent = runs::recent_runs(&pool, RECENT_RUNS).await?;

    println!("PRISM Status");
    println!("============");
    println!();
    println!("  Database:        {}", config.db.path.display());
    println!("  Cached results:  {}", cached);
    println!("  Mirror:          {}", if config.mirror.enabled { "enabled" } else { "disabled" });
    println!();

    if checkpoints.is_empty() {
        println!("  No open checkpoints.");
    } else {
        println!("  Open checkpoints:");
        for (source, cursor, updated_at) in &checkpoints {
            let when = DateTime::from_timestamp(*updated_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!("    {:<18} {}  ({})", source, cursor, when);
        }
    }
    println!();

    if recent.is_empty() {
        println!("  No runs recorded yet.");
    } else {
        println!("  Recent runs:");
        println!(
            "    {:<20} {:<15} {:<16} {:>5} {:>5} {:>5} {:>5}",
            "STARTED", "KIND", "STATE", "ITEMS", "OK", "FAIL", "RETRY"
        );
        for run in &recent {
            print_run(run);
        }
    }

    pool.close().await;
    Ok(())
}

fn print_run(run: &BatchRun) {
    println!(
        "    {:<20} {:<15} {:<16} {:>5} {:>5} {:>5} {:>5}",
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.kind.as_str(),
        format!("{:?}", run.state),
        run.item_count,
        run.succeeded,
        run.failed,
        run.retried
    );
    if let Some(error) = &run.error {
        println!("      error: {}", error);
    }
}

/// One-line summary used after `prism once` and `prism mirror`.
pub fn summarize_run(run: &BatchRun) -> String {
    let mut line = format!(
        "{} run {}: {:?} ({} items, {} succeeded, {} failed, {} retried, {} skipped)",
        run.kind.as_str(),
        run.run_id,
        run.state,
        run.item_count,
        run.succeeded,
        run.failed,
        run.retried,
        run.skipped
    );
    if !run.conflicts.is_empty() {
        line.push_str(&format!(" [{} write conflicts]", run.conflicts.len()));
    }
    if let Some(error) = &run.error {
        line.push_str(&format!(": {}", error));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::models::RunKind;

    #[test]
    fn summary_line_mentions_counts_and_error() {
        let mut run = BatchRun::start("r1", RunKind::Classification);
        run.item_count = 5;
        run.record_success();
        run.record_failure("item-3", "write failed");
        run.error = Some("fetch failed: timeout".to_string());
        run.finish();
        let line = summarize_run(&run);
        assert!(line.starts_with("classification run r1: PartiallyFailed (5 items, 1 succeeded, 1 failed"));
        assert!(line.ends_with("fetch failed: timeout"));
    }
}
