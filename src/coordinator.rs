//! Batch Coordinator: one classification pass over the inbox.
//!
//! # Run lifecycle
//!
//! ```text
//! Started ─▶ Fetching ─▶ Processing ─┬─▶ (next page) Fetching ...
//!                                    ├─▶ Completed          no item failed
//!                                    ├─▶ PartiallyFailed    an item or page failed
//!                                    └─▶ Aborted            run-fatal error / cancelled before any page
//! ```
//!
//! # Per-item pipeline
//!
//! ```text
//! item ─▶ preprocess ─▶ fingerprint ─▶ cache.get_or_compute(registry.classify + due date) ─▶ writer
//! ```
//!
//! Items of one page fan out onto a `JoinSet`, gated by a `Semaphore` of
//! `engine.concurrency` permits. A failing or panicking item is recorded on
//! the [`BatchRun`] and never affects its siblings. A `source_id` seen
//! twice in one run is dispatched once.
//!
//! After each fully processed page the next cursor is checkpointed, so an
//! interrupted pass resumes where it stopped. Cancellation is observed
//! between items, including while an item waits for a permit; a page cut
//! short that way is not checkpointed, and the next pass fetches it again. A cursor the store no longer
//! accepts clears the checkpoint and restarts the pass from the first page,
//! once.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use futures::FutureExt;
use prism_core::extract::due_date;
use prism_core::models::{BatchRun, BatchState, ClassificationResult, DatabaseKind, Item, RunKind};
use prism_core::preprocess::{is_unclassifiable, preprocess};
use prism_core::{fingerprint, ClassifierRegistry};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::ClassificationCache;
use crate::checkpoint::{clear_checkpoint, get_checkpoint, set_checkpoint};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::ratelimit::RateLimiter;
use crate::runs::record_run;
use crate::scheduler::BatchJob;
use crate::writer::{WriteOutcome, Writer};

const CHECKPOINT_KEY: &str = "classify:inbox";

/// How [`Coordinator::process_page`] left a page.
struct PageOutcome {
    /// First run-fatal error any item hit.
    fatal: Option<Error>,
    /// Every item on the page was dispatched or skipped as a duplicate.
    complete: bool,
}

/// Everything one item needs, shared by all item tasks.
pub struct ItemPipeline {
    registry: Arc<ClassifierRegistry>,
    cache: Arc<ClassificationCache>,
    writer: Arc<Writer>,
}

impl ItemPipeline {
    pub fn new(registry: Arc<ClassifierRegistry>, cache: Arc<ClassificationCache>, writer: Arc<Writer>) -> Self {
        Self {
            registry,
            cache,
            writer,
        }
    }

    /// Classify and write one item. Unclassified and empty items come back
    /// as [`Error::NoConfidentClassification`] after being marked `Failed`.
    pub async fn process(&self, item: &Item) -> Result<WriteOutcome> {
        if is_unclassifiable(item) {
            self.writer.mark_failed(&item.source_id).await?;
            return Err(Error::NoConfidentClassification("item has neither title nor body".to_string()));
        }

        let prepared = preprocess(item);
        let fp = fingerprint(&prepared.title, &prepared.body);
        let result = self
            .cache
            .get_or_compute(&fp, || self.compute(&prepared))
            .await?;
        tracing::debug!(
            source_id = %item.source_id,
            fingerprint = fp.short(),
            category = %result.category,
            confidence = result.confidence,
            "classified"
        );

        match self.writer.write_result(item, &result).await? {
            WriteOutcome::MarkedFailed => {
                let reason = result.extracted_info.get("reason").cloned().unwrap_or_default();
                Err(Error::NoConfidentClassification(reason))
            }
            written => Ok(written),
        }
    }

    async fn compute(&self, item: &Item) -> Result<ClassificationResult> {
        let mut result = self.registry.classify(item).await?;
        if !result.is_unclassified() && !result.extracted_info.contains_key("due") {
            if let Some(due) = due_date(&item.text(), Local::now().date_naive()) {
                result.extracted_info.insert("due".to_string(), due.to_string());
            }
        }
        Ok(result)
    }
}

pub struct Coordinator {
    fetcher: Arc<Fetcher>,
    pipeline: Arc<ItemPipeline>,
    limiter: Arc<RateLimiter>,
    pool: Option<SqlitePool>,
    concurrency: usize,
}

impl Coordinator {
    pub fn new(fetcher: Arc<Fetcher>, pipeline: Arc<ItemPipeline>, limiter: Arc<RateLimiter>, concurrency: usize) -> Self {
        Self {
            fetcher,
            pipeline,
            limiter,
            pool: None,
            concurrency: concurrency.max(1),
        }
    }

    /// Persist checkpoints and finished runs in `pool`.
    pub fn with_pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Run one classification pass.
    pub async fn run_batch(&self, cancel: CancellationToken) -> BatchRun {
        let run = BatchRun::start(uuid::Uuid::new_v4().to_string(), RunKind::Classification);
        let span = tracing::info_span!("batch", run_id = %run.run_id);
        self.run_pass(run, cancel).instrument(span).await
    }

    async fn run_pass(&self, mut run: BatchRun, cancel: CancellationToken) -> BatchRun {
        let retries_before = self.limiter.retries();
        tracing::info!("batch started");

        let mut cursor = self.load_checkpoint().await;
        if cursor.is_some() {
            tracing::info!(cursor = cursor.as_deref(), "resuming from checkpoint");
        }
        let mut restarted = false;
        let mut seen = HashSet::new();
        let mut pages = 0u32;

        loop {
            if cancel.is_cancelled() {
                if pages == 0 {
                    run.abort(Error::Cancelled);
                } else {
                    run.error = Some("cancelled before all pages were processed".to_string());
                }
                break;
            }

            run.state = BatchState::Fetching;
            let page = match self.fetcher.fetch_pending(DatabaseKind::Inbox, cursor.as_deref()).await {
                Ok(page) => page,
                Err(Error::Fetch(e)) if e.is_stale_cursor() && cursor.is_some() && !restarted => {
                    tracing::warn!(error = %e, "checkpoint cursor rejected; restarting from the first page");
                    self.clear(CHECKPOINT_KEY).await;
                    cursor = None;
                    restarted = true;
                    continue;
                }
                Err(e) if e.is_run_fatal() => {
                    tracing::error!(error = %e, "fetch failed; aborting run");
                    run.abort(&e);
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "fetch failed; ending run");
                    run.error = Some(e.to_string());
                    break;
                }
            };
            pages += 1;

            run.state = BatchState::Processing;
            let outcome = self.process_page(page.items, &mut run, &mut seen, &cancel).await;
            if let Some(fatal) = outcome.fatal {
                tracing::error!(error = %fatal, "run-fatal error; aborting run");
                run.abort(&fatal);
                break;
            }
            if !outcome.complete {
                tracing::info!("cancelled mid-page; keeping the previous checkpoint");
                run.error = Some("cancelled before all items were dispatched".to_string());
                break;
            }

            match page.next_cursor {
                Some(next) => {
                    self.save_checkpoint(&next).await;
                    cursor = Some(next);
                }
                None => {
                    self.clear(CHECKPOINT_KEY).await;
                    break;
                }
            }
        }

        run.retried = self.limiter.retries().saturating_sub(retries_before);
        run.finish();
        tracing::info!(
            state = ?run.state,
            items = run.item_count,
            succeeded = run.succeeded,
            failed = run.failed,
            retried = run.retried,
            skipped = run.skipped,
            "batch finished"
        );
        if let Some(pool) = &self.pool {
            if let Err(e) = record_run(pool, &run).await {
                tracing::warn!(error = %e, "could not record batch run");
            }
        }
        run
    }

    /// Fan one page out over the item pipeline. Dispatch stops as soon as
    /// the run is cancelled or an item hits a run-fatal error; in-flight
    /// items still finish and are tallied.
    async fn process_page(
        &self,
        items: Vec<Item>,
        run: &mut BatchRun,
        seen: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> PageOutcome {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let halt = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut complete = true;

        for item in items {
            if halt.is_cancelled() {
                complete = false;
                break;
            }
            if seen.contains(&item.source_id) {
                tracing::debug!(source_id = %item.source_id, "duplicate item in run; skipping");
                run.skipped += 1;
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                complete = false;
                break;
            };
            seen.insert(item.source_id.clone());
            run.item_count += 1;

            let pipeline = self.pipeline.clone();
            let halt = halt.clone();
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let outcome = AssertUnwindSafe(pipeline.process(&item))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(Error::Classification(panic_message(panic))));
                    if matches!(&outcome, Err(e) if e.is_run_fatal()) {
                        halt.cancel();
                    }
                    (item.source_id, outcome)
                }
                .in_current_span(),
            );
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source_id, Ok(WriteOutcome::Updated { conflict: true, .. }))) => {
                    run.record_success();
                    let conflict = Error::WriteConflict {
                        source_id: source_id.clone(),
                    };
                    run.record_conflict(source_id, conflict);
                }
                Ok((_, Ok(_))) => run.record_success(),
                Ok((source_id, Err(e))) => {
                    tracing::warn!(source_id = %source_id, error = %e, "item failed");
                    if e.is_run_fatal() && fatal.is_none() {
                        fatal = Some(e.clone());
                    }
                    run.record_failure(source_id, &e);
                }
                Err(e) => {
                    // Only reachable if the task was aborted; panics are caught above.
                    tracing::warn!(error = %e, "item task did not complete");
                    run.record_failure("<unknown>", e);
                }
            }
        }
        PageOutcome { fatal, complete }
    }

    async fn load_checkpoint(&self) -> Option<String> {
        let pool = self.pool.as_ref()?;
        match get_checkpoint(pool, CHECKPOINT_KEY).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(error = %e, "could not read checkpoint; starting from the first page");
                None
            }
        }
    }

    async fn save_checkpoint(&self, cursor: &str) {
        if let Some(pool) = &self.pool {
            if let Err(e) = set_checkpoint(pool, CHECKPOINT_KEY, cursor).await {
                tracing::warn!(error = %e, "could not save checkpoint");
            }
        }
    }

    async fn clear(&self, key: &str) {
        if let Some(pool) = &self.pool {
            if let Err(e) = clear_checkpoint(pool, key).await {
                tracing::warn!(error = %e, "could not clear checkpoint");
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("item task panicked: {}", detail)
}

#[async_trait]
impl BatchJob for Coordinator {
    fn name(&self) -> &str {
        "classification"
    }

    async fn run(&self, cancel: CancellationToken) -> BatchRun {
        self.run_batch(cancel).await
    }
}
