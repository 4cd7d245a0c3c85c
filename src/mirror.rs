//! Calendar/Task mirror.
//!
//! Runs as its own scheduled job, independent of classification, and keeps
//! due-dated records and calendar events in step in both directions:
//!
//! | Direction | Source | Target | Idempotency key |
//! |-----------|--------|--------|-----------------|
//! | push | `push_kinds` records with a due date in the window | calendar events | record `source_id` (event extended property) |
//! | pull | events in the window not created by the mirror | `pull_destination` records | `calendar:<event id>` |
//!
//! The window is `[today, today + lookahead_days]`. Records that came from
//! the calendar are never pushed back, and events the mirror created are
//! never pulled back, so the two directions cannot feed each other.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, Utc};
use prism_core::calendar::{calendar_source_id, originates_from_calendar, CalendarEvent};
use prism_core::models::{BatchRun, BatchState, Category, DatabaseKind, Item, RunKind};
use prism_core::store::RecordFields;
use prism_core::{CalendarService, DateRange};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::MirrorConfig;
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::ratelimit::{Provider, RateLimiter};
use crate::runs::record_run;
use crate::scheduler::BatchJob;
use crate::writer::Writer;

pub struct Mirror {
    fetcher: Arc<Fetcher>,
    writer: Arc<Writer>,
    calendar: Arc<dyn CalendarService>,
    limiter: Arc<RateLimiter>,
    push_kinds: Vec<DatabaseKind>,
    pull_destination: DatabaseKind,
    lookahead_days: i64,
    pool: Option<SqlitePool>,
}

impl Mirror {
    pub fn new(
        fetcher: Arc<Fetcher>,
        writer: Arc<Writer>,
        calendar: Arc<dyn CalendarService>,
        limiter: Arc<RateLimiter>,
        config: &MirrorConfig,
    ) -> Self {
        Self {
            fetcher,
            writer,
            calendar,
            limiter,
            push_kinds: config.push_kinds.clone(),
            pull_destination: config.pull_destination,
            lookahead_days: config.lookahead_days,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// One push-then-pull pass.
    pub async fn run_mirror(&self, cancel: CancellationToken) -> BatchRun {
        let run = BatchRun::start(uuid::Uuid::new_v4().to_string(), RunKind::Mirror);
        let span = tracing::info_span!("mirror", run_id = %run.run_id);
        self.run_pass(run, cancel).instrument(span).await
    }

    async fn run_pass(&self, mut run: BatchRun, cancel: CancellationToken) -> BatchRun {
        let retries_before = self.limiter.retries();
        let window = DateRange::lookahead(Local::now().date_naive(), self.lookahead_days);
        tracing::info!(start = %window.start, end = %window.end, "mirror started");

        let outcome = async {
            for &kind in &self.push_kinds {
                self.push(kind, &window, &mut run, &cancel).await?;
            }
            self.pull(&window, &mut run, &cancel).await
        }
        .await;

        match outcome {
            Ok(()) => {}
            Err(Error::Cancelled) if run.item_count > 0 => {
                run.error = Some("cancelled before the pass completed".to_string());
            }
            Err(e) => {
                tracing::error!(error = %e, "mirror aborted");
                run.abort(&e);
            }
        }

        run.retried = self.limiter.retries().saturating_sub(retries_before);
        run.finish();
        tracing::info!(
            state = ?run.state,
            items = run.item_count,
            succeeded = run.succeeded,
            failed = run.failed,
            "mirror finished"
        );
        if let Some(pool) = &self.pool {
            if let Err(e) = record_run(pool, &run).await {
                tracing::warn!(error = %e, "could not record mirror run");
            }
        }
        run
    }

    /// Push due-dated records of `kind` to the calendar. Only run-fatal
    /// errors and cancellation are returned.
    async fn push(
        &self,
        kind: DatabaseKind,
        window: &DateRange,
        run: &mut BatchRun,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cursor: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            run.state = BatchState::Fetching;
            let page = match self.fetcher.fetch_page(kind, cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(kind = %kind, error = %e, "could not list records to push");
                    run.error = Some(e.to_string());
                    return Ok(());
                }
            };

            run.state = BatchState::Processing;
            for record in &page.items {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let Some(due) = record.due.filter(|d| window.contains(*d)) else {
                    continue;
                };
                if originates_from_calendar(&record.source_id) {
                    continue;
                }
                run.item_count += 1;
                match self.push_one(record, due).await {
                    Ok(event_id) => {
                        tracing::debug!(source_id = %record.source_id, event_id = %event_id, "pushed to calendar");
                        run.record_success();
                    }
                    Err(e) if e.is_run_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(source_id = %record.source_id, error = %e, "push failed");
                        run.record_failure(&record.source_id, &e);
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn push_one(&self, record: &Item, due: chrono::NaiveDate) -> Result<String> {
        let calendar = self.calendar.as_ref();
        let description = (!record.body.is_empty()).then_some(record.body.as_str());
        self.limiter
            .call(Provider::Calendar, move || {
                calendar.upsert_event(&record.source_id, &record.title, due, description)
            })
            .await
            .map_err(|e| e.into_error(Provider::Calendar, Error::Write))
    }

    /// Pull events in the window into the destination collection.
    async fn pull(&self, window: &DateRange, run: &mut BatchRun, cancel: &CancellationToken) -> Result<()> {
        let mut token: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            run.state = BatchState::Fetching;
            let calendar = self.calendar.as_ref();
            let page_token = token.as_deref();
            let page = match self
                .limiter
                .call(Provider::Calendar, move || calendar.list_events(window, page_token))
                .await
                .map_err(|e| e.into_error(Provider::Calendar, Error::Fetch))
            {
                Ok(page) => page,
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(error = %e, "could not list calendar events");
                    run.error = Some(e.to_string());
                    return Ok(());
                }
            };

            run.state = BatchState::Processing;
            for event in &page.events {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if event.source_id.is_some() {
                    continue;
                }
                if !seen.insert(event.id.clone()) {
                    run.skipped += 1;
                    continue;
                }
                run.item_count += 1;
                let fields = self.pulled_fields(event);
                match self.writer.upsert(self.pull_destination, &fields).await {
                    Ok(receipt) => {
                        tracing::debug!(event_id = %event.id, record_id = %receipt.record_id, created = receipt.created, "pulled from calendar");
                        run.record_success();
                    }
                    Err(e) if e.is_run_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(event_id = %event.id, error = %e, "pull failed");
                        run.record_failure(&fields.source_id, &e);
                    }
                }
            }

            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    }

    fn pulled_fields(&self, event: &CalendarEvent) -> RecordFields {
        let category: Option<Category> = self.pull_destination.into();
        RecordFields {
            source_id: calendar_source_id(&event.id),
            title: event.title.clone(),
            body: event.description.clone().unwrap_or_default(),
            category: category.unwrap_or(Category::Task),
            confidence: 1.0,
            tags: BTreeSet::from(["calendar".to_string()]),
            due: Some(event.date),
            classified_at: Utc::now(),
        }
    }
}

#[async_trait]
impl BatchJob for Mirror {
    fn name(&self) -> &str {
        "mirror"
    }

    async fn run(&self, cancel: CancellationToken) -> BatchRun {
        self.run_mirror(cancel).await
    }
}
