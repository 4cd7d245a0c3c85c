//! Idempotent write-back of classification results.
//!
//! For every classified item the writer:
//!
//! 1. upserts the destination record keyed by `source_id` into the
//!    collection for the result's category;
//! 2. patches the source item to `Classified`, writing back the one field
//!    cross-fill filled in the same request. The field that already had
//!    content is never rewritten.
//!
//! `Unclassified` results never reach a destination collection: the source
//! is marked `Failed` instead and picked up again on a later run.

use std::sync::Arc;

use chrono::Utc;
use prism_core::models::{ClassificationResult, Item, ItemStatus};
use prism_core::preprocess::{needs_cross_fill, preprocess, title_is_empty};
use prism_core::store::{KnowledgeStore, RecordFields, SourcePatch, UpsertReceipt};

use crate::error::{Error, Result};
use crate::ratelimit::{Provider, RateLimiter};

/// What [`Writer::write_result`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Created { record_id: String },
    /// `conflict` is set when the upsert overwrote diverging prior records.
    Updated { record_id: String, conflict: bool },
    /// The result was unclassified; the source is now `Failed`.
    MarkedFailed,
}

pub struct Writer {
    store: Arc<dyn KnowledgeStore>,
    limiter: Arc<RateLimiter>,
}

impl Writer {
    pub fn new(store: Arc<dyn KnowledgeStore>, limiter: Arc<RateLimiter>) -> Self {
        Self { store, limiter }
    }

    /// Write `result` for `item` (as fetched, before preprocessing).
    pub async fn write_result(&self, item: &Item, result: &ClassificationResult) -> Result<WriteOutcome> {
        let Some(kind) = result.category.destination() else {
            let reason = result.extracted_info.get("reason").map(String::as_str).unwrap_or("unclassified");
            tracing::info!(source_id = %item.source_id, confidence = result.confidence, reason, "no confident classification; marking failed");
            self.set_status(&item.source_id, SourcePatch::status(ItemStatus::Failed)).await?;
            return Ok(WriteOutcome::MarkedFailed);
        };

        let prepared = preprocess(item);
        let title = if result.summary.is_empty() {
            prepared.title.clone()
        } else {
            result.summary.clone()
        };
        let fields = RecordFields {
            source_id: item.source_id.clone(),
            title,
            body: prepared.body.clone(),
            category: result.category,
            confidence: result.confidence,
            tags: result.tags.clone(),
            due: result.due(),
            classified_at: Utc::now(),
        };

        let receipt = match self.upsert(kind, &fields).await {
            Ok(receipt) => receipt,
            Err(e) => {
                self.mark_failed_best_effort(&item.source_id, &e).await;
                return Err(e);
            }
        };
        if receipt.conflict {
            tracing::warn!(source_id = %item.source_id, record_id = %receipt.record_id, kind = %kind, "prior record diverged; overwritten");
        }

        let mut patch = SourcePatch::status(ItemStatus::Classified);
        if needs_cross_fill(item) {
            if title_is_empty(&item.title) {
                patch.title = Some(prepared.title);
            } else {
                patch.body = Some(prepared.body);
            }
        }
        if let Err(e) = self.set_status(&item.source_id, patch).await {
            self.mark_failed_best_effort(&item.source_id, &e).await;
            return Err(e);
        }

        tracing::debug!(source_id = %item.source_id, kind = %kind, record_id = %receipt.record_id, created = receipt.created, "wrote classification");
        Ok(if receipt.created {
            WriteOutcome::Created {
                record_id: receipt.record_id,
            }
        } else {
            WriteOutcome::Updated {
                record_id: receipt.record_id,
                conflict: receipt.conflict,
            }
        })
    }

    /// Upsert an arbitrary record; used by the calendar pull.
    pub async fn upsert(
        &self,
        kind: prism_core::models::DatabaseKind,
        fields: &RecordFields,
    ) -> Result<UpsertReceipt> {
        let store = self.store.as_ref();
        self.limiter
            .call(Provider::Notion, move || store.create_or_update(kind, &fields.source_id, fields))
            .await
            .map_err(|e| e.into_error(Provider::Notion, Error::Write))
    }

    /// Set a source item's status to `Failed`.
    pub async fn mark_failed(&self, source_id: &str) -> Result<()> {
        self.set_status(source_id, SourcePatch::status(ItemStatus::Failed)).await
    }

    async fn set_status(&self, source_id: &str, patch: SourcePatch) -> Result<()> {
        let store = self.store.as_ref();
        let patch = &patch;
        self.limiter
            .call(Provider::Notion, move || store.update_source(source_id, patch))
            .await
            .map_err(|e| e.into_error(Provider::Notion, Error::Write))
    }

    async fn mark_failed_best_effort(&self, source_id: &str, cause: &Error) {
        if cause.is_run_fatal() {
            return;
        }
        if let Err(e) = self.mark_failed(source_id).await {
            tracing::warn!(source_id, error = %e, "could not mark item failed after write error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitsConfig;
    use prism_core::models::{Category, DatabaseKind};
    use prism_core::store::memory::InMemoryKnowledgeStore;
    use std::collections::{BTreeMap, BTreeSet};

    fn writer(store: Arc<InMemoryKnowledgeStore>) -> Writer {
        Writer::new(store, Arc::new(RateLimiter::new(&RateLimitsConfig::default())))
    }

    fn task(confidence: f64) -> ClassificationResult {
        let mut extracted_info = BTreeMap::new();
        extracted_info.insert("due".to_string(), "2026-11-02".to_string());
        ClassificationResult {
            category: Category::Task,
            confidence,
            tags: BTreeSet::from(["task".to_string()]),
            extracted_info,
            summary: "Submit the report".to_string(),
        }
    }

    #[tokio::test]
    async fn second_write_updates_the_same_record() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let item = Item::inbox("page-1", "Submit the report", "by Friday");
        store.insert_source(item.clone());
        let writer = writer(store.clone());

        let first = writer.write_result(&item, &task(0.9)).await.unwrap();
        assert!(matches!(first, WriteOutcome::Created { .. }));
        let second = writer.write_result(&item, &task(0.9)).await.unwrap();
        assert!(matches!(second, WriteOutcome::Updated { conflict: false, .. }));

        let records = store.records(DatabaseKind::Task);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields.title, "Submit the report");
        assert_eq!(records[0].fields.due.map(|d| d.to_string()).as_deref(), Some("2026-11-02"));
        assert_eq!(store.source("page-1").unwrap().status, ItemStatus::Classified);
    }

    #[tokio::test]
    async fn diverging_prior_record_is_a_conflict() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let item = Item::inbox("page-1", "Submit the report", "");
        store.insert_source(item.clone());
        let writer = writer(store.clone());

        writer.write_result(&item, &task(0.9)).await.unwrap();
        let outcome = writer.write_result(&item, &task(0.7)).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Updated { conflict: true, .. }));
        assert_eq!(store.records(DatabaseKind::Task)[0].fields.confidence, 0.7);
    }

    #[tokio::test]
    async fn unclassified_marks_failed_without_writing() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let item = Item::inbox("page-2", "hmm", "");
        store.insert_source(item.clone());
        let writer = writer(store.clone());

        let result = ClassificationResult {
            category: Category::Unclassified,
            confidence: 0.3,
            tags: BTreeSet::new(),
            extracted_info: BTreeMap::new(),
            summary: "hmm".to_string(),
        };
        let outcome = writer.write_result(&item, &result).await.unwrap();
        assert_eq!(outcome, WriteOutcome::MarkedFailed);
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.source("page-2").unwrap().status, ItemStatus::Failed);
    }

    #[tokio::test]
    async fn cross_fill_is_written_back() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let item = Item::inbox("page-3", "", "Read the Rust book");
        store.insert_source(item.clone());
        let writer = writer(store.clone());

        writer.write_result(&item, &task(0.8)).await.unwrap();
        let source = store.source("page-3").unwrap();
        assert_eq!(source.title, "Read the Rust book");
        assert_eq!(source.body, "Read the Rust book");
    }

    #[tokio::test]
    async fn cross_fill_patches_only_the_empty_field() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let body = "あ".repeat(3000);
        let item = Item::inbox("page-4", "", &body);
        store.insert_source(item.clone());
        let writer = writer(store.clone());

        writer.write_result(&item, &task(0.8)).await.unwrap();
        let patch = store.last_patch("page-4").unwrap();
        assert_eq!(patch.title.as_deref(), Some(body.as_str()));
        assert_eq!(patch.body, None);
        assert_eq!(store.source("page-4").unwrap().body, body);

        let titled = Item::inbox("page-5", "Call the dentist", "");
        store.insert_source(titled.clone());
        writer.write_result(&titled, &task(0.8)).await.unwrap();
        let patch = store.last_patch("page-5").unwrap();
        assert_eq!(patch.title, None);
        assert_eq!(patch.body.as_deref(), Some("Call the dentist"));
    }

    #[tokio::test]
    async fn missing_source_is_a_write_error() {
        let store = Arc::new(InMemoryKnowledgeStore::new());
        let item = Item::inbox("ghost", "Submit the report", "");
        let writer = writer(store.clone());

        let err = writer.write_result(&item, &task(0.9)).await.unwrap_err();
        assert!(matches!(err, Error::Write(_)));
    }
}
