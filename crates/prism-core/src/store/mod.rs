//! Knowledge store abstraction.
//!
//! The [`KnowledgeStore`] trait is the boundary to the remote workspace
//! that holds the inbox and the six typed collections. The engine only
//! ever lists records, upserts destination records keyed by `source_id`,
//! and patches source records; it never deletes anything.
//!
//! Every call returns a [`ProviderError`] on failure so the rate limiter
//! can tell throttling and transient faults (retried with backoff) from
//! permanent rejections (surfaced immediately).

pub mod memory;

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::models::{Category, DatabaseKind, Item, ItemStatus};

// ═══════════════════════════════════════════════════════════════════════
// Provider errors
// ═══════════════════════════════════════════════════════════════════════

/// Failure reported by any external provider (store, calendar, LLM).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// HTTP 429 or an equivalent quota signal.
    #[error("throttled by provider (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    /// 5xx responses and network failures.
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider call timed out")]
    Timeout,
    /// Invalid or revoked credentials; fatal for the current run.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other 4xx. A 400 on a paginated list usually means a stale cursor.
    #[error("rejected by provider ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ProviderError {
    /// Map an HTTP status to an error variant.
    pub fn from_status(status: u16, retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => ProviderError::Throttled { retry_after },
            408 => ProviderError::Timeout,
            401 | 403 => ProviderError::Unauthorized(message),
            404 => ProviderError::NotFound(message),
            500..=599 => ProviderError::Transient(format!("HTTP {}: {}", status, message)),
            _ => ProviderError::Rejected { status, message },
        }
    }

    /// Throttling, transient faults and timeouts are retried; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled { .. } | ProviderError::Transient(_) | ProviderError::Timeout
        )
    }

    pub fn is_throttle(&self) -> bool {
        matches!(self, ProviderError::Throttled { .. })
    }

    /// Errors that abort the whole run rather than a single item.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, ProviderError::Unauthorized(_))
    }

    pub fn is_stale_cursor(&self) -> bool {
        matches!(self, ProviderError::Rejected { status: 400, .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════

/// Which records [`KnowledgeStore::list`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    /// Records still awaiting triage: `Pending`, plus `Failed` ones that are
    /// retried on every run.
    Unprocessed,
    /// Every live record in the collection.
    All,
}

/// One page of list results.
#[derive(Debug, Clone, Default)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// Fields written to a destination record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFields {
    /// Key shared with the source item; the idempotency key for upserts.
    pub source_id: String,
    /// Display title (the derived summary).
    pub title: String,
    pub body: String,
    pub category: Category,
    pub confidence: f64,
    pub tags: BTreeSet<String>,
    pub due: Option<NaiveDate>,
    pub classified_at: DateTime<Utc>,
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertReceipt {
    pub record_id: String,
    pub created: bool,
    /// More than one prior record existed for the key, or the prior record
    /// carried a different category or confidence. The newest one was
    /// overwritten.
    pub conflict: bool,
}

/// Changes applied to a source record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePatch {
    pub status: Option<ItemStatus>,
    pub title: Option<String>,
    pub body: Option<String>,
}

impl SourcePatch {
    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.title.is_none() && self.body.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Store trait
// ═══════════════════════════════════════════════════════════════════════

/// Abstract knowledge store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`list`](KnowledgeStore::list) | Page through a collection |
/// | [`create_or_update`](KnowledgeStore::create_or_update) | Idempotent upsert of a destination record |
/// | [`update_source`](KnowledgeStore::update_source) | Patch a source record's status, title or body |
/// | [`update_status`](KnowledgeStore::update_status) | Shorthand for a status-only patch |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// List one page of a collection.
    ///
    /// `cursor` is the opaque token from a previous page; `None` starts
    /// from the beginning.
    async fn list(
        &self,
        kind: DatabaseKind,
        filter: ListFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<Item>, ProviderError>;

    /// Create or update the record for `source_id` in `kind`.
    ///
    /// Calling this twice with the same arguments leaves exactly one record.
    async fn create_or_update(
        &self,
        kind: DatabaseKind,
        source_id: &str,
        fields: &RecordFields,
    ) -> Result<UpsertReceipt, ProviderError>;

    async fn update_source(&self, source_id: &str, patch: &SourcePatch) -> Result<(), ProviderError>;

    async fn update_status(&self, source_id: &str, status: ItemStatus) -> Result<(), ProviderError> {
        self.update_source(source_id, &SourcePatch::status(status)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(ProviderError::from_status(429, None, "").is_throttle());
        assert!(ProviderError::from_status(503, None, "down").is_retryable());
        assert!(ProviderError::from_status(408, None, "").is_retryable());
        assert!(ProviderError::from_status(401, None, "bad token").is_run_fatal());
        assert!(!ProviderError::from_status(422, None, "bad body").is_retryable());
        assert!(ProviderError::from_status(400, None, "cursor").is_stale_cursor());
    }

    #[test]
    fn throttle_keeps_retry_after() {
        let err = ProviderError::from_status(429, Some(Duration::from_secs(3)), "");
        assert_eq!(
            err,
            ProviderError::Throttled {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }
}
