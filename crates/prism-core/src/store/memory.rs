//! In-memory [`KnowledgeStore`] for tests and dry runs.
//!
//! Source items and destination records live behind one `std::sync::RwLock`.
//! Cursors are decimal positions in insertion order.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{KnowledgeStore, ListFilter, Page, ProviderError, RecordFields, SourcePatch, UpsertReceipt};
use crate::models::{DatabaseKind, Item, ItemStatus};

/// A destination record as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record_id: String,
    pub kind: DatabaseKind,
    pub fields: RecordFields,
    pub created_at: DateTime<Utc>,
}

impl StoredRecord {
    fn to_item(&self) -> Item {
        Item {
            source_id: self.fields.source_id.clone(),
            title: self.fields.title.clone(),
            body: self.fields.body.clone(),
            created_at: self.created_at,
            database_kind: self.kind,
            status: ItemStatus::Classified,
            labels: self.fields.tags.clone(),
            due: self.fields.due,
        }
    }
}

#[derive(Default)]
struct Inner {
    sources: Vec<Item>,
    records: Vec<StoredRecord>,
    patches: Vec<(String, SourcePatch)>,
    next_id: u64,
}

/// In-memory knowledge store.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    inner: RwLock<Inner>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an inbox item.
    pub fn insert_source(&self, item: Item) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.sources.push(item);
    }

    pub fn source(&self, source_id: &str) -> Option<Item> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.sources.iter().find(|i| i.source_id == source_id).cloned()
    }

    /// All destination records of one kind, in insertion order.
    pub fn records(&self, kind: DatabaseKind) -> Vec<StoredRecord> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.records.iter().filter(|r| r.kind == kind).cloned().collect()
    }

    /// The most recent patch applied to a source item.
    pub fn last_patch(&self, source_id: &str) -> Option<SourcePatch> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .patches
            .iter()
            .rev()
            .find(|(id, _)| id == source_id)
            .map(|(_, patch)| patch.clone())
    }

    pub fn record_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.records.len()
    }

    /// Insert a destination record directly, bypassing upsert checks.
    pub fn insert_record(&self, kind: DatabaseKind, fields: RecordFields) -> String {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let record_id = format!("rec-{}", inner.next_id);
        inner.records.push(StoredRecord {
            record_id: record_id.clone(),
            kind,
            fields,
            created_at: Utc::now(),
        });
        record_id
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<usize, ProviderError> {
    match cursor {
        None => Ok(0),
        Some(c) => c.parse().map_err(|_| ProviderError::Rejected {
            status: 400,
            message: format!("invalid start_cursor '{}'", c),
        }),
    }
}

/// `candidates` carries each item's position in insertion order; the
/// cursor is a position, so paging stays stable while earlier items change
/// status mid-pass.
fn paginate(candidates: Vec<(usize, Item)>, total: usize, offset: usize, page_size: usize) -> Result<Page<Item>, ProviderError> {
    if offset > total {
        return Err(ProviderError::Rejected {
            status: 400,
            message: format!("start_cursor {} out of range", offset),
        });
    }
    let mut remaining = candidates.into_iter().filter(|(pos, _)| *pos >= offset).peekable();
    let mut items = Vec::new();
    let mut last = offset;
    while items.len() < page_size.max(1) {
        let Some((pos, item)) = remaining.next() else { break };
        last = pos;
        items.push(item);
    }
    let next_cursor = remaining.peek().is_some().then(|| (last + 1).to_string());
    Ok(Page { items, next_cursor })
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn list(
        &self,
        kind: DatabaseKind,
        filter: ListFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<Item>, ProviderError> {
        let offset = parse_cursor(cursor)?;
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let (candidates, total): (Vec<(usize, Item)>, usize) = if kind == DatabaseKind::Inbox {
            let matching = inner
                .sources
                .iter()
                .enumerate()
                .filter(|(_, i)| match filter {
                    ListFilter::All => true,
                    ListFilter::Unprocessed => i.status != ItemStatus::Classified,
                })
                .map(|(pos, i)| (pos, i.clone()))
                .collect();
            (matching, inner.sources.len())
        } else {
            let matching = inner
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.kind == kind)
                .map(|(pos, r)| (pos, r.to_item()))
                .collect();
            (matching, inner.records.len())
        };
        paginate(candidates, total, offset, page_size)
    }

    async fn create_or_update(
        &self,
        kind: DatabaseKind,
        source_id: &str,
        fields: &RecordFields,
    ) -> Result<UpsertReceipt, ProviderError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let prior: Vec<usize> = inner
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind == kind && r.fields.source_id == source_id)
            .map(|(i, _)| i)
            .collect();

        let Some(&newest) = prior.last() else {
            inner.next_id += 1;
            let record_id = format!("rec-{}", inner.next_id);
            inner.records.push(StoredRecord {
                record_id: record_id.clone(),
                kind,
                fields: fields.clone(),
                created_at: Utc::now(),
            });
            return Ok(UpsertReceipt {
                record_id,
                created: true,
                conflict: false,
            });
        };

        let record = &mut inner.records[newest];
        let conflict = prior.len() > 1
            || record.fields.category != fields.category
            || (record.fields.confidence - fields.confidence).abs() > f64::EPSILON;
        record.fields = fields.clone();
        Ok(UpsertReceipt {
            record_id: record.record_id.clone(),
            created: false,
            conflict,
        })
    }

    async fn update_source(&self, source_id: &str, patch: &SourcePatch) -> Result<(), ProviderError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let item = inner
            .sources
            .iter_mut()
            .find(|i| i.source_id == source_id)
            .ok_or_else(|| ProviderError::NotFound(format!("source item {}", source_id)))?;
        if let Some(status) = patch.status {
            item.status = status;
        }
        if let Some(title) = &patch.title {
            item.title = title.clone();
        }
        if let Some(body) = &patch.body {
            item.body = body.clone();
        }
        inner.patches.push((source_id.to_string(), patch.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use std::collections::BTreeSet;

    fn fields(source_id: &str, confidence: f64) -> RecordFields {
        RecordFields {
            source_id: source_id.to_string(),
            title: "Buy milk".to_string(),
            body: "Buy milk".to_string(),
            category: Category::ToDo,
            confidence,
            tags: BTreeSet::new(),
            due: None,
            classified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = InMemoryKnowledgeStore::new();
        let first = store
            .create_or_update(DatabaseKind::ToDo, "p1", &fields("p1", 0.8))
            .await
            .unwrap();
        let second = store
            .create_or_update(DatabaseKind::ToDo, "p1", &fields("p1", 0.8))
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert!(!second.conflict);
        assert_eq!(first.record_id, second.record_id);
        assert_eq!(store.records(DatabaseKind::ToDo).len(), 1);
    }

    #[tokio::test]
    async fn duplicate_prior_records_report_conflict() {
        let store = InMemoryKnowledgeStore::new();
        store.insert_record(DatabaseKind::ToDo, fields("p1", 0.8));
        let newest = store.insert_record(DatabaseKind::ToDo, fields("p1", 0.8));
        let receipt = store
            .create_or_update(DatabaseKind::ToDo, "p1", &fields("p1", 0.9))
            .await
            .unwrap();
        assert!(receipt.conflict);
        assert_eq!(receipt.record_id, newest);
        assert_eq!(store.records(DatabaseKind::ToDo)[1].fields.confidence, 0.9);
    }

    #[tokio::test]
    async fn unprocessed_filter_includes_failed_items() {
        let store = InMemoryKnowledgeStore::new();
        store.insert_source(Item::inbox("a", "a", ""));
        let mut failed = Item::inbox("b", "b", "");
        failed.status = ItemStatus::Failed;
        store.insert_source(failed);
        let mut done = Item::inbox("c", "c", "");
        done.status = ItemStatus::Classified;
        store.insert_source(done);

        let page = store
            .list(DatabaseKind::Inbox, ListFilter::Unprocessed, None, 10)
            .await
            .unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn pagination_and_stale_cursor() {
        let store = InMemoryKnowledgeStore::new();
        for i in 0..5 {
            store.insert_source(Item::inbox(format!("s{}", i), "t", "b"));
        }
        let first = store
            .list(DatabaseKind::Inbox, ListFilter::All, None, 2)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.unwrap();
        let second = store
            .list(DatabaseKind::Inbox, ListFilter::All, Some(&cursor), 10)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.next_cursor.is_none());

        let err = store
            .list(DatabaseKind::Inbox, ListFilter::All, Some("99"), 2)
            .await
            .unwrap_err();
        assert!(err.is_stale_cursor());
    }

    #[tokio::test]
    async fn cursor_survives_status_changes_on_earlier_pages() {
        let store = InMemoryKnowledgeStore::new();
        for i in 0..4 {
            store.insert_source(Item::inbox(format!("s{}", i), "t", "b"));
        }
        let first = store
            .list(DatabaseKind::Inbox, ListFilter::Unprocessed, None, 2)
            .await
            .unwrap();
        for item in &first.items {
            store.update_status(&item.source_id, ItemStatus::Classified).await.unwrap();
        }
        let second = store
            .list(DatabaseKind::Inbox, ListFilter::Unprocessed, first.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        let ids: Vec<_> = second.items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s3"]);
    }

    #[tokio::test]
    async fn update_status_patches_source() {
        let store = InMemoryKnowledgeStore::new();
        store.insert_source(Item::inbox("a", "", "body"));
        store.update_status("a", ItemStatus::Failed).await.unwrap();
        assert_eq!(store.source("a").unwrap().status, ItemStatus::Failed);
        assert!(store.update_status("zzz", ItemStatus::Failed).await.is_err());
    }
}
