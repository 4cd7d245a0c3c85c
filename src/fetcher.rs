//! Paged reads from the knowledge store.
//!
//! Every list call goes through [`RateLimiter::call`] under
//! [`Provider::Notion`]; exhausted retries surface as
//! [`Error::RateLimitExhausted`] and other failures as [`Error::Fetch`].

use std::sync::Arc;

use prism_core::models::{DatabaseKind, Item};
use prism_core::store::{KnowledgeStore, ListFilter, Page};

use crate::error::{Error, Result};
use crate::ratelimit::{Provider, RateLimiter};

pub struct Fetcher {
    store: Arc<dyn KnowledgeStore>,
    limiter: Arc<RateLimiter>,
    page_size: usize,
}

impl Fetcher {
    pub fn new(store: Arc<dyn KnowledgeStore>, limiter: Arc<RateLimiter>, page_size: usize) -> Self {
        Self {
            store,
            limiter,
            page_size,
        }
    }

    /// One page of items in `kind` still waiting for classification
    /// (status `Pending` or `Failed`).
    pub async fn fetch_pending(&self, kind: DatabaseKind, page_token: Option<&str>) -> Result<Page<Item>> {
        self.list(kind, ListFilter::Unprocessed, page_token).await
    }

    /// One page of every record in `kind`.
    pub async fn fetch_page(&self, kind: DatabaseKind, page_token: Option<&str>) -> Result<Page<Item>> {
        self.list(kind, ListFilter::All, page_token).await
    }

    async fn list(&self, kind: DatabaseKind, filter: ListFilter, page_token: Option<&str>) -> Result<Page<Item>> {
        let store = self.store.as_ref();
        let page_size = self.page_size;
        let page = self
            .limiter
            .call(Provider::Notion, move || store.list(kind, filter, page_token, page_size))
            .await
            .map_err(|e| e.into_error(Provider::Notion, Error::Fetch))?;
        tracing::debug!(
            kind = %kind,
            items = page.items.len(),
            has_more = page.next_cursor.is_some(),
            "fetched page"
        );
        Ok(page)
    }
}
