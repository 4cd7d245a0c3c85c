//! [`KnowledgeStore`] over the Notion REST API.
//!
//! Each collection is one Notion database, configured under
//! `[notion.databases]`. Inbox items are addressed by their page id, which
//! doubles as the `source_id` stored on destination records.
//!
//! | Operation | Notion call |
//! |-----------|-------------|
//! | `list` | `POST /databases/{id}/query` (status filter, `start_cursor`) |
//! | `create_or_update` | query by source id, then `POST /pages` or `PATCH /pages/{id}` |
//! | `update_source` | `PATCH /pages/{source_id}` |
//!
//! Each method performs single attempts; rate limiting and retries are
//! applied by the caller through [`crate::ratelimit::RateLimiter::call`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use prism_core::models::{Category, DatabaseKind, Item, ItemStatus};
use prism_core::store::{
    KnowledgeStore, ListFilter, Page, ProviderError, RecordFields, SourcePatch, UpsertReceipt,
};
use serde_json::{json, Map, Value};

use crate::config::{NotionConfig, NotionProperties};
use crate::http::{self, send_json};

/// Notion rejects rich text runs longer than this.
const MAX_TEXT_CHARS: usize = 2000;
/// Notion accepts at most this many runs per property value.
const MAX_TEXT_RUNS: usize = 100;

pub struct NotionStore {
    client: reqwest::Client,
    base_url: String,
    version: String,
    api_key: String,
    databases: BTreeMap<DatabaseKind, String>,
    props: NotionProperties,
}

impl NotionStore {
    pub fn new(config: &NotionConfig, api_key: String) -> anyhow::Result<Self> {
        let mut databases = BTreeMap::new();
        for (key, id) in &config.databases {
            let kind: DatabaseKind = key.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            databases.insert(kind, id.clone());
        }
        Ok(Self {
            client: http::client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            version: config.version.clone(),
            api_key,
            databases,
            props: config.properties.clone(),
        })
    }

    fn database(&self, kind: DatabaseKind) -> Result<&str, ProviderError> {
        self.databases
            .get(&kind)
            .map(String::as_str)
            .ok_or_else(|| ProviderError::NotFound(format!("no Notion database configured for {}", kind)))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("Notion-Version", &self.version)
    }

    async fn query(&self, database_id: &str, body: &Value) -> Result<Value, ProviderError> {
        send_json(
            self.request(reqwest::Method::POST, &format!("/databases/{}/query", database_id))
                .json(body),
        )
        .await
    }

    async fn patch_page(&self, page_id: &str, properties: Value) -> Result<Value, ProviderError> {
        send_json(
            self.request(reqwest::Method::PATCH, &format!("/pages/{}", page_id))
                .json(&json!({ "properties": properties })),
        )
        .await
    }

    fn status_name(&self, status: ItemStatus) -> &str {
        match status {
            ItemStatus::Pending => &self.props.status_pending,
            ItemStatus::Classified => &self.props.status_classified,
            ItemStatus::Failed => &self.props.status_failed,
        }
    }

    fn unprocessed_filter(&self) -> Value {
        let status = &self.props.status;
        json!({
            "or": [
                { "property": status, "select": { "equals": self.props.status_pending } },
                { "property": status, "select": { "equals": self.props.status_failed } },
                { "property": status, "select": { "is_empty": true } },
            ]
        })
    }

    /// Properties payload for a destination record.
    fn record_properties(&self, fields: &RecordFields) -> Value {
        let p = &self.props;
        let mut props = Map::new();
        props.insert(p.title.clone(), json!({ "title": text_runs(&fields.title) }));
        props.insert(p.body.clone(), json!({ "rich_text": text_runs(&fields.body) }));
        props.insert(p.source_id.clone(), json!({ "rich_text": text_runs(&fields.source_id) }));
        props.insert(p.category.clone(), json!({ "select": { "name": fields.category.as_str() } }));
        props.insert(p.confidence.clone(), json!({ "number": fields.confidence }));
        props.insert(
            p.tags.clone(),
            json!({ "multi_select": fields.tags.iter().map(|t| json!({ "name": t })).collect::<Vec<_>>() }),
        );
        props.insert(
            p.due.clone(),
            match fields.due {
                Some(due) => json!({ "date": { "start": due.to_string() } }),
                None => json!({ "date": null }),
            },
        );
        props.insert(
            p.classified_at.clone(),
            json!({ "date": { "start": fields.classified_at.to_rfc3339() } }),
        );
        Value::Object(props)
    }

    fn patch_properties(&self, patch: &SourcePatch) -> Value {
        let p = &self.props;
        let mut props = Map::new();
        if let Some(status) = patch.status {
            props.insert(p.status.clone(), json!({ "select": { "name": self.status_name(status) } }));
        }
        if let Some(title) = &patch.title {
            props.insert(p.title.clone(), json!({ "title": text_runs(title) }));
        }
        if let Some(body) = &patch.body {
            props.insert(p.body.clone(), json!({ "rich_text": text_runs(body) }));
        }
        Value::Object(props)
    }

    /// Convert one page object from a query response.
    fn page_to_item(&self, page: &Value, kind: DatabaseKind) -> Option<Item> {
        let page_id = page.get("id")?.as_str()?.to_string();
        let props = page.get("properties")?;
        let p = &self.props;

        let source_id = match kind {
            DatabaseKind::Inbox => page_id,
            _ => props
                .get(&p.source_id)
                .map(plain_text)
                .filter(|s| !s.is_empty())
                .unwrap_or(page_id),
        };
        let status = match kind {
            DatabaseKind::Inbox => {
                let name = props.pointer(&format!("/{}/select/name", escape_pointer(&p.status)));
                match name.and_then(Value::as_str) {
                    Some(n) if n == p.status_classified => ItemStatus::Classified,
                    Some(n) if n == p.status_failed => ItemStatus::Failed,
                    _ => ItemStatus::Pending,
                }
            }
            _ => ItemStatus::Classified,
        };
        let created_at = page
            .get("created_time")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let labels = props
            .get(&p.tags)
            .and_then(|t| t.get("multi_select"))
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .filter_map(|o| o.get("name").and_then(Value::as_str))
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        let due = props
            .pointer(&format!("/{}/date/start", escape_pointer(&p.due)))
            .and_then(Value::as_str)
            .and_then(|s| s.get(..10))
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

        Some(Item {
            source_id,
            title: props.get(&p.title).map(plain_text).unwrap_or_default(),
            body: props.get(&p.body).map(plain_text).unwrap_or_default(),
            created_at,
            database_kind: kind,
            status,
            labels,
            due,
        })
    }
}

/// Split `text` into runs of at most [`MAX_TEXT_CHARS`] characters.
/// Text beyond [`MAX_TEXT_RUNS`] runs is dropped with a warning.
fn text_runs(text: &str) -> Value {
    let chars: Vec<char> = text.chars().collect();
    let chunks = chars.chunks(MAX_TEXT_CHARS);
    if chunks.len() > MAX_TEXT_RUNS {
        tracing::warn!(
            chars = chars.len(),
            limit = MAX_TEXT_CHARS * MAX_TEXT_RUNS,
            "text exceeds the Notion property limit; writing a prefix"
        );
    }
    let runs: Vec<Value> = chunks
        .take(MAX_TEXT_RUNS)
        .map(|chunk| {
            let content: String = chunk.iter().collect();
            json!({ "type": "text", "text": { "content": content } })
        })
        .collect();
    Value::Array(runs)
}

/// Concatenated `plain_text` of a title or rich text property.
fn plain_text(prop: &Value) -> String {
    let Some(kind) = prop.get("type").and_then(Value::as_str) else {
        return String::new();
    };
    prop.get(kind)
        .and_then(Value::as_array)
        .map(|runs| {
            runs.iter()
                .filter_map(|r| r.get("plain_text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn number(props: &Value, name: &str) -> Option<f64> {
    props.get(name)?.get("number")?.as_f64()
}

fn select(props: &Value, name: &str) -> Option<String> {
    Some(props.get(name)?.get("select")?.get("name")?.as_str()?.to_string())
}

#[async_trait]
impl KnowledgeStore for NotionStore {
    async fn list(
        &self,
        kind: DatabaseKind,
        filter: ListFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<Item>, ProviderError> {
        let database_id = self.database(kind)?;
        let mut body = json!({
            "page_size": page_size.clamp(1, 100),
            "sorts": [{ "timestamp": "created_time", "direction": "ascending" }],
        });
        if let Some(cursor) = cursor {
            body["start_cursor"] = json!(cursor);
        }
        if kind == DatabaseKind::Inbox && filter == ListFilter::Unprocessed {
            body["filter"] = self.unprocessed_filter();
        }

        let response = self.query(database_id, &body).await?;
        let items = response
            .get("results")
            .and_then(Value::as_array)
            .map(|pages| pages.iter().filter_map(|p| self.page_to_item(p, kind)).collect())
            .unwrap_or_default();
        let has_more = response.get("has_more").and_then(Value::as_bool).unwrap_or(false);
        let next_cursor = if has_more {
            response.get("next_cursor").and_then(Value::as_str).map(str::to_string)
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn create_or_update(
        &self,
        kind: DatabaseKind,
        source_id: &str,
        fields: &RecordFields,
    ) -> Result<UpsertReceipt, ProviderError> {
        let database_id = self.database(kind)?;
        let lookup = json!({
            "page_size": 10,
            "filter": { "property": self.props.source_id, "rich_text": { "equals": source_id } },
            "sorts": [{ "timestamp": "created_time", "direction": "descending" }],
        });
        let response = self.query(database_id, &lookup).await?;
        let prior = response
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let properties = self.record_properties(fields);

        let Some(newest) = prior.first() else {
            let created = send_json(self.request(reqwest::Method::POST, "/pages").json(&json!({
                "parent": { "database_id": database_id },
                "properties": properties,
            })))
            .await?;
            let record_id = created.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            return Ok(UpsertReceipt {
                record_id,
                created: true,
                conflict: false,
            });
        };

        let record_id = newest
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Transient("query result without page id".to_string()))?
            .to_string();
        let empty = Value::Null;
        let old = newest.get("properties").unwrap_or(&empty);
        let old_category = select(old, &self.props.category).and_then(|c| c.parse::<Category>().ok());
        let old_confidence = number(old, &self.props.confidence);
        let conflict = prior.len() > 1
            || old_category != Some(fields.category)
            || old_confidence.map_or(true, |c| (c - fields.confidence).abs() > f64::EPSILON);

        self.patch_page(&record_id, properties).await?;
        Ok(UpsertReceipt {
            record_id,
            created: false,
            conflict,
        })
    }

    async fn update_source(&self, source_id: &str, patch: &SourcePatch) -> Result<(), ProviderError> {
        if patch.is_empty() {
            return Ok(());
        }
        self.patch_page(source_id, self.patch_properties(patch)).await?;
        Ok(())
    }
}
