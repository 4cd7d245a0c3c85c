//! Classifier plugin backed by an OpenAI-style chat completion endpoint.
//!
//! The model is asked for a JSON object:
//!
//! ```json
//! {"category": "Task", "confidence": 0.82, "tags": ["work"],
//!  "reason": "has a deadline", "due": "2026-11-02"}
//! ```
//!
//! Requests go through the shared [`RateLimiter`] under [`Provider::Llm`].
//! The plugin declares [`Capability::Extract`], so a valid `due` date it
//! returns lands in the result's `extracted_info`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use prism_core::classify::{Capability, Classifier, PluginVerdict};
use prism_core::models::{Category, Item};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::LlmConfig;
use crate::http::{self, send_json};
use crate::ratelimit::{Provider, RateLimiter};

const SYSTEM_PROMPT: &str = "You sort personal inbox entries. Reply with one JSON object with keys \
category (one of Task, ToDo, Knowledge, Note, Project, Habit, Unclassified), \
confidence (0.0 to 1.0), tags (array of short lowercase strings), reason (one sentence) \
and due (YYYY-MM-DD or null). Task: work with a deadline or several steps. \
ToDo: a small errand. Knowledge: something learned or to look up. Note: a thought or memo. \
Project: a larger goal. Habit: something repeated regularly.";

const CAPABILITIES: [Capability; 2] = [Capability::Classify, Capability::Extract];

#[derive(Debug, Deserialize)]
struct Reply {
    category: String,
    confidence: f64,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    due: Option<String>,
}

pub struct LlmClassifier {
    model: String,
    endpoint: String,
    api_key: String,
    labels: Vec<String>,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl LlmClassifier {
    pub fn new(config: &LlmConfig, api_key: String, limiter: Arc<RateLimiter>) -> Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            labels: config.labels.iter().map(|l| l.to_lowercase()).collect(),
            client: http::client()?,
            limiter,
        })
    }

    fn request_body(&self, item: &Item) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": item.text() },
            ],
        })
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn name(&self) -> &str {
        "llm"
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn capabilities(&self) -> &[Capability] {
        &CAPABILITIES
    }

    async fn classify(&self, item: &Item) -> Result<Option<PluginVerdict>> {
        let body = self.request_body(item);
        let (client, endpoint, api_key, body) = (&self.client, self.endpoint.as_str(), self.api_key.as_str(), &body);
        let response = self
            .limiter
            .call(Provider::Llm, move || {
                send_json(client.post(endpoint).bearer_auth(api_key).json(body))
            })
            .await?;
        parse_completion(&response)
    }
}

/// Turn a chat completion response into a verdict. `Unclassified` is an
/// abstention.
fn parse_completion(response: &Value) -> Result<Option<PluginVerdict>> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .context("Invalid completion response: missing choices[0].message.content")?;
    let reply: Reply = serde_json::from_str(content).context("Model reply is not the expected JSON object")?;

    let category: Category = reply.category.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    if category == Category::Unclassified {
        return Ok(None);
    }

    let reason = if reply.reason.is_empty() {
        "model verdict".to_string()
    } else {
        reply.reason
    };
    let mut verdict = PluginVerdict::new(category, reply.confidence, reason)
        .with_tags(reply.tags.iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()));
    if let Some(due) = reply
        .due
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
    {
        verdict.extracted.insert("due".to_string(), due.to_string());
    }
    Ok(Some(verdict))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(content: &str) -> Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    #[test]
    fn parses_verdict_with_due_date() {
        let response = completion(
            r#"{"category":"Task","confidence":0.82,"tags":["Work"," "],"reason":"deadline","due":"2026-11-02"}"#,
        );
        let verdict = parse_completion(&response).unwrap().unwrap();
        assert_eq!(verdict.category, Category::Task);
        assert_eq!(verdict.score, 0.82);
        assert!(verdict.tags.contains("work"));
        assert_eq!(verdict.tags.len(), 1);
        assert_eq!(verdict.extracted.get("due").map(String::as_str), Some("2026-11-02"));
    }

    #[test]
    fn unclassified_abstains_and_bad_dates_are_dropped() {
        let response = completion(r#"{"category":"Unclassified","confidence":0.1}"#);
        assert!(parse_completion(&response).unwrap().is_none());

        let response = completion(r#"{"category":"todo","confidence":0.7,"due":"next week"}"#);
        let verdict = parse_completion(&response).unwrap().unwrap();
        assert_eq!(verdict.category, Category::ToDo);
        assert!(verdict.extracted.is_empty());
    }

    #[test]
    fn malformed_replies_are_errors() {
        assert!(parse_completion(&json!({ "choices": [] })).is_err());
        assert!(parse_completion(&completion("not json")).is_err());
        assert!(parse_completion(&completion(r#"{"category":"Recipe","confidence":0.9}"#)).is_err());
    }
}
