//! Regex rule classifier.
//!
//! Rules are tried in order against `title + "\n" + body`; the first rule
//! whose pattern matches produces the verdict. No match is an abstention.
//! Patterns are case-insensitive.
//!
//! ```toml
//! [[classifier.rules]]
//! pattern = "(毎日|every day|habit)"
//! category = "Habit"
//! score = 0.8
//! tags = ["habit"]
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use super::{Classifier, PluginVerdict};
use crate::models::{Category, Item};

/// Rule as written in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    pub category: Category,
    pub score: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

struct Rule {
    regex: Regex,
    category: Category,
    score: f64,
    tags: Vec<String>,
}

pub struct RuleClassifier {
    name: String,
    labels: Vec<String>,
    rules: Vec<Rule>,
}

impl RuleClassifier {
    /// Compile rules; fails on the first invalid pattern.
    pub fn new(name: impl Into<String>, labels: Vec<String>, specs: &[RuleSpec]) -> Result<Self> {
        let rules = specs
            .iter()
            .map(|spec| {
                let regex = RegexBuilder::new(&spec.pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid rule pattern '{}'", spec.pattern))?;
                Ok(Rule {
                    regex,
                    category: spec.category,
                    score: spec.score,
                    tags: spec.tags.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.into(),
            labels,
            rules,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    async fn classify(&self, item: &Item) -> Result<Option<PluginVerdict>> {
        let text = item.text();
        Ok(self
            .rules
            .iter()
            .enumerate()
            .find(|(_, r)| r.regex.is_match(&text))
            .map(|(i, r)| {
                PluginVerdict::new(r.category, r.score, format!("rule #{} matched", i + 1))
                    .with_tags(r.tags.iter().cloned())
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pattern: &str, category: Category, score: f64) -> RuleSpec {
        RuleSpec {
            pattern: pattern.to_string(),
            category,
            score,
            tags: vec![category.label().to_string()],
        }
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let plugin = RuleClassifier::new(
            "rules",
            vec![],
            &[
                spec("project|プロジェクト", Category::Project, 0.8),
                spec("毎日|habit", Category::Habit, 0.9),
            ],
        )
        .unwrap();

        let v = plugin
            .classify(&Item::inbox("p", "新プロジェクト: 毎日の進捗共有", ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v.category, Category::Project);
        assert!(v.tags.contains("project"));

        let v = plugin
            .classify(&Item::inbox("p", "Morning HABIT", ""))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v.category, Category::Habit);
    }

    #[tokio::test]
    async fn no_match_abstains() {
        let plugin = RuleClassifier::new("rules", vec![], &[spec("^buy ", Category::ToDo, 0.7)]).unwrap();
        assert!(plugin
            .classify(&Item::inbox("p", "sell milk", ""))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = RuleClassifier::new("rules", vec![], &[spec("(unclosed", Category::Task, 0.7)]);
        assert!(err.is_err());
    }

    #[test]
    fn spec_deserializes_from_toml_shape() {
        let spec: RuleSpec = serde_json::from_str(
            r#"{"pattern": "buy", "category": "ToDo", "score": 0.7}"#,
        )
        .unwrap();
        assert_eq!(spec.category, Category::ToDo);
        assert!(spec.tags.is_empty());
    }
}
