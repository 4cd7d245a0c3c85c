//! Classifier plugins and the ordered registry that arbitrates between them.
//!
//! A [`Classifier`] inspects one preprocessed [`Item`] and either returns a
//! [`PluginVerdict`] or abstains with `None`. The [`ClassifierRegistry`]
//! holds plugins in registration order and turns their verdicts into a
//! single [`ClassificationResult`]:
//!
//! ```text
//!  item ──▶ applicable plugins (capability, then labels if any plugin claims one)
//!             │  run concurrently, results kept in registration order
//!             ▼
//!           verdicts ──▶ highest score (ties: earliest registered)
//!                          │
//!             score ≥ min_confidence ? category : Unclassified
//! ```
//!
//! Item labels select plugins only when some plugin declares one of them;
//! an item whose labels no plugin claims is offered to every plugin. On a
//! confident result the item's own labels are merged into the result tags.
//!
//! A plugin that returns an error, or a score that is not a finite number,
//! is logged and treated as an abstention. Only when *every* applicable plugin errors does the registry
//! return [`RegistryError::AllPluginsFailed`], so the caller can skip
//! caching and retry on the next run.
//!
//! # Usage
//!
//! ```rust
//! use prism_core::classify::{keyword::KeywordClassifier, ClassifierRegistry};
//!
//! let mut registry = ClassifierRegistry::new(0.6);
//! registry.register(KeywordClassifier::task());
//! registry.register(KeywordClassifier::knowledge());
//! assert_eq!(registry.len(), 2);
//! ```

pub mod keyword;
pub mod rules;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;

use crate::models::{Category, ClassificationResult, Item};
use crate::preprocess::summarize;

/// Default minimum score a verdict needs to be accepted.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.6;

// ═══════════════════════════════════════════════════════════════════════
// Plugin contract
// ═══════════════════════════════════════════════════════════════════════

/// What a plugin can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Assigns a category with a score.
    Classify,
    /// Fills [`PluginVerdict::extracted`] with structured fields (e.g. `due`).
    Extract,
}

/// One plugin's answer for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginVerdict {
    pub category: Category,
    /// Confidence in `[0, 1]`; values outside are clamped by the registry.
    pub score: f64,
    pub tags: BTreeSet<String>,
    /// Short human-readable explanation, recorded as `extracted_info["reason"]`.
    pub reason: String,
    /// Extra fields; only honoured for plugins with [`Capability::Extract`].
    pub extracted: BTreeMap<String, String>,
}

impl PluginVerdict {
    pub fn new(category: Category, score: f64, reason: impl Into<String>) -> Self {
        Self {
            category,
            score,
            tags: BTreeSet::new(),
            reason: reason.into(),
            extracted: BTreeMap::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A classification plugin.
///
/// Implementations must be `Send + Sync`; the registry calls them
/// concurrently from many item pipelines.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use prism_core::classify::{Classifier, PluginVerdict};
/// use prism_core::models::{Category, Item};
///
/// struct ShoppingList;
///
/// #[async_trait]
/// impl Classifier for ShoppingList {
///     fn name(&self) -> &str { "shopping" }
///
///     async fn classify(&self, item: &Item) -> Result<Option<PluginVerdict>> {
///         if item.text().to_lowercase().contains("buy") {
///             return Ok(Some(PluginVerdict::new(Category::ToDo, 0.7, "shopping word")));
///         }
///         Ok(None)
///     }
/// }
/// ```
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Unique plugin name, recorded as `extracted_info["plugin"]`.
    fn name(&self) -> &str;

    /// Lowercase labels this plugin handles. Empty means "any item".
    fn labels(&self) -> &[String] {
        &[]
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Classify]
    }

    /// Classify one preprocessed item, or abstain with `Ok(None)`.
    async fn classify(&self, item: &Item) -> Result<Option<PluginVerdict>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Errors returned by [`ClassifierRegistry::classify`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Every applicable plugin returned an error.
    #[error("all {} applicable classifier plugins failed: {}", .failures.len(), format_failures(.failures))]
    AllPluginsFailed { failures: Vec<(String, String)> },
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{}: {}", name, err))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ordered collection of classifier plugins.
pub struct ClassifierRegistry {
    plugins: Vec<Arc<dyn Classifier>>,
    min_confidence: f64,
}

impl std::fmt::Debug for ClassifierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierRegistry")
            .field("plugins", &self.names())
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}

impl ClassifierRegistry {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            plugins: Vec::new(),
            min_confidence,
        }
    }

    /// Append a plugin. Earlier plugins win score ties.
    pub fn register<C: Classifier + 'static>(&mut self, plugin: C) -> &mut Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Append an already shared plugin.
    pub fn register_arc(&mut self, plugin: Arc<dyn Classifier>) -> &mut Self {
        self.plugins.push(plugin);
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// Plugin names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    fn claims_label(plugin: &dyn Classifier, item: &Item) -> bool {
        plugin.labels().iter().any(|l| item.labels.contains(l))
    }

    /// Classify-capable plugins for `item`, in registration order.
    fn applicable(&self, item: &Item) -> Vec<&Arc<dyn Classifier>> {
        let classifiers: Vec<&Arc<dyn Classifier>> = self
            .plugins
            .iter()
            .filter(|p| p.capabilities().contains(&Capability::Classify))
            .collect();
        if !classifiers.iter().any(|p| Self::claims_label(p.as_ref(), item)) {
            return classifiers;
        }
        classifiers
            .into_iter()
            .filter(|p| p.labels().is_empty() || Self::claims_label(p.as_ref(), item))
            .collect()
    }

    /// Classify an item with every applicable plugin and pick a winner.
    ///
    /// The returned result always carries `reason` and, when a plugin won,
    /// `plugin` in `extracted_info`, plus a summary of the item.
    pub async fn classify(&self, item: &Item) -> Result<ClassificationResult, RegistryError> {
        let applicable = self.applicable(item);

        let outcomes = join_all(applicable.iter().map(|p| p.classify(item))).await;

        let mut failures = Vec::new();
        let mut best: Option<(&Arc<dyn Classifier>, PluginVerdict)> = None;
        for (plugin, outcome) in applicable.iter().copied().zip(outcomes) {
            match outcome {
                Ok(Some(verdict)) if !verdict.score.is_finite() => {
                    tracing::warn!(plugin = plugin.name(), source_id = %item.source_id, score = verdict.score, "non-finite score; treating as abstention");
                }
                Ok(Some(mut verdict)) => {
                    verdict.score = verdict.score.clamp(0.0, 1.0);
                    let better = match &best {
                        Some((_, current)) => verdict.score > current.score,
                        None => true,
                    };
                    if better {
                        best = Some((plugin, verdict));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(plugin = plugin.name(), source_id = %item.source_id, error = %e, "classifier plugin failed; treating as abstention");
                    failures.push((plugin.name().to_string(), e.to_string()));
                }
            }
        }

        if !applicable.is_empty() && failures.len() == applicable.len() {
            return Err(RegistryError::AllPluginsFailed { failures });
        }

        let summary = summarize(&item.title, &item.body);
        let mut extracted_info = BTreeMap::new();

        let Some((plugin, verdict)) = best else {
            extracted_info.insert("reason".to_string(), "no plugin produced a verdict".to_string());
            return Ok(ClassificationResult {
                category: Category::Unclassified,
                confidence: 0.0,
                tags: BTreeSet::new(),
                extracted_info,
                summary,
            });
        };

        extracted_info.insert("plugin".to_string(), plugin.name().to_string());

        if verdict.score < self.min_confidence || verdict.category == Category::Unclassified {
            extracted_info.insert(
                "reason".to_string(),
                format!(
                    "best score {:.2} ({} from {}) below threshold {:.2}: {}",
                    verdict.score,
                    verdict.category,
                    plugin.name(),
                    self.min_confidence,
                    verdict.reason
                ),
            );
            return Ok(ClassificationResult {
                category: Category::Unclassified,
                confidence: verdict.score,
                tags: BTreeSet::new(),
                extracted_info,
                summary,
            });
        }

        if plugin.capabilities().contains(&Capability::Extract) {
            extracted_info.extend(verdict.extracted);
        }
        extracted_info.insert("reason".to_string(), verdict.reason);
        extracted_info.insert("plugin".to_string(), plugin.name().to_string());

        let mut tags = verdict.tags;
        tags.extend(item.labels.iter().cloned());

        Ok(ClassificationResult {
            category: verdict.category,
            confidence: verdict.score,
            tags,
            extracted_info,
            summary,
        })
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_CONFIDENCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Fixed {
        name: &'static str,
        verdict: Option<(Category, f64)>,
        labels: Vec<String>,
        tags: Vec<&'static str>,
    }

    impl Fixed {
        fn new(name: &'static str, category: Category, score: f64) -> Self {
            Self {
                name,
                verdict: Some((category, score)),
                labels: Vec::new(),
                tags: Vec::new(),
            }
        }

        fn abstain(name: &'static str) -> Self {
            Self {
                name,
                verdict: None,
                labels: Vec::new(),
                tags: Vec::new(),
            }
        }

        fn labelled(mut self, label: &str) -> Self {
            self.labels.push(label.to_string());
            self
        }

        fn tagged(mut self, tag: &'static str) -> Self {
            self.tags.push(tag);
            self
        }
    }

    #[async_trait]
    impl Classifier for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn labels(&self) -> &[String] {
            &self.labels
        }

        async fn classify(&self, _item: &Item) -> Result<Option<PluginVerdict>> {
            Ok(self.verdict.map(|(c, s)| {
                PluginVerdict::new(c, s, format!("{} says so", self.name)).with_tags(self.tags.iter().copied())
            }))
        }
    }

    struct Broken;

    #[async_trait]
    impl Classifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn classify(&self, _item: &Item) -> Result<Option<PluginVerdict>> {
            bail!("upstream exploded")
        }
    }

    fn item() -> Item {
        Item::inbox("p1", "title", "body")
    }

    #[tokio::test]
    async fn highest_score_wins() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::new("a", Category::Note, 0.7));
        reg.register(Fixed::new("b", Category::Task, 0.9));
        let result = reg.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Task);
        assert_eq!(result.extracted_info["plugin"], "b");
        assert_eq!(result.summary, "body");
    }

    #[tokio::test]
    async fn tie_goes_to_first_registered() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::new("x", Category::Knowledge, 0.8));
        reg.register(Fixed::new("y", Category::Task, 0.8));
        for _ in 0..5 {
            let result = reg.classify(&item()).await.unwrap();
            assert_eq!(result.category, Category::Knowledge);
        }
    }

    #[tokio::test]
    async fn failing_plugin_is_an_abstention() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Broken);
        reg.register(Fixed::new("ok", Category::Note, 0.75));
        let result = reg.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Note);
    }

    #[tokio::test]
    async fn all_failed_is_an_error() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Broken);
        let err = reg.classify(&item()).await.unwrap_err();
        assert!(err.to_string().contains("upstream exploded"));
    }

    #[tokio::test]
    async fn below_threshold_is_unclassified() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::new("weak", Category::Task, 0.4));
        let result = reg.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Unclassified);
        assert!(result.extracted_info["reason"].contains("below threshold"));
    }

    #[tokio::test]
    async fn score_equal_to_threshold_passes() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::new("edge", Category::Habit, 0.6));
        let result = reg.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Habit);
    }

    #[tokio::test]
    async fn only_abstentions_is_unclassified() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::abstain("quiet"));
        let result = reg.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Unclassified);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn claimed_labels_filter_applicable_plugins() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::new("home", Category::Habit, 0.95).labelled("home"));
        reg.register(Fixed::new("work", Category::Project, 0.8).labelled("work"));
        reg.register(Fixed::new("any", Category::Note, 0.7));

        let mut labelled = item();
        labelled.labels.insert("work".to_string());
        let result = reg.classify(&labelled).await.unwrap();
        assert_eq!(result.category, Category::Project);

        let result = reg.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Habit);
    }

    #[tokio::test]
    async fn unclaimed_labels_fall_back_to_every_plugin() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::new("task", Category::Task, 0.8).labelled("task").tagged("task"));
        reg.register(Fixed::new("note", Category::Note, 0.7).labelled("note"));

        let mut labelled = item();
        labelled.labels.insert("errand".to_string());
        let result = reg.classify(&labelled).await.unwrap();
        assert_eq!(result.category, Category::Task);
        assert_eq!(
            result.tags,
            BTreeSet::from(["errand".to_string(), "task".to_string()])
        );
    }

    #[tokio::test]
    async fn non_finite_score_is_an_abstention() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::new("nan", Category::Habit, f64::NAN));
        reg.register(Fixed::new("inf", Category::Habit, f64::INFINITY));
        reg.register(Fixed::new("ok", Category::Task, 0.7));
        let result = reg.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Task);
        assert_eq!(result.extracted_info["plugin"], "ok");

        let mut only_nan = ClassifierRegistry::new(0.6);
        only_nan.register(Fixed::new("nan", Category::Habit, f64::NAN));
        let result = only_nan.classify(&item()).await.unwrap();
        assert_eq!(result.category, Category::Unclassified);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn debug_lists_plugin_names() {
        let mut reg = ClassifierRegistry::new(0.6);
        reg.register(Fixed::abstain("quiet"));
        let shown = format!("{:?}", reg);
        assert!(shown.contains("quiet"));
        assert!(shown.contains("0.6"));
    }
}
