//! Builds the [`ClassifierRegistry`] from configuration.
//!
//! Registration order is fixed, and it decides ties (the earliest plugin wins):
//!
//! ```text
//! keyword presets (config order) → regex rules → llm (if enabled)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use prism_core::classify::keyword::KeywordClassifier;
use prism_core::classify::rules::RuleClassifier;
use prism_core::ClassifierRegistry;

use crate::classifier_llm::LlmClassifier;
use crate::config::{Config, Credentials};
use crate::ratelimit::RateLimiter;

pub fn registry_from_config(
    config: &Config,
    credentials: &Credentials,
    limiter: Arc<RateLimiter>,
) -> Result<ClassifierRegistry> {
    let classifier = &config.classifier;
    let mut registry = ClassifierRegistry::new(classifier.min_confidence);

    for preset in &classifier.presets {
        let plugin = KeywordClassifier::preset(preset)
            .with_context(|| format!("Unknown classifier preset: '{}'", preset))?;
        registry.register(plugin);
    }

    if !classifier.rules.is_empty() {
        registry.register(RuleClassifier::new("rules", Vec::new(), &classifier.rules)?);
    }

    if classifier.llm.enabled {
        let api_key = credentials
            .openai_api_key
            .clone()
            .context("OPENAI_API_KEY is required when classifier.llm.enabled = true")?;
        registry.register(LlmClassifier::new(&classifier.llm, api_key, limiter)?);
    }

    tracing::info!(plugins = ?registry.names(), min_confidence = registry.min_confidence(), "classifier registry ready");
    Ok(registry)
}
