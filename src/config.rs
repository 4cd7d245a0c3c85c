//! Configuration loading and validation.
//!
//! PRISM reads one TOML file (default `config/prism.toml`) into an
//! immutable [`Config`] at startup and passes it by reference to every
//! component. Nothing reads configuration or environment variables
//! mid-run.
//!
//! Credentials never live in the file. [`Credentials::from_env`] reads
//! them once, and a missing required credential is fatal at start.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/prism.sqlite"
//!
//! [engine]
//! interval_secs = 60
//! concurrency = 4
//!
//! [notion.databases]
//! inbox = "0f3c..."
//! task = "1a2b..."
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use prism_core::classify::rules::RuleSpec;
use prism_core::models::DatabaseKind;
use serde::Deserialize;

use crate::ratelimit::Provider;

pub const NOTION_API_KEY_ENV: &str = "NOTION_API_KEY";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const GOOGLE_CALENDAR_TOKEN_ENV: &str = "GOOGLE_CALENDAR_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notion: NotionConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ── engine ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Keep classifications in SQLite so they survive restarts.
    #[serde(default = "default_true")]
    pub durable_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            concurrency: default_concurrency(),
            page_size: default_page_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
            durable_cache: true,
        }
    }
}

impl EngineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_interval_secs() -> u64 {
    60
}
fn default_concurrency() -> usize {
    4
}
fn default_page_size() -> usize {
    100
}
fn default_cache_ttl_secs() -> u64 {
    6 * 60 * 60
}
fn default_true() -> bool {
    true
}

// ── logging ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// `EnvFilter` directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            filter: default_log_filter(),
        }
    }
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
fn default_log_filter() -> String {
    "prism=info,prism_core=info".to_string()
}

// ── notion ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct NotionConfig {
    #[serde(default = "default_notion_base_url")]
    pub base_url: String,
    #[serde(default = "default_notion_version")]
    pub version: String,
    /// Database id per collection, keyed by kind (`inbox`, `task`, ...).
    #[serde(default)]
    pub databases: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: NotionProperties,
}

impl Default for NotionConfig {
    fn default() -> Self {
        Self {
            base_url: default_notion_base_url(),
            version: default_notion_version(),
            databases: BTreeMap::new(),
            properties: NotionProperties::default(),
        }
    }
}

impl NotionConfig {
    pub fn database_id(&self, kind: DatabaseKind) -> Option<&str> {
        self.databases.get(kind.as_str()).map(String::as_str)
    }
}

fn default_notion_base_url() -> String {
    "https://api.notion.com/v1".to_string()
}
fn default_notion_version() -> String {
    "2022-06-28".to_string()
}

/// Property names used in every Notion database.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotionProperties {
    pub title: String,
    pub body: String,
    pub status: String,
    pub category: String,
    pub confidence: String,
    pub tags: String,
    pub due: String,
    pub source_id: String,
    pub classified_at: String,
    pub status_pending: String,
    pub status_classified: String,
    pub status_failed: String,
}

impl Default for NotionProperties {
    fn default() -> Self {
        Self {
            title: "タイトル".to_string(),
            body: "内容".to_string(),
            status: "ステータス".to_string(),
            category: "カテゴリ".to_string(),
            confidence: "信頼度".to_string(),
            tags: "タグ".to_string(),
            due: "期限".to_string(),
            source_id: "ソースID".to_string(),
            classified_at: "処理日時".to_string(),
            status_pending: "pending".to_string(),
            status_classified: "classified".to_string(),
            status_failed: "failed".to_string(),
        }
    }
}

// ── rate limits ─────────────────────────────────────────────────────────

/// Token bucket and retry policy for one provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderLimits {
    pub requests_per_second: u32,
    pub burst: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProviderLimits {
    fn with_rate(requests_per_second: u32, burst: u32, timeout_secs: u64) -> Self {
        Self {
            requests_per_second,
            burst,
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs,
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitsConfig {
    #[serde(default = "default_notion_limits")]
    pub notion: ProviderLimits,
    #[serde(default = "default_calendar_limits")]
    pub calendar: ProviderLimits,
    #[serde(default = "default_llm_limits")]
    pub llm: ProviderLimits,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            notion: default_notion_limits(),
            calendar: default_calendar_limits(),
            llm: default_llm_limits(),
        }
    }
}

impl RateLimitsConfig {
    pub fn for_provider(&self, provider: Provider) -> &ProviderLimits {
        match provider {
            Provider::Notion => &self.notion,
            Provider::Calendar => &self.calendar,
            Provider::Llm => &self.llm,
        }
    }
}

// Notion allows an average of three requests per second per integration.
fn default_notion_limits() -> ProviderLimits {
    ProviderLimits::with_rate(3, 3, 30)
}
fn default_calendar_limits() -> ProviderLimits {
    ProviderLimits::with_rate(5, 10, 30)
}
fn default_llm_limits() -> ProviderLimits {
    ProviderLimits::with_rate(2, 4, 60)
}

// ── classifier ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Built-in keyword presets, registered first and in this order.
    #[serde(default = "default_presets")]
    pub presets: Vec<String>,
    /// Regex rules, registered after the presets as one plugin.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            presets: default_presets(),
            rules: Vec::new(),
            llm: LlmConfig::default(),
        }
    }
}

fn default_min_confidence() -> f64 {
    prism_core::classify::DEFAULT_MIN_CONFIDENCE
}
fn default_presets() -> Vec<String> {
    vec!["task".to_string(), "knowledge".to_string(), "note".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            labels: Vec::new(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

// ── mirror ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct MirrorConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mirror_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
    #[serde(default = "default_calendar_base_url")]
    pub base_url: String,
    /// Collections whose due-dated records are pushed to the calendar.
    #[serde(default = "default_push_kinds")]
    pub push_kinds: Vec<DatabaseKind>,
    /// Collection that receives records pulled from calendar events.
    #[serde(default = "default_pull_destination")]
    pub pull_destination: DatabaseKind,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_mirror_interval_secs(),
            lookahead_days: default_lookahead_days(),
            calendar_id: default_calendar_id(),
            base_url: default_calendar_base_url(),
            push_kinds: default_push_kinds(),
            pull_destination: default_pull_destination(),
        }
    }
}

impl MirrorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_mirror_interval_secs() -> u64 {
    300
}

/// Ten years.
pub const MAX_LOOKAHEAD_DAYS: i64 = 3650;

fn default_lookahead_days() -> i64 {
    30
}
fn default_calendar_id() -> String {
    "primary".to_string()
}
fn default_calendar_base_url() -> String {
    "https://www.googleapis.com/calendar/v3".to_string()
}
fn default_push_kinds() -> Vec<DatabaseKind> {
    vec![DatabaseKind::Task, DatabaseKind::ToDo]
}
fn default_pull_destination() -> DatabaseKind {
    DatabaseKind::Task
}

// ── loading ─────────────────────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.engine.interval_secs == 0 {
        anyhow::bail!("engine.interval_secs must be > 0");
    }
    if config.engine.concurrency == 0 {
        anyhow::bail!("engine.concurrency must be > 0");
    }
    if !(1..=100).contains(&config.engine.page_size) {
        anyhow::bail!("engine.page_size must be in [1, 100]");
    }
    if !(0.0..=1.0).contains(&config.classifier.min_confidence) {
        anyhow::bail!("classifier.min_confidence must be in [0.0, 1.0]");
    }

    for key in config.notion.databases.keys() {
        key.parse::<DatabaseKind>()
            .map_err(|e| anyhow::anyhow!("notion.databases: {}", e))?;
    }

    for preset in &config.classifier.presets {
        match preset.as_str() {
            "task" | "knowledge" | "note" => {}
            other => anyhow::bail!(
                "Unknown classifier preset: '{}'. Must be task, knowledge, or note.",
                other
            ),
        }
    }
    for rule in &config.classifier.rules {
        if !(0.0..=1.0).contains(&rule.score) {
            anyhow::bail!("classifier.rules score for '{}' must be in [0.0, 1.0]", rule.pattern);
        }
    }

    for (name, limits) in [
        ("notion", &config.rate_limits.notion),
        ("calendar", &config.rate_limits.calendar),
        ("llm", &config.rate_limits.llm),
    ] {
        if limits.requests_per_second == 0 || limits.burst == 0 {
            anyhow::bail!("rate_limits.{}: requests_per_second and burst must be > 0", name);
        }
        if limits.timeout_secs == 0 {
            anyhow::bail!("rate_limits.{}.timeout_secs must be > 0", name);
        }
    }

    if config.mirror.enabled {
        if config.mirror.interval_secs == 0 {
            anyhow::bail!("mirror.interval_secs must be > 0");
        }
        if !(0..=MAX_LOOKAHEAD_DAYS).contains(&config.mirror.lookahead_days) {
            anyhow::bail!("mirror.lookahead_days must be between 0 and {}", MAX_LOOKAHEAD_DAYS);
        }
        if config.mirror.pull_destination == DatabaseKind::Inbox
            || config.mirror.push_kinds.contains(&DatabaseKind::Inbox)
        {
            anyhow::bail!("mirror collections must not include the inbox");
        }
    }

    Ok(())
}

/// Provider credentials, read once from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    pub notion_api_key: String,
    pub openai_api_key: Option<String>,
    pub google_calendar_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("notion_api_key", &"<redacted>")
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "<redacted>"))
            .field(
                "google_calendar_token",
                &self.google_calendar_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

fn required_env(name: &str, why: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => anyhow::bail!("{} environment variable is required {}", name, why),
    }
}

impl Credentials {
    /// Read the credentials the configured providers need.
    ///
    /// Also checks that the inbox database id is configured, since nothing
    /// can run without it.
    pub fn from_env(config: &Config) -> Result<Self> {
        if config.notion.database_id(DatabaseKind::Inbox).is_none() {
            anyhow::bail!("notion.databases.inbox must be set");
        }
        let notion_api_key = required_env(NOTION_API_KEY_ENV, "to reach the knowledge store")?;
        let openai_api_key = if config.classifier.llm.enabled {
            Some(required_env(OPENAI_API_KEY_ENV, "when classifier.llm.enabled = true")?)
        } else {
            None
        };
        let google_calendar_token = if config.mirror.enabled {
            Some(required_env(GOOGLE_CALENDAR_TOKEN_ENV, "when mirror.enabled = true")?)
        } else {
            None
        };
        Ok(Self {
            notion_api_key,
            openai_api_key,
            google_calendar_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config("[db]\npath = \"./data/prism.sqlite\"\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.engine.concurrency, 4);
        assert_eq!(config.engine.cache_ttl_secs, 21_600);
        assert_eq!(config.classifier.min_confidence, 0.6);
        assert_eq!(config.classifier.presets, vec!["task", "knowledge", "note"]);
        assert_eq!(config.rate_limits.notion.requests_per_second, 3);
        assert_eq!(config.notion.version, "2022-06-28");
        assert!(!config.mirror.enabled);
        assert_eq!(config.mirror.pull_destination, DatabaseKind::Task);
    }

    #[test]
    fn databases_and_rules_parse() {
        let file = write_config(
            r#"
[db]
path = "prism.sqlite"

[notion.databases]
inbox = "inbox-db"
todo = "todo-db"

[[classifier.rules]]
pattern = "habit|毎日"
category = "Habit"
score = 0.8
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.notion.database_id(DatabaseKind::Inbox), Some("inbox-db"));
        assert_eq!(config.notion.database_id(DatabaseKind::ToDo), Some("todo-db"));
        assert_eq!(config.classifier.rules.len(), 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let file = write_config("[db]\npath = \"x\"\n[engine]\nconcurrency = 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("concurrency"));

        let file = write_config("[db]\npath = \"x\"\n[classifier]\npresets = [\"habit\"]\n");
        assert!(load_config(file.path()).is_err());

        let file = write_config("[db]\npath = \"x\"\n[classifier]\nmin_confidence = 1.5\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn lookahead_beyond_ten_years_is_rejected() {
        let file = write_config("[db]\npath = \"x\"\n[mirror]\nenabled = true\nlookahead_days = 3651\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("mirror.lookahead_days"));

        let file = write_config("[db]\npath = \"x\"\n[mirror]\nenabled = true\nlookahead_days = 3650\n");
        assert!(load_config(file.path()).is_ok());
    }

    #[test]
    fn missing_inbox_database_is_fatal() {
        let file = write_config("[db]\npath = \"x\"\n");
        let config = load_config(file.path()).unwrap();
        let err = Credentials::from_env(&config).unwrap_err();
        assert!(err.to_string().contains("notion.databases.inbox"));
    }
}
