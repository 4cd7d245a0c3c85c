//! Core data models used throughout PRISM.
//!
//! These types represent the items that flow from the knowledge store's
//! inbox through classification and back into typed collections, plus the
//! per-run bookkeeping surfaced to operators.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A collection in the knowledge store.
///
/// `Inbox` is the source of unclassified items; the other six are the
/// typed destinations a classified item is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Inbox,
    Task,
    ToDo,
    Knowledge,
    Note,
    Project,
    Habit,
}

impl DatabaseKind {
    /// All destination collections, in declaration order.
    pub const DESTINATIONS: [DatabaseKind; 6] = [
        DatabaseKind::Task,
        DatabaseKind::ToDo,
        DatabaseKind::Knowledge,
        DatabaseKind::Note,
        DatabaseKind::Project,
        DatabaseKind::Habit,
    ];

    /// Lowercase identifier used in config files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Inbox => "inbox",
            DatabaseKind::Task => "task",
            DatabaseKind::ToDo => "todo",
            DatabaseKind::Knowledge => "knowledge",
            DatabaseKind::Note => "note",
            DatabaseKind::Project => "project",
            DatabaseKind::Habit => "habit",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(DatabaseKind::Inbox),
            "task" => Ok(DatabaseKind::Task),
            "todo" | "to-do" | "to_do" => Ok(DatabaseKind::ToDo),
            "knowledge" => Ok(DatabaseKind::Knowledge),
            "note" => Ok(DatabaseKind::Note),
            "project" => Ok(DatabaseKind::Project),
            "habit" => Ok(DatabaseKind::Habit),
            other => Err(format!("unknown database kind: '{}'", other)),
        }
    }
}

/// Processing state of a source item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Classified,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "Pending",
            ItemStatus::Classified => "Classified",
            ItemStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "inbox" => Ok(ItemStatus::Pending),
            "classified" => Ok(ItemStatus::Classified),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(format!("unknown item status: '{}'", other)),
        }
    }
}

/// The category a classifier assigns to an item.
///
/// Every variant except `Unclassified` maps to a destination collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    Task,
    ToDo,
    Knowledge,
    Note,
    Project,
    Habit,
    Unclassified,
}

impl Category {
    /// The collection a result of this category is written to.
    pub fn destination(&self) -> Option<DatabaseKind> {
        match self {
            Category::Task => Some(DatabaseKind::Task),
            Category::ToDo => Some(DatabaseKind::ToDo),
            Category::Knowledge => Some(DatabaseKind::Knowledge),
            Category::Note => Some(DatabaseKind::Note),
            Category::Project => Some(DatabaseKind::Project),
            Category::Habit => Some(DatabaseKind::Habit),
            Category::Unclassified => None,
        }
    }

    /// Lowercase label used to match plugin label sets against item labels.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Task => "task",
            Category::ToDo => "todo",
            Category::Knowledge => "knowledge",
            Category::Note => "note",
            Category::Project => "project",
            Category::Habit => "habit",
            Category::Unclassified => "unclassified",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Task => "Task",
            Category::ToDo => "ToDo",
            Category::Knowledge => "Knowledge",
            Category::Note => "Note",
            Category::Project => "Project",
            Category::Habit => "Habit",
            Category::Unclassified => "Unclassified",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task" => Ok(Category::Task),
            "todo" | "to-do" | "to_do" => Ok(Category::ToDo),
            "knowledge" => Ok(Category::Knowledge),
            "note" => Ok(Category::Note),
            "project" => Ok(Category::Project),
            "habit" => Ok(Category::Habit),
            "unclassified" => Ok(Category::Unclassified),
            other => Err(format!("unknown category: '{}'", other)),
        }
    }
}

impl From<DatabaseKind> for Option<Category> {
    fn from(kind: DatabaseKind) -> Self {
        match kind {
            DatabaseKind::Inbox => None,
            DatabaseKind::Task => Some(Category::Task),
            DatabaseKind::ToDo => Some(Category::ToDo),
            DatabaseKind::Knowledge => Some(Category::Knowledge),
            DatabaseKind::Note => Some(Category::Note),
            DatabaseKind::Project => Some(Category::Project),
            DatabaseKind::Habit => Some(Category::Habit),
        }
    }
}

/// One unit of work read from the knowledge store.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Opaque remote identifier; the idempotency key for every write.
    pub source_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub database_kind: DatabaseKind,
    pub status: ItemStatus,
    /// Lowercase label hints (source tags) used for plugin applicability.
    pub labels: BTreeSet<String>,
    /// Due date, for records in collections that carry one.
    pub due: Option<NaiveDate>,
}

impl Item {
    /// A pending inbox item with no labels.
    pub fn inbox(source_id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            body: body.into(),
            created_at: Utc::now(),
            database_kind: DatabaseKind::Inbox,
            status: ItemStatus::Pending,
            labels: BTreeSet::new(),
            due: None,
        }
    }

    /// Title and body joined for text scanning.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

/// The outcome of classifying one distinct piece of content.
///
/// Produced at most once per fingerprint and cached; never mutated after
/// it leaves the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub confidence: f64,
    pub tags: BTreeSet<String>,
    pub extracted_info: BTreeMap<String, String>,
    pub summary: String,
}

impl ClassificationResult {
    pub fn is_unclassified(&self) -> bool {
        self.category == Category::Unclassified
    }

    /// Due date recorded under `extracted_info["due"]`, if any.
    pub fn due(&self) -> Option<NaiveDate> {
        self.extracted_info
            .get("due")
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }
}

/// Which pipeline a [`BatchRun`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Classification,
    Mirror,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Classification => "classification",
            RunKind::Mirror => "mirror",
        }
    }
}

/// Lifecycle of one batch run.
///
/// `Started → Fetching → Processing → Completed | PartiallyFailed`, or
/// `Aborted` when a run-fatal provider error stops the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchState {
    Started,
    Fetching,
    Processing,
    Completed,
    PartiallyFailed,
    Aborted,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::PartiallyFailed | BatchState::Aborted
        )
    }
}

/// A per-item failure recorded against a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub source_id: String,
    pub error: String,
}

/// Summary of one scheduler-triggered pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub run_id: String,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: BatchState,
    pub item_count: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    /// Items dropped because their `source_id` was already dispatched this run.
    pub skipped: u64,
    pub failures: Vec<ItemFailure>,
    /// Items whose upsert overwrote diverging prior records. They still
    /// count as succeeded.
    #[serde(default)]
    pub conflicts: Vec<ItemFailure>,
    /// Run-fatal error, when the run was aborted or a page could not be fetched.
    pub error: Option<String>,
}

impl BatchRun {
    pub fn start(run_id: impl Into<String>, kind: RunKind) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            started_at: Utc::now(),
            finished_at: None,
            state: BatchState::Started,
            item_count: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            skipped: 0,
            failures: Vec::new(),
            conflicts: Vec::new(),
            error: None,
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, source_id: impl Into<String>, error: impl fmt::Display) {
        self.failed += 1;
        self.failures.push(ItemFailure {
            source_id: source_id.into(),
            error: error.to_string(),
        });
    }

    pub fn record_conflict(&mut self, source_id: impl Into<String>, error: impl fmt::Display) {
        self.conflicts.push(ItemFailure {
            source_id: source_id.into(),
            error: error.to_string(),
        });
    }

    /// Mark the run aborted by a run-fatal error.
    pub fn abort(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
        self.state = BatchState::Aborted;
        self.finished_at = Some(Utc::now());
    }

    /// Move to the terminal state implied by the counters.
    ///
    /// An aborted run stays aborted. A run that recorded a page-level error
    /// or any item failure ends `PartiallyFailed`.
    pub fn finish(&mut self) {
        if self.state != BatchState::Aborted {
            self.state = if self.failed > 0 || self.error.is_some() {
                BatchState::PartiallyFailed
            } else {
                BatchState::Completed
            };
        }
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_kind_parses_config_spellings() {
        assert_eq!("ToDo".parse::<DatabaseKind>().unwrap(), DatabaseKind::ToDo);
        assert_eq!("to-do".parse::<DatabaseKind>().unwrap(), DatabaseKind::ToDo);
        assert_eq!(" Habit ".parse::<DatabaseKind>().unwrap(), DatabaseKind::Habit);
        assert!("archive".parse::<DatabaseKind>().is_err());
    }

    #[test]
    fn unclassified_has_no_destination() {
        assert_eq!(Category::Unclassified.destination(), None);
        for kind in DatabaseKind::DESTINATIONS {
            let category: Option<Category> = kind.into();
            assert_eq!(category.and_then(|c| c.destination()), Some(kind));
        }
    }

    #[test]
    fn finish_derives_terminal_state() {
        let mut run = BatchRun::start("r1", RunKind::Classification);
        run.record_success();
        run.finish();
        assert_eq!(run.state, BatchState::Completed);

        let mut run = BatchRun::start("r2", RunKind::Classification);
        run.record_success();
        run.record_failure("item-3", "write failed");
        run.finish();
        assert_eq!(run.state, BatchState::PartiallyFailed);
        assert_eq!(run.failures[0].source_id, "item-3");
    }

    #[test]
    fn aborted_run_stays_aborted() {
        let mut run = BatchRun::start("r3", RunKind::Mirror);
        run.abort("unauthorized");
        run.finish();
        assert_eq!(run.state, BatchState::Aborted);
        assert!(run.state.is_terminal());
    }

    #[test]
    fn result_due_reads_extracted_info() {
        let mut result = ClassificationResult {
            category: Category::Task,
            confidence: 0.9,
            tags: BTreeSet::new(),
            extracted_info: BTreeMap::new(),
            summary: String::new(),
        };
        assert_eq!(result.due(), None);
        result
            .extracted_info
            .insert("due".to_string(), "2025-10-25".to_string());
        assert_eq!(result.due(), NaiveDate::from_ymd_opt(2025, 10, 25));
    }
}
