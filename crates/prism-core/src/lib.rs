//! # PRISM Core
//!
//! Shared, I/O-free logic for PRISM: the item data model, content
//! fingerprinting, preprocessing and summaries, due-date extraction, the
//! classifier plugin contract with its ordered registry, and the contracts
//! for the knowledge store and calendar providers (with in-memory
//! implementations used by tests and dry runs).
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. Everything that
//! talks to the network lives in the `prism` app crate.

pub mod calendar;
pub mod classify;
pub mod extract;
pub mod fingerprint;
pub mod models;
pub mod preprocess;
pub mod store;

pub use calendar::{CalendarEvent, CalendarService, DateRange};
pub use classify::{Capability, Classifier, ClassifierRegistry, PluginVerdict, RegistryError};
pub use fingerprint::{fingerprint, Fingerprint};
pub use models::{
    BatchRun, BatchState, Category, ClassificationResult, DatabaseKind, Item, ItemStatus, RunKind,
};
pub use preprocess::{preprocess, summarize};
pub use store::{
    KnowledgeStore, ListFilter, Page, ProviderError, RecordFields, SourcePatch, UpsertReceipt,
};
