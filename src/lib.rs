//! # PRISM
//!
//! Inbox classification and sync engine.
//!
//! PRISM reads unstructured items from a knowledge store inbox, classifies
//! each one (Task, ToDo, Knowledge, Note, Project, Habit) with a registry of
//! pluggable classifiers, and writes the structured result back to typed
//! collections in the same store. A second pipeline keeps due-dated
//! records mirrored against a calendar.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────────────────────┐   ┌──────────┐
//! │ Scheduler │──▶│ Fetcher ─▶ Preprocess ─▶ Cache/Registry  │──▶│  Writer  │
//! └───────────┘   │      (fan-out under a concurrency cap)   │   └────┬─────┘
//!                 └──────────────────────────────────────────┘        │
//!                                  ▲ every external call              ▼
//!                           ┌──────┴──────┐                  ┌──────────────┐
//!                           │ RateLimiter │─────────────────▶│ Notion / LLM │
//!                           └─────────────┘                  │ / Calendar   │
//!                                                            └──────────────┘
//! ```
//!
//! Pure domain logic (models, fingerprinting, preprocessing, plugins, store
//! and calendar contracts) lives in the `prism-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and credentials |
//! | [`error`] | Engine error taxonomy |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`ratelimit`] | Per-provider token buckets, backoff and retry |
//! | [`cache`] | Single-flight TTL classification cache |
//! | [`fetcher`] | Paged reads from the knowledge store |
//! | [`writer`] | Idempotent write-back |
//! | [`coordinator`] | One classification pass |
//! | [`scheduler`] | Interval scheduling without overlap |
//! | [`mirror`] | Calendar/task mirror |
//! | [`engine`] | Wiring and operator trigger |
//! | [`plugins`] / [`classifier_llm`] | Classifier registry assembly, LLM plugin |
//! | [`store_notion`] / [`calendar_google`] | HTTP adapters |
//! | [`checkpoint`] / [`runs`] | Pagination checkpoints, run history |
//! | [`status`] | `prism status` report |
//! | [`http`] | Shared HTTP error mapping for the adapters |

pub mod cache;
pub mod calendar_google;
pub mod checkpoint;
pub mod classifier_llm;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod logging;
pub mod migrate;
pub mod mirror;
pub mod plugins;
pub mod ratelimit;
pub mod runs;
pub mod scheduler;
pub mod status;
pub mod store_notion;
pub mod writer;
