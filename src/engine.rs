//! Engine facade: wires the components together and exposes the operator
//! trigger.
//!
//! ```text
//!                      ┌──────────────┐
//!   Scheduler ────────▶│ Coordinator  │──▶ Fetcher ─▶ Cache/Registry ─▶ Writer ──┐
//!   (engine.interval)  └──────────────┘                                          │
//!                                                                   RateLimiter ─┤─▶ Notion
//!   Scheduler ────────▶┌──────────────┐                                          │
//!   (mirror.interval)  │    Mirror    │──▶ Fetcher / Writer / Calendar ──────────┘─▶ Calendar
//!                      └──────────────┘
//! ```
//!
//! [`Engine::from_config`] builds the production wiring (Notion, Google
//! Calendar, configured plugins). [`Engine::new`] accepts any
//! [`KnowledgeStore`] and [`CalendarService`], which is how the integration
//! tests run the whole engine against in-memory fakes.

use std::sync::Arc;

use anyhow::Context;
use prism_core::models::{BatchRun, RunKind};
use prism_core::{CalendarService, ClassifierRegistry, KnowledgeStore};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{ClassificationCache, SqliteCacheBackend};
use crate::calendar_google::GoogleCalendar;
use crate::config::{Config, Credentials};
use crate::coordinator::{Coordinator, ItemPipeline};
use crate::error::Result;
use crate::fetcher::Fetcher;
use crate::mirror::Mirror;
use crate::ratelimit::RateLimiter;
use crate::scheduler::{Scheduler, TickOutcome};
use crate::store_notion::NotionStore;
use crate::writer::Writer;
use crate::{db, migrate, plugins};

pub struct Engine {
    cache: Arc<ClassificationCache>,
    limiter: Arc<RateLimiter>,
    classification: Arc<Scheduler>,
    mirror: Option<Arc<Scheduler>>,
    pool: SqlitePool,
    cancel: CancellationToken,
    purge: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the production engine: open and migrate the database, then
    /// wire the Notion store, configured plugins and (if enabled) Google
    /// Calendar.
    pub async fn from_config(config: &Config, credentials: &Credentials) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let store: Arc<dyn KnowledgeStore> =
            Arc::new(NotionStore::new(&config.notion, credentials.notion_api_key.clone())?);
        let registry = plugins::registry_from_config(config, credentials, limiter.clone())?;
        let calendar: Option<Arc<dyn CalendarService>> = if config.mirror.enabled {
            let token = credentials
                .google_calendar_token
                .clone()
                .context("GOOGLE_CALENDAR_TOKEN is required when mirror.enabled = true")?;
            Some(Arc::new(GoogleCalendar::new(&config.mirror, token)?))
        } else {
            None
        };

        Ok(Self::new(config, pool, limiter, store, registry, calendar))
    }

    /// Wire an engine from already constructed parts. The mirror is built
    /// only when a calendar is given and `mirror.enabled` is set.
    pub fn new(
        config: &Config,
        pool: SqlitePool,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn KnowledgeStore>,
        registry: ClassifierRegistry,
        calendar: Option<Arc<dyn CalendarService>>,
    ) -> Self {
        let mut cache = ClassificationCache::new(config.engine.cache_ttl());
        if config.engine.durable_cache {
            cache = cache.with_backend(Arc::new(SqliteCacheBackend::new(pool.clone())));
        }
        let cache = Arc::new(cache);

        let fetcher = Arc::new(Fetcher::new(store.clone(), limiter.clone(), config.engine.page_size));
        let writer = Arc::new(Writer::new(store, limiter.clone()));
        let pipeline = Arc::new(ItemPipeline::new(Arc::new(registry), cache.clone(), writer.clone()));

        let coordinator = Coordinator::new(fetcher.clone(), pipeline, limiter.clone(), config.engine.concurrency)
            .with_pool(pool.clone());
        let classification = Arc::new(
            Scheduler::new(Arc::new(coordinator), config.engine.interval())
                .with_history(pool.clone(), RunKind::Classification),
        );

        let mirror = match calendar {
            Some(calendar) if config.mirror.enabled => {
                let mirror = Mirror::new(fetcher, writer, calendar, limiter.clone(), &config.mirror)
                    .with_pool(pool.clone());
                Some(Arc::new(
                    Scheduler::new(Arc::new(mirror), config.mirror.interval())
                        .with_history(pool.clone(), RunKind::Mirror),
                ))
            }
            _ => None,
        };

        Self {
            cache,
            limiter,
            classification,
            mirror,
            pool,
            cancel: CancellationToken::new(),
            purge: std::sync::Mutex::new(None),
        }
    }

    /// Run a classification batch now, unless one is in progress.
    pub async fn trigger_batch_now(&self) -> TickOutcome {
        self.classification.trigger_now().await
    }

    /// Run a mirror pass now. `None` when the mirror is not configured.
    pub async fn trigger_mirror_now(&self) -> Option<TickOutcome> {
        match &self.mirror {
            Some(mirror) => Some(mirror.trigger_now().await),
            None => None,
        }
    }

    /// Most recent classification run, surviving restarts.
    pub async fn last_run_status(&self) -> Result<Option<BatchRun>> {
        self.classification.last_run().await
    }

    pub async fn last_mirror_status(&self) -> Result<Option<BatchRun>> {
        match &self.mirror {
            Some(mirror) => mirror.last_run().await,
            None => crate::runs::last_run(&self.pool, RunKind::Mirror).await,
        }
    }

    pub fn mirror_enabled(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Start the schedulers and the periodic cache purge.
    pub fn start(&self) {
        self.classification.start();
        if let Some(mirror) = &self.mirror {
            mirror.start();
        }

        let cache = self.cache.clone();
        let cancel = self.cancel.clone();
        let every = cache.ttl().max(std::time::Duration::from_secs(60));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match cache.purge_expired().await {
                        Ok(dropped) => tracing::debug!(dropped, "purged expired cache entries"),
                        Err(e) => tracing::warn!(error = %e, "cache purge failed"),
                    },
                }
            }
        });
        *self.purge.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop scheduling and wait for in-flight runs.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let purge = self.purge.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = purge {
            let _ = handle.await;
        }
        let mirror = async {
            if let Some(mirror) = &self.mirror {
                mirror.shutdown().await;
            }
        };
        tokio::join!(self.classification.shutdown(), mirror);
        self.pool.close().await;
    }
}
