//! Engine error taxonomy.
//!
//! Per-item errors are recorded on the [`BatchRun`](prism_core::BatchRun)
//! and never abort the batch. [`Error::Unauthorized`] aborts the current
//! run only; the scheduler still fires on its next tick. A
//! [`Error::WriteConflict`] is recorded on the run without failing the
//! item. Configuration errors surface from [`crate::config`] as `anyhow`
//! errors at startup.

use prism_core::store::ProviderError;
use prism_core::RegistryError;

use crate::ratelimit::Provider;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Listing the source collection failed.
    #[error("fetch failed: {0}")]
    Fetch(ProviderError),

    /// Retries against a provider's budget ran out while throttled.
    #[error("rate limit exhausted for {provider} after {attempts} attempts")]
    RateLimitExhausted { provider: Provider, attempts: u32 },

    /// Every applicable classifier plugin failed.
    #[error("classification failed: {0}")]
    Classification(String),

    /// No plugin reached the confidence threshold.
    #[error("no confident classification: {0}")]
    NoConfidentClassification(String),

    #[error("write failed: {0}")]
    Write(ProviderError),

    /// An upsert found conflicting prior records; the newest was overwritten.
    #[error("write conflict on {source_id}: prior record overwritten")]
    WriteConflict { source_id: String },

    /// Credentials rejected by a provider; fatal for the current run.
    #[error("unauthorized by {provider}: {message}")]
    Unauthorized { provider: Provider, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error should abort the whole run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Error::Unauthorized { .. } | Error::Cancelled)
    }

    /// Wrap a provider error that was not retried into the matching variant.
    pub fn from_provider(provider: Provider, err: ProviderError, wrap: fn(ProviderError) -> Error) -> Error {
        match err {
            ProviderError::Unauthorized(message) => Error::Unauthorized { provider, message },
            other => wrap(other),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Error::Classification(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
