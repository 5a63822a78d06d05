// src/error.rs
//! Error taxonomy. Provider faults stay inside the coordinator; only
//! `AggregatorError` can reach a reader.

use std::time::Duration;

use thiserror::Error;

/// Why a single provider produced nothing usable this cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderFault {
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("extraction timed out after {0:?}")]
    TimedOut(Duration),
    #[error("extraction cancelled")]
    Cancelled,
    #[error("no extractor registered")]
    Unregistered,
}

impl From<anyhow::Error> for ProviderFault {
    fn from(e: anyhow::Error) -> Self {
        ProviderFault::Failed(format!("{e:#}"))
    }
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The cache itself cannot be read (poisoned lock).
    #[error("cache unavailable")]
    CacheUnavailable,
    /// Internal fault in the refresh cycle, not attributable to a provider.
    #[error("refresh cycle failed: {0}")]
    RefreshCycle(String),
}
