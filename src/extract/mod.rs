// src/extract/mod.rs
//! Extractor contract. The core treats a provider as "given a deadline,
//! produce zero or more records or fail"; how records are obtained is
//! up to the implementation.

pub mod feed;
pub mod relevance;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderFault;
use crate::record::Record;

/// Deadline hint and cancellation handle handed to every fetch.
///
/// The coordinator cancels `token` once the deadline passes and drops the
/// fetch future, so extractors only need to watch it for work they spawn
/// off the fetch future itself.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub provider: String,
    pub deadline: Instant,
    pub attempt: u32,
    token: CancellationToken,
}

impl FetchContext {
    pub fn new(provider: impl Into<String>, deadline: Instant, token: CancellationToken) -> Self {
        Self {
            provider: provider.into(),
            deadline,
            attempt: 1,
            token,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Time left until the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    /// Fetch the provider's current records. An empty vector is a legitimate answer.
    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<Record>>;
}

/// Run one fetch under its deadline with true cancellation: when the deadline
/// passes (or the parent token fires) the token is cancelled and the fetch
/// future is dropped, so nothing keeps running in the background.
///
/// A panic inside the extractor is caught and reported as `Failed` for that
/// provider only.
pub async fn fetch_with_deadline(
    extractor: &dyn Extractor,
    ctx: &FetchContext,
) -> std::result::Result<Vec<Record>, ProviderFault> {
    let budget = ctx.remaining();
    let res = tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(ProviderFault::Cancelled),
        _ = tokio::time::sleep_until(ctx.deadline) => Err(ProviderFault::TimedOut(budget)),
        r = AssertUnwindSafe(extractor.fetch(ctx)).catch_unwind() => match r {
            Ok(r) => r.map_err(ProviderFault::from),
            Err(panic) => Err(ProviderFault::Failed(format!(
                "extractor panicked: {}",
                panic_message(&*panic)
            ))),
        },
    };
    // Stop anything the extractor spawned on the token's behalf.
    ctx.token().cancel();
    res
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Provider id -> extractor. Ids are stable and unique.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    inner: BTreeMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: impl Into<String>, extractor: Arc<dyn Extractor>) -> Result<()> {
        let id = provider.into();
        if id.trim().is_empty() {
            bail!("provider id must not be empty");
        }
        if self.inner.contains_key(&id) {
            bail!("provider '{id}' registered twice");
        }
        self.inner.insert(id, extractor);
        Ok(())
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Extractor>> {
        self.inner.get(provider).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
