// src/coordinator.rs
//! Refresh coordinator: runs extractors under a two-tier time budget and
//! merges each provider's result into the cache the moment it settles.
//!
//! - Fast tier: all providers are polled concurrently inside the cycle task;
//!   we wait for all of them or the global deadline, whichever comes first.
//!   Stragglers are dropped.
//! - Slow tier: providers run one after another, each under its own
//!   sub-deadline with bounded retries. No new attempt starts once the
//!   global deadline has passed, but an attempt already running keeps its
//!   own sub-deadline, so a cycle ends within `global + one sub-deadline`.
//! - Merge: a non-empty `Ok` replaces the provider's slot. Anything else
//!   leaves the slot alone, unless the provider never had live data, in
//!   which case the fallback entry becomes the slot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheEntry;
use crate::dedup::dedupe;
use crate::error::{AggregatorError, ProviderFault};
use crate::extract::{fetch_with_deadline, ExtractorRegistry, FetchContext};
use crate::fallback::FallbackStore;
use crate::metrics::ensure_metrics_described;
use crate::record::{sanitize_record, FetchStatus, ProviderResult, Record, Tier};

/// Time budget and tier partition for one refresh cycle.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub fast_tier: Vec<String>,
    /// Run strictly in this order.
    pub slow_tier: Vec<String>,
    pub global_deadline: Duration,
    pub default_sub_deadline: Duration,
    pub sub_deadlines: HashMap<String, Duration>,
    /// Attempts per slow-tier provider (including the first).
    pub slow_retries: u32,
    pub slow_backoff: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            fast_tier: Vec::new(),
            slow_tier: Vec::new(),
            global_deadline: Duration::from_secs(8),
            default_sub_deadline: Duration::from_secs(4),
            sub_deadlines: HashMap::new(),
            slow_retries: 3,
            slow_backoff: Duration::from_secs(2),
        }
    }
}

impl RefreshPolicy {
    pub fn sub_deadline_for(&self, provider: &str) -> Duration {
        self.sub_deadlines
            .get(provider)
            .copied()
            .unwrap_or(self.default_sub_deadline)
    }

    /// Every configured provider: fast tier first, then slow tier.
    pub fn providers(&self) -> Vec<String> {
        self.fast_tier
            .iter()
            .chain(self.slow_tier.iter())
            .cloned()
            .collect()
    }
}

/// What happened to one provider during a cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderOutcome {
    pub provider: String,
    pub tier: Tier,
    pub status: FetchStatus,
    /// Records kept after cleanup + dedup (0 if nothing usable arrived).
    pub records: usize,
    pub dedup_dropped: usize,
    pub attempts: u32,
    pub fallback_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub deadline_hit: bool,
    pub outcomes: Vec<ProviderOutcome>,
}

impl RefreshReport {
    pub fn outcome(&self, provider: &str) -> Option<&ProviderOutcome> {
        self.outcomes.iter().find(|o| o.provider == provider)
    }
}

pub struct RefreshCoordinator {
    registry: ExtractorRegistry,
    fallback: Arc<FallbackStore>,
    policy: RefreshPolicy,
}

impl RefreshCoordinator {
    pub fn new(registry: ExtractorRegistry, fallback: Arc<FallbackStore>, policy: RefreshPolicy) -> Self {
        for id in policy.providers() {
            if registry.get(&id).is_none() {
                tracing::warn!(target: "aggregator::refresh", provider = %id, "configured provider has no extractor; it will only ever serve fallback");
            }
        }
        Self {
            registry,
            fallback,
            policy,
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    /// Run one full cycle against `entry`. Never fails because of a provider;
    /// `lastRefreshedAt` is advanced exactly once, when the cycle concludes.
    pub async fn refresh(&self, entry: &CacheEntry) -> RefreshReport {
        ensure_metrics_described();
        let started_at = Utc::now();
        let t0 = Instant::now();
        let deadline = t0 + self.policy.global_deadline;
        let cycle = CancellationToken::new();
        let mut outcomes = Vec::with_capacity(self.policy.fast_tier.len() + self.policy.slow_tier.len());

        tracing::info!(
            target: "aggregator::refresh",
            fast = self.policy.fast_tier.len(),
            slow = self.policy.slow_tier.len(),
            budget_ms = self.policy.global_deadline.as_millis() as u64,
            "refresh cycle started"
        );

        let mut deadline_hit = self.run_fast_tier(entry, deadline, &cycle, &mut outcomes).await;
        deadline_hit |= self.run_slow_tier(entry, deadline, &cycle, &mut outcomes).await;
        cycle.cancel();

        if let Err(e) = entry.mark_refreshed() {
            tracing::error!(target: "aggregator::refresh", error = %e, "could not advance refresh clock");
        }

        let elapsed_ms = t0.elapsed().as_millis() as u64;
        counter!("aggregator_refresh_cycles_total").increment(1);
        histogram!("aggregator_refresh_duration_ms").record(elapsed_ms as f64);
        gauge!("aggregator_last_refresh_ts").set(Utc::now().timestamp() as f64);

        let ok = outcomes.iter().filter(|o| o.records > 0).count();
        tracing::info!(
            target: "aggregator::refresh",
            elapsed_ms,
            deadline_hit,
            ok,
            total = outcomes.len(),
            "refresh cycle finished"
        );

        RefreshReport {
            started_at,
            finished_at: Utc::now(),
            elapsed_ms,
            deadline_hit,
            outcomes,
        }
    }

    /// Returns true if the global deadline cut the tier short.
    async fn run_fast_tier(
        &self,
        entry: &CacheEntry,
        deadline: Instant,
        cycle: &CancellationToken,
        outcomes: &mut Vec<ProviderOutcome>,
    ) -> bool {
        let mut running = FuturesUnordered::new();
        let mut pending: HashSet<String> = HashSet::new();

        for id in &self.policy.fast_tier {
            let Some(extractor) = self.registry.get(id) else {
                outcomes.push(self.merge(entry, Tier::Fast, Err(ProviderFault::Unregistered), id, 0));
                continue;
            };
            // The global cutoff below covers anything slower than `deadline`.
            let sub = Instant::now() + self.policy.sub_deadline_for(id);
            let ctx = FetchContext::new(id.clone(), sub, cycle.child_token());
            pending.insert(id.clone());
            running.push(async move {
                let res = fetch_with_deadline(extractor.as_ref(), &ctx).await;
                (ctx.provider, res)
            });
        }

        let cutoff = tokio::time::sleep_until(deadline);
        tokio::pin!(cutoff);
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                biased;
                settled = running.next() => match settled {
                    None => break,
                    Some((id, res)) => {
                        pending.remove(&id);
                        outcomes.push(self.merge(entry, Tier::Fast, res, &id, 1));
                    }
                },
                _ = &mut cutoff => {
                    deadline_hit = true;
                    break;
                }
            }
        }

        // True cancellation: fetches still running are dropped here.
        drop(running);
        let mut leftover: Vec<String> = pending.into_iter().collect();
        leftover.sort();
        for id in leftover {
            tracing::warn!(target: "aggregator::refresh", provider = %id, "fast-tier provider abandoned at global deadline");
            outcomes.push(self.merge(
                entry,
                Tier::Fast,
                Err(ProviderFault::TimedOut(self.policy.global_deadline)),
                &id,
                1,
            ));
        }

        deadline_hit
    }

    /// Returns true if the global deadline stopped further attempts.
    async fn run_slow_tier(
        &self,
        entry: &CacheEntry,
        deadline: Instant,
        cycle: &CancellationToken,
        outcomes: &mut Vec<ProviderOutcome>,
    ) -> bool {
        let mut deadline_hit = false;

        for id in &self.policy.slow_tier {
            if Instant::now() >= deadline {
                deadline_hit = true;
                tracing::debug!(target: "aggregator::refresh", provider = %id, "skipped: global deadline reached");
                outcomes.push(self.merge(
                    entry,
                    Tier::Slow,
                    Err(ProviderFault::TimedOut(Duration::ZERO)),
                    id,
                    0,
                ));
                continue;
            }
            let Some(extractor) = self.registry.get(id) else {
                outcomes.push(self.merge(entry, Tier::Slow, Err(ProviderFault::Unregistered), id, 0));
                continue;
            };

            let sub = self.policy.sub_deadline_for(id);
            let mut attempts = 0u32;
            let mut last = Err(ProviderFault::Cancelled);

            while attempts < self.policy.slow_retries {
                if attempts > 0 {
                    if Instant::now() + self.policy.slow_backoff >= deadline {
                        deadline_hit = true;
                        break;
                    }
                    tokio::time::sleep(self.policy.slow_backoff).await;
                }
                attempts += 1;

                let ctx = FetchContext::new(id.clone(), Instant::now() + sub, cycle.child_token())
                    .with_attempt(attempts);
                last = fetch_with_deadline(extractor.as_ref(), &ctx).await;
                match &last {
                    Ok(_) => break,
                    Err(fault) => {
                        tracing::debug!(target: "aggregator::refresh", provider = %id, attempt = attempts, error = %fault, "slow-tier attempt failed");
                    }
                }
            }

            outcomes.push(self.merge(entry, Tier::Slow, last, id, attempts));
        }

        deadline_hit
    }

    /// Apply the merge rule for one provider and report what happened.
    fn merge(
        &self,
        entry: &CacheEntry,
        tier: Tier,
        res: Result<Vec<Record>, ProviderFault>,
        provider: &str,
        attempts: u32,
    ) -> ProviderOutcome {
        let (result, dedup_dropped, error) = settle(provider, res);

        let mut fallback_applied = false;
        let commit: Result<(), AggregatorError> = if result.is_usable() {
            let n = result.records.len();
            entry.replace_slot(provider, result.records.clone()).map(|_| {
                tracing::debug!(target: "aggregator::refresh", provider, tier = tier.as_str(), records = n, "slot replaced");
            })
        } else {
            entry
                .apply_fallback_floor(provider, self.fallback.get(provider))
                .map(|applied| fallback_applied = applied)
        };
        if let Err(e) = commit {
            tracing::error!(target: "aggregator::refresh", provider, error = %e, "merge failed");
        }

        if let Some(err) = &error {
            tracing::warn!(target: "aggregator::refresh", provider, tier = tier.as_str(), status = result.status.as_str(), error = %err, "provider did not improve this cycle");
        }
        counter!(
            "aggregator_provider_results_total",
            "provider" => provider.to_string(),
            "status" => result.status.as_str()
        )
        .increment(1);
        if fallback_applied {
            counter!("aggregator_fallback_applied_total", "provider" => provider.to_string()).increment(1);
        }
        counter!("aggregator_dedup_dropped_total").increment(dedup_dropped as u64);

        ProviderOutcome {
            provider: provider.to_string(),
            tier,
            status: result.status,
            records: if result.is_usable() { result.records.len() } else { 0 },
            dedup_dropped,
            attempts,
            fallback_applied,
            error,
        }
    }
}

/// Turn a raw fetch outcome into a cleaned, deduplicated `ProviderResult`.
fn settle(
    provider: &str,
    res: Result<Vec<Record>, ProviderFault>,
) -> (ProviderResult, usize, Option<String>) {
    match res {
        Ok(raw) => {
            let cleaned = raw
                .into_iter()
                .filter_map(|r| sanitize_record(r, provider))
                .collect();
            let (kept, dropped) = dedupe(cleaned);
            (ProviderResult::ok(provider, kept), dropped, None)
        }
        Err(fault @ ProviderFault::TimedOut(_)) => {
            (ProviderResult::timed_out(provider), 0, Some(fault.to_string()))
        }
        Err(fault) => (ProviderResult::failed(provider), 0, Some(fault.to_string())),
    }
}
