// src/cache.rs
//! Cache manager: owns the last-known-good result set and its staleness
//! clock, and decides when a refresh cycle runs.
//!
//! Reads never wait on anything but the refresh they themselves started,
//! and that one is bounded by the coordinator's deadline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::time::Instant;

use crate::coordinator::{RefreshCoordinator, RefreshReport};
use crate::error::AggregatorError;
use crate::record::Record;

#[derive(Debug, Clone, Copy)]
struct Refreshed {
    at: Instant,
    wall: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    /// Configured provider ids, in config order.
    order: Vec<String>,
    /// Slots are swapped whole, never edited in place.
    by_provider: HashMap<String, Arc<Vec<Record>>>,
    /// Providers that have produced a usable live result at least once.
    live_ok: HashSet<String>,
    refreshed: Option<Refreshed>,
}

/// Consistent view of the cache at the moment of reading.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheSnapshot {
    pub records: Vec<Record>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

/// The single shared cache entry. One writer at a time (guarded by
/// `in_flight`), any number of readers.
#[derive(Debug)]
pub struct CacheEntry {
    state: RwLock<CacheState>,
    in_flight: AtomicBool,
}

impl CacheEntry {
    /// Every configured provider starts with an empty slot.
    pub fn new(providers: Vec<String>) -> Self {
        let by_provider = providers
            .iter()
            .map(|p| (p.clone(), Arc::new(Vec::new())))
            .collect();
        Self {
            state: RwLock::new(CacheState {
                order: providers,
                by_provider,
                live_ok: HashSet::new(),
                refreshed: None,
            }),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Replace a provider's slot with a fresh live result.
    pub fn replace_slot(&self, provider: &str, records: Vec<Record>) -> Result<(), AggregatorError> {
        let mut st = self.state.write().map_err(|_| AggregatorError::CacheUnavailable)?;
        if !st.by_provider.contains_key(provider) {
            tracing::debug!(target: "aggregator::cache", provider, "ignoring result for unconfigured provider");
            return Ok(());
        }
        st.by_provider.insert(provider.to_string(), Arc::new(records));
        st.live_ok.insert(provider.to_string());
        Ok(())
    }

    /// If the provider never had live data, its slot becomes the fallback entry.
    /// Returns true when the slot now holds a non-empty fallback.
    pub fn apply_fallback_floor(&self, provider: &str, fallback: &[Record]) -> Result<bool, AggregatorError> {
        let mut st = self.state.write().map_err(|_| AggregatorError::CacheUnavailable)?;
        if st.live_ok.contains(provider) || !st.by_provider.contains_key(provider) {
            return Ok(false);
        }
        // Without live data the slot can only ever be empty or the fallback itself.
        if fallback.is_empty() {
            return Ok(false);
        }
        let same = st
            .by_provider
            .get(provider)
            .is_some_and(|cur| cur.as_slice() == fallback);
        if !same {
            st.by_provider
                .insert(provider.to_string(), Arc::new(fallback.to_vec()));
        }
        Ok(true)
    }

    pub fn mark_refreshed(&self) -> Result<(), AggregatorError> {
        let mut st = self.state.write().map_err(|_| AggregatorError::CacheUnavailable)?;
        st.refreshed = Some(Refreshed {
            at: Instant::now(),
            wall: Utc::now(),
        });
        Ok(())
    }

    /// Fresh means a cycle concluded less than `ttl` ago.
    pub fn is_fresh(&self, ttl: Duration) -> Result<bool, AggregatorError> {
        let st = self.state.read().map_err(|_| AggregatorError::CacheUnavailable)?;
        Ok(st.refreshed.is_some_and(|r| r.at.elapsed() < ttl))
    }

    pub fn last_refreshed_at(&self) -> Result<Option<DateTime<Utc>>, AggregatorError> {
        let st = self.state.read().map_err(|_| AggregatorError::CacheUnavailable)?;
        Ok(st.refreshed.map(|r| r.wall))
    }

    pub fn has_live_result(&self, provider: &str) -> Result<bool, AggregatorError> {
        let st = self.state.read().map_err(|_| AggregatorError::CacheUnavailable)?;
        Ok(st.live_ok.contains(provider))
    }

    /// Records for one provider, or all providers in config order.
    /// An unconfigured provider yields an empty list.
    pub fn snapshot(&self, provider: Option<&str>) -> Result<CacheSnapshot, AggregatorError> {
        let st = self.state.read().map_err(|_| AggregatorError::CacheUnavailable)?;
        let records = match provider {
            Some(p) => st
                .by_provider
                .get(p)
                .map(|slot| slot.to_vec())
                .unwrap_or_default(),
            None => st
                .order
                .iter()
                .filter_map(|p| st.by_provider.get(p))
                .flat_map(|slot| slot.iter().cloned())
                .collect(),
        };
        Ok(CacheSnapshot {
            records,
            last_refreshed_at: st.refreshed.map(|r| r.wall),
        })
    }

    pub fn providers(&self) -> Result<Vec<String>, AggregatorError> {
        let st = self.state.read().map_err(|_| AggregatorError::CacheUnavailable)?;
        Ok(st.order.clone())
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end(&self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Holds the in-flight flag for one cycle. If the cycle dies before
/// concluding, the clock is still advanced so a broken cycle cannot turn
/// every following read into another refresh.
struct CycleGuard {
    entry: Arc<CacheEntry>,
    concluded: bool,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.concluded {
            tracing::error!(target: "aggregator::cache", "refresh cycle ended abnormally; keeping current slots");
            let _ = self.entry.mark_refreshed();
        }
        self.entry.end();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPath {
    Fresh,
    Stale,
    InFlight,
}

impl ReadPath {
    fn as_str(&self) -> &'static str {
        match self {
            ReadPath::Fresh => "fresh",
            ReadPath::Stale => "stale",
            ReadPath::InFlight => "in_flight",
        }
    }
}

pub struct CacheManager {
    entry: Arc<CacheEntry>,
    coordinator: Arc<RefreshCoordinator>,
    ttl: Duration,
    last_report: Arc<RwLock<Option<RefreshReport>>>,
}

impl CacheManager {
    pub fn new(coordinator: RefreshCoordinator, ttl: Duration) -> Self {
        let entry = CacheEntry::new(coordinator.policy().providers());
        Self {
            entry: Arc::new(entry),
            coordinator: Arc::new(coordinator),
            ttl,
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Serve cached records, refreshing first if the cache is stale.
    ///
    /// Fails only if the cache itself cannot be read; provider trouble and
    /// slow refreshes never surface here.
    pub async fn read(&self, provider: Option<&str>) -> Result<CacheSnapshot, AggregatorError> {
        let path = if self.entry.is_fresh(self.ttl)? {
            ReadPath::Fresh
        } else {
            match self.run_cycle().await {
                Some(Ok(_)) => ReadPath::Stale,
                Some(Err(e)) => {
                    tracing::error!(target: "aggregator::cache", error = %e, "serving pre-refresh cache");
                    ReadPath::Stale
                }
                None => ReadPath::InFlight,
            }
        };
        counter!("aggregator_cache_reads_total", "path" => path.as_str()).increment(1);
        self.entry.snapshot(provider)
    }

    /// Run a cycle now regardless of TTL, unless one is already running.
    pub async fn force_refresh(&self) -> Option<RefreshReport> {
        match self.start_cycle(false).await {
            Some(Ok(report)) => Some(report),
            Some(Err(e)) => {
                tracing::error!(target: "aggregator::cache", error = %e, "forced refresh failed");
                None
            }
            None => None,
        }
    }

    pub fn last_report(&self) -> Option<RefreshReport> {
        self.last_report.read().ok().and_then(|g| g.clone())
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn providers(&self) -> Vec<String> {
        self.coordinator.policy().providers()
    }

    /// `None` if another cycle holds the in-flight flag (or the cache turned
    /// fresh while we raced for it).
    async fn run_cycle(&self) -> Option<Result<RefreshReport, AggregatorError>> {
        self.start_cycle(true).await
    }

    async fn start_cycle(&self, recheck_ttl: bool) -> Option<Result<RefreshReport, AggregatorError>> {
        if !self.entry.try_begin() {
            return None;
        }
        let mut guard = CycleGuard {
            entry: self.entry.clone(),
            concluded: false,
        };

        // Another reader may have finished a cycle between our TTL check and the flag.
        if recheck_ttl && matches!(self.entry.is_fresh(self.ttl), Ok(true)) {
            guard.concluded = true;
            return None;
        }

        let coordinator = self.coordinator.clone();
        let reports = self.last_report.clone();
        // Spawned so the cycle finishes (and releases the flag) even if the
        // reader that started it goes away.
        let handle = tokio::spawn(async move {
            let mut guard = guard;
            let report = coordinator.refresh(&guard.entry).await;
            guard.concluded = true;
            if let Ok(mut slot) = reports.write() {
                *slot = Some(report.clone());
            }
            report
        });

        Some(
            handle
                .await
                .map_err(|e| AggregatorError::RefreshCycle(e.to_string())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recs(provider: &str, urls: &[&str]) -> Vec<Record> {
        urls.iter()
            .map(|u| Record::new(provider, format!("title {u}"), *u))
            .collect()
    }

    #[test]
    fn new_entry_has_exactly_configured_slots() {
        let e = CacheEntry::new(vec!["a".into(), "b".into()]);
        assert_eq!(e.providers().unwrap(), vec!["a", "b"]);
        assert!(e.snapshot(None).unwrap().records.is_empty());
        assert_eq!(e.last_refreshed_at().unwrap(), None);
        assert!(!e.is_fresh(Duration::from_secs(600)).unwrap());
    }

    #[test]
    fn floor_applies_until_first_live_result() {
        let e = CacheEntry::new(vec!["a".into()]);
        let fb = recs("a", &["f1"]);

        assert!(e.apply_fallback_floor("a", &fb).unwrap());
        assert_eq!(e.snapshot(Some("a")).unwrap().records, fb);

        let live = recs("a", &["l1", "l2"]);
        e.replace_slot("a", live.clone()).unwrap();
        assert!(e.has_live_result("a").unwrap());

        // Once live data existed, the floor no longer touches the slot.
        assert!(!e.apply_fallback_floor("a", &fb).unwrap());
        assert_eq!(e.snapshot(Some("a")).unwrap().records, live);
    }

    #[test]
    fn empty_fallback_is_not_reported_as_applied() {
        let e = CacheEntry::new(vec!["a".into()]);
        assert!(!e.apply_fallback_floor("a", &[]).unwrap());
        assert!(e.snapshot(Some("a")).unwrap().records.is_empty());
    }

    #[test]
    fn unconfigured_provider_is_ignored() {
        let e = CacheEntry::new(vec!["a".into()]);
        e.replace_slot("zzz", recs("zzz", &["x"])).unwrap();
        assert!(!e.apply_fallback_floor("zzz", &recs("zzz", &["y"])).unwrap());
        assert_eq!(e.providers().unwrap(), vec!["a"]);
        assert!(e.snapshot(Some("zzz")).unwrap().records.is_empty());
    }

    #[test]
    fn snapshot_all_follows_config_order() {
        let e = CacheEntry::new(vec!["b".into(), "a".into()]);
        e.replace_slot("a", recs("a", &["a1"])).unwrap();
        e.replace_slot("b", recs("b", &["b1", "b2"])).unwrap();
        let urls: Vec<_> = e
            .snapshot(None)
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.url)
            .collect();
        assert_eq!(urls, vec!["b1", "b2", "a1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_ttl() {
        let e = CacheEntry::new(vec![]);
        e.mark_refreshed().unwrap();
        assert!(e.is_fresh(Duration::from_secs(10)).unwrap());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!e.is_fresh(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn in_flight_flag_is_exclusive() {
        let e = CacheEntry::new(vec![]);
        assert!(e.try_begin());
        assert!(!e.try_begin());
        assert!(e.is_in_flight());
        e.end();
        assert!(e.try_begin());
    }

    fn manager(providers: &[&str]) -> CacheManager {
        use crate::coordinator::RefreshPolicy;
        use crate::extract::ExtractorRegistry;
        use crate::fallback::FallbackStore;

        let policy = RefreshPolicy {
            fast_tier: providers.iter().map(|p| p.to_string()).collect(),
            ..RefreshPolicy::default()
        };
        let coordinator =
            RefreshCoordinator::new(ExtractorRegistry::new(), Arc::new(FallbackStore::empty()), policy);
        CacheManager::new(coordinator, Duration::from_secs(600))
    }

    #[tokio::test(start_paused = true)]
    async fn dead_cycle_keeps_committed_slots_and_blocks_refresh_storm() {
        let mgr = manager(&["a", "b"]);
        assert!(mgr.entry.try_begin());
        let guard = CycleGuard {
            entry: mgr.entry.clone(),
            concluded: false,
        };
        mgr.entry.replace_slot("a", recs("a", &["a1"])).unwrap();
        // The cycle dies after committing "a" and before reaching "b".
        drop(guard);

        let snap = mgr.read(None).await.unwrap();
        assert_eq!(snap.records, recs("a", &["a1"]));
        assert!(snap.last_refreshed_at.is_some());
        assert!(!mgr.entry.is_in_flight());
        // Served on the fresh path: no new cycle was started.
        assert!(mgr.last_report().is_none());
    }

    #[tokio::test]
    async fn poisoned_state_surfaces_as_cache_unavailable() {
        let mgr = manager(&["a"]);
        let entry = mgr.entry.clone();
        let _ = std::thread::spawn(move || {
            let _held = entry.state.write().unwrap();
            panic!("writer died holding the cache lock");
        })
        .join();

        let res = mgr.read(None).await;
        assert!(matches!(res, Err(AggregatorError::CacheUnavailable)), "{res:?}");
        assert!(!mgr.entry.is_in_flight());
    }

    #[test]
    fn guard_advances_clock_when_cycle_dies() {
        let e = Arc::new(CacheEntry::new(vec![]));
        assert!(e.try_begin());
        drop(CycleGuard {
            entry: e.clone(),
            concluded: false,
        });
        assert!(!e.is_in_flight());
        assert!(e.last_refreshed_at().unwrap().is_some());
    }
}
