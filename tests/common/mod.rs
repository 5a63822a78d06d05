// tests/common/mod.rs
// Scripted extractors and builders shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use topic_aggregator::{
    CacheManager, Extractor, ExtractorRegistry, FallbackStore, FetchContext, Record,
    RefreshCoordinator, RefreshPolicy,
};

/// What one call to a scripted extractor does.
#[derive(Clone)]
pub enum Step {
    /// Return these records after `delay`.
    Ok(Duration, Vec<Record>),
    /// Fail after `delay`.
    Fail(Duration),
    /// Never settle.
    Hang,
    /// Bug inside the extractor.
    Panic,
}

/// (provider, start, end) for every call that ran to completion.
pub type CallLog = Arc<Mutex<Vec<(String, Instant, Option<Instant>)>>>;

pub struct Scripted {
    pub name: String,
    steps: Vec<Step>,
    pub calls: AtomicUsize,
    pub finished: AtomicUsize,
    log: CallLog,
}

impl Scripted {
    pub fn new(name: &str, steps: Vec<Step>, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            steps,
            calls: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            log,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Extractor for Scripted {
    async fn fetch(&self, _ctx: &FetchContext) -> anyhow::Result<Vec<Record>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps[n.min(self.steps.len() - 1)].clone();
        let idx = {
            let mut log = self.log.lock().unwrap();
            log.push((self.name.clone(), Instant::now(), None));
            log.len() - 1
        };

        let out = match step {
            Step::Ok(delay, recs) => {
                tokio::time::sleep(delay).await;
                Ok(recs)
            }
            Step::Fail(delay) => {
                tokio::time::sleep(delay).await;
                Err(anyhow::anyhow!("{} is down", self.name))
            }
            Step::Hang => std::future::pending().await,
            Step::Panic => panic!("{} extractor bug", self.name),
        };

        self.finished.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap()[idx].2 = Some(Instant::now());
        out
    }
}

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn recs(provider: &str, urls: &[&str]) -> Vec<Record> {
    urls.iter()
        .map(|u| Record::new(provider, format!("Story {u}"), format!("https://{provider}.example/{u}")))
        .collect()
}

pub fn urls(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.url.clone()).collect()
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

pub struct Harness {
    pub cache: Arc<CacheManager>,
    pub extractors: HashMap<String, Arc<Scripted>>,
    pub fallback: FallbackStore,
    pub log: CallLog,
}

impl Harness {
    pub fn ex(&self, id: &str) -> &Scripted {
        &self.extractors[id]
    }
}

/// Build a cache manager over scripted extractors.
pub fn harness(
    policy: RefreshPolicy,
    ttl: Duration,
    scripts: Vec<(&str, Vec<Step>)>,
    fallback: HashMap<String, Vec<Record>>,
) -> Harness {
    let log = new_log();
    let mut registry = ExtractorRegistry::new();
    let mut extractors = HashMap::new();
    for (id, steps) in scripts {
        let ex = Scripted::new(id, steps, log.clone());
        registry.register(id, ex.clone()).unwrap();
        extractors.insert(id.to_string(), ex);
    }
    let fallback = FallbackStore::from_map(fallback);
    let coordinator = RefreshCoordinator::new(registry, Arc::new(fallback.clone()), policy);
    Harness {
        cache: Arc::new(CacheManager::new(coordinator, ttl)),
        extractors,
        fallback,
        log,
    }
}

pub fn policy(fast: &[&str], slow: &[&str]) -> RefreshPolicy {
    RefreshPolicy {
        fast_tier: fast.iter().map(|s| s.to_string()).collect(),
        slow_tier: slow.iter().map(|s| s.to_string()).collect(),
        global_deadline: secs(5),
        default_sub_deadline: secs(10),
        slow_retries: 3,
        slow_backoff: secs(2),
        ..RefreshPolicy::default()
    }
}
