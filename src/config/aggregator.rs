// src/config/aggregator.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::coordinator::RefreshPolicy;
use crate::extract::feed::FeedSpec;
use crate::extract::relevance::KeywordConfig;
use crate::record::Tier;

pub const ENV_CONFIG_PATH: &str = "AGGREGATOR_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/aggregator.toml";
const ENV_TTL_SECS: &str = "AGGREGATOR_TTL_SECS";
const ENV_GLOBAL_DEADLINE_MS: &str = "AGGREGATOR_GLOBAL_DEADLINE_MS";
const ENV_FALLBACK_PATH: &str = "AGGREGATOR_FALLBACK_PATH";

fn default_ttl_secs() -> u64 {
    600
}
fn default_global_deadline_ms() -> u64 {
    8_000
}
fn default_sub_deadline_ms() -> u64 {
    4_000
}
fn default_slow_retries() -> u32 {
    3
}
fn default_slow_backoff_ms() -> u64 {
    2_000
}
fn default_fallback_path() -> PathBuf {
    PathBuf::from("config/fallback.json")
}

/// One provider entry (`[[providers]]`).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: String,
    pub tier: Tier,
    /// Overrides `default_sub_deadline_ms` for this provider.
    #[serde(default)]
    pub sub_deadline_ms: Option<u64>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub max_items: usize,
}

impl ProviderConfig {
    pub fn feed_spec(&self) -> FeedSpec {
        FeedSpec {
            urls: self.urls.clone(),
            max_items: self.max_items,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_global_deadline_ms")]
    pub global_deadline_ms: u64,
    #[serde(default = "default_sub_deadline_ms")]
    pub default_sub_deadline_ms: u64,
    #[serde(default = "default_slow_retries")]
    pub slow_retries: u32,
    #[serde(default = "default_slow_backoff_ms")]
    pub slow_backoff_ms: u64,
    #[serde(default = "default_fallback_path")]
    pub fallback_path: PathBuf,
    #[serde(default)]
    pub relevance: KeywordConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            global_deadline_ms: default_global_deadline_ms(),
            default_sub_deadline_ms: default_sub_deadline_ms(),
            slow_retries: default_slow_retries(),
            slow_backoff_ms: default_slow_backoff_ms(),
            fallback_path: default_fallback_path(),
            relevance: KeywordConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl AggregatorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: AggregatorConfig = toml::from_str(s).context("parsing aggregator config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading aggregator config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Resolve config using env var + fallbacks, then apply env overrides:
    /// 1) $AGGREGATOR_CONFIG_PATH
    /// 2) config/aggregator.toml
    /// 3) built-in defaults (no providers)
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_p.exists() {
                Self::load_from(&default_p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = env::var(ENV_TTL_SECS) {
            self.ttl_secs = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_TTL_SECS}={v}"))?;
        }
        if let Ok(v) = env::var(ENV_GLOBAL_DEADLINE_MS) {
            self.global_deadline_ms = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_GLOBAL_DEADLINE_MS}={v}"))?;
        }
        if let Ok(v) = env::var(ENV_FALLBACK_PATH) {
            self.fallback_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            bail!("ttl_secs must be > 0");
        }
        if self.global_deadline_ms == 0 || self.default_sub_deadline_ms == 0 {
            bail!("deadlines must be > 0");
        }
        if self.slow_retries == 0 {
            bail!("slow_retries must be >= 1");
        }
        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.id.trim().is_empty() {
                bail!("provider id must not be empty");
            }
            if !seen.insert(p.id.as_str()) {
                bail!("duplicate provider id '{}'", p.id);
            }
            if p.sub_deadline_ms == Some(0) {
                bail!("provider '{}': sub_deadline_ms must be > 0", p.id);
            }
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Provider ids in config order.
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id.clone()).collect()
    }

    fn tier_ids(&self, tier: Tier) -> Vec<String> {
        self.providers
            .iter()
            .filter(|p| p.tier == tier)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        let sub_deadlines: HashMap<String, Duration> = self
            .providers
            .iter()
            .filter_map(|p| {
                p.sub_deadline_ms
                    .map(|ms| (p.id.clone(), Duration::from_millis(ms)))
            })
            .collect();
        RefreshPolicy {
            fast_tier: self.tier_ids(Tier::Fast),
            slow_tier: self.tier_ids(Tier::Slow),
            global_deadline: Duration::from_millis(self.global_deadline_ms),
            default_sub_deadline: Duration::from_millis(self.default_sub_deadline_ms),
            sub_deadlines,
            slow_retries: self.slow_retries,
            slow_backoff: Duration::from_millis(self.slow_backoff_ms),
        }
    }
}
