// src/fallback.rs
//! Static last-resort records per provider, loaded once at startup.
//! Pure lookup; no network and no failure mode after load.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::dedup::dedupe;
use crate::record::{sanitize_record, Record};

#[derive(Debug, Clone, Default)]
pub struct FallbackStore {
    inner: HashMap<String, Vec<Record>>,
}

impl FallbackStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a provider -> records map. Records are cleaned, stamped with
    /// their provider and deduplicated, so the floor obeys the same invariants
    /// as live data.
    pub fn from_map(map: HashMap<String, Vec<Record>>) -> Self {
        let inner = map
            .into_iter()
            .map(|(provider, records)| {
                let cleaned = records
                    .into_iter()
                    .filter_map(|r| sanitize_record(r, &provider))
                    .collect();
                let (kept, _) = dedupe(cleaned);
                (provider, kept)
            })
            .collect();
        Self { inner }
    }

    /// Load from JSON (`{"provider": [Record, ...]}`) or the TOML equivalent.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading fallback store from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        parse_store(&content, &ext)
            .with_context(|| format!("parsing fallback store {}", path.display()))
    }

    /// Like `load_from`, but a missing or broken file degrades to an empty store.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load_from(path) {
            Ok(store) => {
                tracing::info!(path = %path.display(), providers = store.len(), "fallback store loaded");
                store
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "fallback store unavailable; continuing without floor");
                Self::empty()
            }
        }
    }

    pub fn get(&self, provider: &str) -> &[Record] {
        self.inner.get(provider).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn parse_store(s: &str, hint_ext: &str) -> Result<FallbackStore> {
    let map: HashMap<String, Vec<Record>> = match hint_ext {
        "toml" => toml::from_str(s)?,
        "json" => serde_json::from_str(s)?,
        other => {
            // Unknown extension: JSON first, then TOML.
            serde_json::from_str(s)
                .or_else(|_| toml::from_str(s))
                .map_err(|_| anyhow!("unsupported fallback format (extension '{other}')"))?
        }
    };
    Ok(FallbackStore::from_map(map))
}
