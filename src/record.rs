// src/record.rs
//! Records and per-provider results passed between extractors, the
//! coordinator and the cache.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One candidate article.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    #[serde(default)]
    pub provider: String, // registered provider id, e.g. "bbc"
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Identity of a record: `(provider, url)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub provider: String,
    pub url: String,
}

impl Record {
    pub fn new(provider: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            title: title.into(),
            url: url.into(),
            published_at: None,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_published_at(mut self, ts: DateTime<Utc>) -> Self {
        self.published_at = Some(ts);
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            provider: self.provider.clone(),
            url: self.url.clone(),
        }
    }
}

/// Settlement of one provider within one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Ok,
    TimedOut,
    Failed,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::TimedOut => "timed_out",
            FetchStatus::Failed => "failed",
        }
    }
}

/// Fetch strategy bucket for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Slow,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Slow => "slow",
        }
    }
}

/// Produced once per refresh attempt sequence per provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    pub provider: String,
    pub records: Vec<Record>,
    pub status: FetchStatus,
}

impl ProviderResult {
    pub fn ok(provider: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            provider: provider.into(),
            records,
            status: FetchStatus::Ok,
        }
    }

    pub fn failed(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            records: Vec::new(),
            status: FetchStatus::Failed,
        }
    }

    pub fn timed_out(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            records: Vec::new(),
            status: FetchStatus::TimedOut,
        }
    }

    /// Only an `Ok` result with at least one record may replace a cache slot.
    pub fn is_usable(&self) -> bool {
        self.status == FetchStatus::Ok && !self.records.is_empty()
    }
}

/// Normalize text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("valid tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize typographic quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap: 1500 chars
    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }

    out
}

/// Clean a record coming out of an extractor and stamp the owning provider.
/// Returns `None` when nothing usable is left (empty title or url).
pub fn sanitize_record(mut rec: Record, provider: &str) -> Option<Record> {
    rec.provider = provider.to_string();
    rec.title = normalize_text(&rec.title);
    rec.url = rec.url.trim().to_string();
    rec.summary = rec
        .summary
        .as_deref()
        .map(normalize_text)
        .filter(|s| !s.is_empty());
    if rec.title.is_empty() || rec.url.is_empty() {
        return None;
    }
    Some(rec)
}
