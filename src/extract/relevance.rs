// src/extract/relevance.rs
//! Topic relevance predicate shared by all extractors.
//!
//! Stateless: `is_relevant(text)` depends only on its input and the
//! keyword lists it was built with. Matching is case-insensitive and on
//! whole words, so "rain" does not match "train".

use regex::Regex;
use serde::Deserialize;

pub trait RelevanceFilter: Send + Sync {
    fn is_relevant(&self, text: &str) -> bool;
}

/// Lets everything through; used when no keywords are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RelevanceFilter for AcceptAll {
    fn is_relevant(&self, _text: &str) -> bool {
        true
    }
}

/// Keyword lists as they appear in the `[relevance]` config section.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct KeywordConfig {
    /// At least one anchor must appear (when the list is non-empty).
    #[serde(default)]
    pub anchors: Vec<String>,
    /// Any blocker vetoes the text.
    #[serde(default)]
    pub blockers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeywordFilter {
    anchors: Option<Regex>,
    blockers: Option<Regex>,
}

impl KeywordFilter {
    pub fn new(cfg: &KeywordConfig) -> anyhow::Result<Self> {
        Ok(Self {
            anchors: build_alternation(&cfg.anchors)?,
            blockers: build_alternation(&cfg.blockers)?,
        })
    }
}

impl RelevanceFilter for KeywordFilter {
    fn is_relevant(&self, text: &str) -> bool {
        if let Some(b) = &self.blockers {
            if b.is_match(text) {
                return false;
            }
        }
        match &self.anchors {
            Some(a) => a.is_match(text),
            None => true,
        }
    }
}

fn build_alternation(words: &[String]) -> anyhow::Result<Option<Regex>> {
    let parts: Vec<String> = words
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .map(regex::escape)
        .collect();
    if parts.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"(?i)\b(?:{})\b", parts.join("|"));
    Ok(Some(Regex::new(&pattern)?))
}
