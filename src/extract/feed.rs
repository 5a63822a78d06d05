// src/extract/feed.rs
//! Generic RSS extractor driven by a per-provider spec (candidate URLs,
//! item cap) and an injected relevance filter. One type serves every
//! RSS-speaking provider; only the spec differs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use super::relevance::{AcceptAll, RelevanceFilter};
use super::{Extractor, FetchContext};
use crate::record::{normalize_text, Record};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let dt = OffsetDateTime::parse(ts.trim(), &Rfc2822).ok()?;
    DateTime::from_timestamp(dt.unix_timestamp(), dt.nanosecond())
}

/// Declarative description of one RSS provider.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct FeedSpec {
    /// Tried in order; the first one yielding relevant items wins.
    #[serde(default)]
    pub urls: Vec<String>,
    /// Cap on records kept per fetch (0 = unlimited).
    #[serde(default)]
    pub max_items: usize,
}

enum Mode {
    Http { client: reqwest::Client },
    // Keeps its own copy so tests need no 'static input.
    Fixture(String),
}

pub struct FeedExtractor {
    provider: String,
    spec: FeedSpec,
    filter: Arc<dyn RelevanceFilter>,
    mode: Mode,
}

impl FeedExtractor {
    pub fn from_spec(
        provider: impl Into<String>,
        spec: FeedSpec,
        filter: Arc<dyn RelevanceFilter>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            provider: provider.into(),
            spec,
            filter,
            mode: Mode::Http { client },
        }
    }

    pub fn from_fixture(provider: impl Into<String>, xml: &str) -> Self {
        Self {
            provider: provider.into(),
            spec: FeedSpec::default(),
            filter: Arc::new(AcceptAll),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn RelevanceFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.spec.max_items = max_items;
        self
    }

    fn parse_items_from_str(&self, s: &str) -> Result<Vec<Record>> {
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss = from_str(&xml_clean)
            .with_context(|| format!("parsing {} rss xml", self.provider))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let (Some(title), Some(link)) = (it.title, it.link) else {
                continue;
            };
            let summary = it.description.as_deref().map(normalize_text);
            let text = format!("{} {}", title, summary.as_deref().unwrap_or_default());
            if !self.filter.is_relevant(&text) {
                continue;
            }
            out.push(Record {
                provider: self.provider.clone(),
                title,
                url: link,
                published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
                summary,
            });
            if self.spec.max_items > 0 && out.len() >= self.spec.max_items {
                break;
            }
        }
        Ok(out)
    }

    async fn fetch_body(client: &reqwest::Client, url: &str, budget: Duration) -> Result<String> {
        let resp = client
            .get(url)
            .timeout(budget)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        resp.text().await.with_context(|| format!("reading body of {url}"))
    }
}

#[async_trait]
impl Extractor for FeedExtractor {
    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<Record>> {
        match &self.mode {
            Mode::Fixture(s) => self.parse_items_from_str(s),
            Mode::Http { client } => {
                let mut last_err = None;
                for url in &self.spec.urls {
                    if ctx.is_cancelled() {
                        return Err(anyhow!("cancelled before {url}"));
                    }
                    let parsed = Self::fetch_body(client, url, ctx.remaining())
                        .await
                        .and_then(|body| self.parse_items_from_str(&body));
                    match parsed {
                        Ok(items) if !items.is_empty() => return Ok(items),
                        Ok(_) => {
                            tracing::debug!(target: "aggregator::extract", provider = %self.provider, url = %url, "no relevant items");
                        }
                        Err(e) => {
                            tracing::debug!(target: "aggregator::extract", provider = %self.provider, url = %url, error = %e, "candidate url failed");
                            last_err = Some(e);
                        }
                    }
                }
                match last_err {
                    // Every candidate failed outright.
                    Some(e) if !self.spec.urls.is_empty() => Err(e),
                    _ => Ok(Vec::new()),
                }
            }
        }
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
