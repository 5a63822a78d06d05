// src/dedup.rs
use std::collections::HashSet;

use crate::record::{Record, RecordKey};

/// Stable dedup by `(provider, url)`: the first occurrence wins, later ones are dropped.
/// Returns (kept, dropped_count).
///
/// Meant to run over a single provider's result. Identical stories from
/// different providers have different keys and are kept apart.
pub fn dedupe(records: Vec<Record>) -> (Vec<Record>, usize) {
    let mut seen: HashSet<RecordKey> = HashSet::with_capacity(records.len());
    let mut keep = Vec::with_capacity(records.len());
    let mut dropped = 0usize;

    for rec in records {
        if !seen.insert(rec.key()) {
            dropped += 1;
            continue;
        }
        keep.push(rec);
    }

    (keep, dropped)
}
