//! Market metadata registry shared across processors
//!
//! Discovery maintains the catalog; the core only reads it (sibling lookup
//! by event, close times for pre-settlement detection) and tracks status
//! flips observed on the lifecycle stream.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::models::lifecycle::{LifecycleEvent, MarketStatus};

/// Static-ish per-market metadata from the discovery layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMeta {
    pub market_id: String,
    pub event_id: Option<String>,
    pub series_id: Option<String>,
    /// Scheduled close, unix seconds.
    pub close_time: Option<i64>,
    pub status: MarketStatus,
}

/// Thread-safe market catalog with event-sibling lookup.
///
/// Shared as `Arc<SeriesIndex>`; writes come from discovery upserts and
/// lifecycle status flips, reads from every processor.
pub struct SeriesIndex {
    inner: RwLock<IndexInner>,
}

#[derive(Default)]
struct IndexInner {
    markets: HashMap<String, MarketMeta>,
    by_event: HashMap<String, HashSet<String>>,
}

impl SeriesIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn upsert(&self, meta: MarketMeta) {
        let mut inner = self.inner.write().unwrap();
        if let Some(event_id) = &meta.event_id {
            inner
                .by_event
                .entry(event_id.clone())
                .or_default()
                .insert(meta.market_id.clone());
        }
        inner.markets.insert(meta.market_id.clone(), meta);
    }

    pub fn get(&self, market_id: &str) -> Option<MarketMeta> {
        self.inner.read().unwrap().markets.get(market_id).cloned()
    }

    pub fn event_of(&self, market_id: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .markets
            .get(market_id)
            .and_then(|m| m.event_id.clone())
    }

    pub fn series_of(&self, market_id: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .markets
            .get(market_id)
            .and_then(|m| m.series_id.clone())
    }

    pub fn close_time(&self, market_id: &str) -> Option<i64> {
        self.inner
            .read()
            .unwrap()
            .markets
            .get(market_id)
            .and_then(|m| m.close_time)
    }

    /// Markets sharing this market's event, excluding itself.
    /// Returns an empty vec for markets with no event mapping.
    pub fn siblings(&self, market_id: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let Some(event_id) = inner
            .markets
            .get(market_id)
            .and_then(|m| m.event_id.as_deref())
        else {
            return Vec::new();
        };
        let Some(members) = inner.by_event.get(event_id) else {
            return Vec::new();
        };
        let mut siblings: Vec<String> = members
            .iter()
            .filter(|id| id.as_str() != market_id)
            .cloned()
            .collect();
        siblings.sort();
        siblings
    }

    /// Siblings still open for trading.
    pub fn open_siblings(&self, market_id: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let Some(event_id) = inner
            .markets
            .get(market_id)
            .and_then(|m| m.event_id.as_deref())
        else {
            return Vec::new();
        };
        let Some(members) = inner.by_event.get(event_id) else {
            return Vec::new();
        };
        let mut siblings: Vec<String> = members
            .iter()
            .filter(|id| id.as_str() != market_id)
            .filter(|id| {
                inner
                    .markets
                    .get(*id)
                    .map(|m| m.status == MarketStatus::Open)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        siblings.sort();
        siblings
    }

    pub fn status(&self, market_id: &str) -> MarketStatus {
        self.inner
            .read()
            .unwrap()
            .markets
            .get(market_id)
            .map(|m| m.status)
            .unwrap_or(MarketStatus::Unknown)
    }

    /// Fold a lifecycle event into the catalog. Unknown markets get a
    /// placeholder entry so later siblings() calls see the status.
    pub fn apply_lifecycle(&self, event: &LifecycleEvent) {
        let mut inner = self.inner.write().unwrap();
        inner
            .markets
            .entry(event.market_id.clone())
            .and_modify(|m| m.status = event.status)
            .or_insert_with(|| MarketMeta {
                market_id: event.market_id.clone(),
                event_id: None,
                series_id: None,
                close_time: None,
                status: event.status,
            });
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SeriesIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(market_id: &str, event_id: &str, status: MarketStatus) -> MarketMeta {
        MarketMeta {
            market_id: market_id.to_string(),
            event_id: Some(event_id.to_string()),
            series_id: Some("SER-X".to_string()),
            close_time: Some(1_700_100_000),
            status,
        }
    }

    #[test]
    fn test_sibling_lookup() {
        let index = SeriesIndex::new();
        index.upsert(meta("M1", "EV-1", MarketStatus::Open));
        index.upsert(meta("M2", "EV-1", MarketStatus::Open));
        index.upsert(meta("M3", "EV-1", MarketStatus::Open));
        index.upsert(meta("OTHER", "EV-2", MarketStatus::Open));

        assert_eq!(index.siblings("M1"), vec!["M2".to_string(), "M3".to_string()]);
        assert!(index.siblings("OTHER").is_empty());
    }

    #[test]
    fn test_open_siblings_excludes_settled() {
        let index = SeriesIndex::new();
        index.upsert(meta("M1", "EV-1", MarketStatus::Open));
        index.upsert(meta("M2", "EV-1", MarketStatus::Settled));
        index.upsert(meta("M3", "EV-1", MarketStatus::Open));

        assert_eq!(index.open_siblings("M1"), vec!["M3".to_string()]);
    }

    #[test]
    fn test_lifecycle_updates_status() {
        let index = SeriesIndex::new();
        index.upsert(meta("M1", "EV-1", MarketStatus::Open));
        index.apply_lifecycle(&LifecycleEvent {
            market_id: "M1".to_string(),
            status: MarketStatus::Settled,
            settled_side: None,
            ts: 1_700_000_500,
        });
        assert_eq!(index.status("M1"), MarketStatus::Settled);
    }
}
