//! Cross-market propagation - repricing laggards inside one event
//!
//! Sibling markets of a mutually exclusive event share one probability
//! budget. When a leader reprices sharply and a sibling's quote does not
//! answer, the sibling is quoted against the new information; the processor
//! emits the implied correction on each laggard. Which markets count as
//! correlated siblings is a pluggable predicate, defaulting to
//! same-event membership.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;

use crate::bus::STREAM_TICKER_UPDATES;
use crate::config::CrossMarketConfig;
use crate::error::SignalError;
use crate::models::{SeriesIndex, TickerUpdate};
use crate::signals::model::{
    Signal, SignalDirection, SignalIdGen, SignalType, SignalUrgency,
};
use crate::signals::processor::SignalProcessor;

const CROSS_TTL_SEC: i64 = 180;

/// Selects the correlated markets for a leader. The default is the leader's
/// open same-event siblings.
pub type SiblingPredicate = Box<dyn Fn(&SeriesIndex, &str) -> Vec<String> + Send>;

#[derive(Debug, Default)]
struct PriceTrack {
    /// (ts, yes_price) history, pruned to the sibling lookback.
    prices: VecDeque<(i64, i64)>,
    /// Last time the quote actually changed.
    last_move_ts: Option<i64>,
    /// Count of quote changes inside the lookback, for noise discounting.
    recent_changes: VecDeque<i64>,
}

impl PriceTrack {
    fn record(&mut self, ts: i64, price: i64, lookback_sec: i64) {
        if let Some(&(_, last_price)) = self.prices.back() {
            if price != last_price {
                self.last_move_ts = Some(ts);
                self.recent_changes.push_back(ts);
            }
        }
        self.prices.push_back((ts, price));
        while let Some(&(front_ts, _)) = self.prices.front() {
            if ts - front_ts > lookback_sec {
                self.prices.pop_front();
            } else {
                break;
            }
        }
        while let Some(&front) = self.recent_changes.front() {
            if ts - front > lookback_sec {
                self.recent_changes.pop_front();
            } else {
                break;
            }
        }
    }

    fn last_price(&self) -> Option<i64> {
        self.prices.back().map(|&(_, p)| p)
    }

    /// Net price move over the trailing `horizon_sec`, cents.
    fn net_move(&self, now: i64, horizon_sec: i64) -> Option<i64> {
        let &(_, current) = self.prices.back()?;
        let (_, reference) = self.prices.iter().find(|(ts, _)| now - ts <= horizon_sec)?;
        Some(current - reference)
    }

    fn noise(&self) -> usize {
        self.recent_changes.len()
    }
}

pub struct CrossMarketProcessor {
    config: CrossMarketConfig,
    index: Arc<SeriesIndex>,
    ids: SignalIdGen,
    markets: HashMap<String, PriceTrack>,
    /// (sibling, direction) -> last emit ts, for self-suppression.
    recent_emits: HashMap<(String, SignalDirection), i64>,
    siblings_of: SiblingPredicate,
}

impl CrossMarketProcessor {
    pub fn new(config: CrossMarketConfig, index: Arc<SeriesIndex>) -> Self {
        Self {
            config,
            index,
            ids: SignalIdGen::new("cross_market"),
            markets: HashMap::new(),
            recent_emits: HashMap::new(),
            siblings_of: Box::new(|index, market_id| index.open_siblings(market_id)),
        }
    }

    /// Swap the correlation predicate (e.g. same-series cross-event).
    pub fn with_sibling_predicate(mut self, predicate: SiblingPredicate) -> Self {
        self.siblings_of = predicate;
        self
    }

    pub fn process_ticker(&mut self, update: &TickerUpdate) -> Vec<Signal> {
        let Some(price) = update.price else {
            return Vec::new();
        };
        let config = self.config.clone();

        let track = self.markets.entry(update.market_id.clone()).or_default();
        track.record(update.ts, price, config.window_sec);

        let Some(leader_move) = track.net_move(update.ts, config.leader_window_sec) else {
            return Vec::new();
        };
        if leader_move.abs() < config.leader_min_move {
            return Vec::new();
        }

        self.scan_siblings(&update.market_id, price, leader_move, update.ts)
    }

    /// The leader moved; emit a correction on every lagging sibling whose
    /// quote is drifting against the move.
    fn scan_siblings(
        &mut self,
        leader: &str,
        leader_price: i64,
        leader_move: i64,
        now: i64,
    ) -> Vec<Signal> {
        let siblings = (self.siblings_of)(&self.index, leader);
        if siblings.is_empty() || siblings.len() > self.config.max_siblings {
            return Vec::new();
        }

        // Probability flowed into the leader, so it must flow out of the
        // mutually exclusive siblings (and vice versa).
        let direction = if leader_move > 0 {
            SignalDirection::BuyNo
        } else {
            SignalDirection::BuyYes
        };

        let mut signals = Vec::new();
        for sibling in siblings {
            let Some(track) = self.markets.get(&sibling) else {
                continue;
            };
            let Some(sibling_price) = track.last_price() else {
                continue;
            };
            let sibling_move = track
                .net_move(now, self.config.window_sec)
                .unwrap_or(0);
            if sibling_move.abs() >= self.config.follower_max_move {
                continue; // already repricing
            }

            if let Some(&last) = self.recent_emits.get(&(sibling.clone(), direction)) {
                if now - last < self.config.suppression_sec {
                    continue;
                }
            }

            let lag_seconds = track
                .last_move_ts
                .map(|ts| now - ts)
                .unwrap_or(self.config.window_sec);
            let noise = track.noise() as f64;
            let implied_edge = leader_move.abs() - sibling_move.abs();

            let strength = (leader_move.abs() as f64 / 10.0).clamp(0.0, 1.0);
            let confidence = (0.65 * (1.0 - (noise / 10.0).min(0.6))).clamp(0.0, 1.0);

            self.recent_emits.insert((sibling.clone(), direction), now);
            signals.push(
                Signal::builder(SignalType::CrossMarket, &sibling, now)
                    .event_id(self.index.event_of(&sibling))
                    .series_id(self.index.series_of(&sibling))
                    .direction(direction)
                    .strength(strength)
                    .confidence(confidence)
                    .urgency(SignalUrgency::High)
                    .ttl_seconds(CROSS_TTL_SEC)
                    .metadata(json!({
                        "leader_market": leader,
                        "leader_move": leader_move,
                        "leader_price": leader_price,
                        "sibling_price": sibling_price,
                        "lag_seconds": lag_seconds,
                        "implied_edge": implied_edge,
                    }))
                    .build(self.ids.next()),
            );
        }
        signals
    }
}

impl SignalProcessor for CrossMarketProcessor {
    fn name(&self) -> &'static str {
        "cross_market"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[STREAM_TICKER_UPDATES]
    }

    fn handle_event(&mut self, _stream: &str, payload: &str) -> Result<Vec<Signal>, SignalError> {
        let update = TickerUpdate::from_payload(payload)?;
        Ok(self.process_ticker(&update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{MarketMeta, MarketStatus};

    fn event_index(markets: &[&str]) -> Arc<SeriesIndex> {
        let index = Arc::new(SeriesIndex::new());
        for market in markets {
            index.upsert(MarketMeta {
                market_id: market.to_string(),
                event_id: Some("EV-1".to_string()),
                series_id: Some("SER-1".to_string()),
                close_time: None,
                status: MarketStatus::Open,
            });
        }
        index
    }

    fn make_update(market: &str, ts: i64, price: i64) -> TickerUpdate {
        TickerUpdate {
            market_id: market.to_string(),
            price: Some(price),
            volume_delta: None,
            open_interest_delta: None,
            dollar_volume_delta: None,
            dollar_open_interest_delta: None,
            ts,
        }
    }

    fn seed_prices(proc: &mut CrossMarketProcessor, base: i64) {
        // Everyone has a stable quote well before the move.
        for t in 0..3 {
            proc.process_ticker(&make_update("M1", base + t * 30, 50));
            proc.process_ticker(&make_update("M2", base + t * 30, 30));
            proc.process_ticker(&make_update("M3", base + t * 30, 20));
        }
    }

    #[test]
    fn test_leader_jump_signals_lagging_siblings() {
        let index = event_index(&["M1", "M2", "M3"]);
        let mut proc = CrossMarketProcessor::new(Config::default().cross_market, index);
        let base = 1_700_000_000i64;
        seed_prices(&mut proc, base);

        // M1 jumps 50 -> 55 within 10s; siblings stay flat.
        let signals = proc.process_ticker(&make_update("M1", base + 70, 55));

        assert_eq!(signals.len(), 2, "one signal per lagging sibling");
        for signal in &signals {
            assert_eq!(signal.direction, SignalDirection::BuyNo);
            assert_eq!(signal.metadata["leader_market"], "M1");
            assert_eq!(signal.metadata["leader_move"], 5);
            assert_eq!(signal.ttl_seconds, 180);
        }
        let targets: Vec<&str> = signals.iter().map(|s| s.market_id.as_str()).collect();
        assert!(targets.contains(&"M2") && targets.contains(&"M3"));
    }

    #[test]
    fn test_downward_leader_move_flips_direction() {
        let index = event_index(&["M1", "M2"]);
        let mut proc = CrossMarketProcessor::new(Config::default().cross_market, index);
        let base = 1_700_000_000i64;
        seed_prices(&mut proc, base);

        let signals = proc.process_ticker(&make_update("M1", base + 70, 45));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, SignalDirection::BuyYes);
    }

    #[test]
    fn test_small_move_ignored() {
        let index = event_index(&["M1", "M2"]);
        let mut proc = CrossMarketProcessor::new(Config::default().cross_market, index);
        let base = 1_700_000_000i64;
        seed_prices(&mut proc, base);

        let signals = proc.process_ticker(&make_update("M1", base + 70, 52));
        assert!(signals.is_empty(), "2-cent move is below the leader threshold");
    }

    #[test]
    fn test_repricing_sibling_not_signaled() {
        let index = event_index(&["M1", "M2", "M3"]);
        let mut proc = CrossMarketProcessor::new(Config::default().cross_market, index);
        let base = 1_700_000_000i64;
        seed_prices(&mut proc, base);

        // M2 already answered the move.
        proc.process_ticker(&make_update("M2", base + 65, 27));
        let signals = proc.process_ticker(&make_update("M1", base + 70, 55));

        let targets: Vec<&str> = signals.iter().map(|s| s.market_id.as_str()).collect();
        assert!(!targets.contains(&"M2"), "moving sibling must be skipped");
        assert!(targets.contains(&"M3"));
    }

    #[test]
    fn test_self_suppression_within_window() {
        let index = event_index(&["M1", "M2"]);
        let mut proc = CrossMarketProcessor::new(Config::default().cross_market, index);
        let base = 1_700_000_000i64;
        seed_prices(&mut proc, base);

        let first = proc.process_ticker(&make_update("M1", base + 70, 55));
        assert_eq!(first.len(), 1);

        // Another leader tick 10s later; M2 was just signaled.
        let second = proc.process_ticker(&make_update("M1", base + 80, 56));
        assert!(second.is_empty(), "same-direction repeat inside 60s suppressed");
    }

    #[test]
    fn test_unmapped_market_emits_nothing() {
        let index = Arc::new(SeriesIndex::new());
        let mut proc = CrossMarketProcessor::new(Config::default().cross_market, index);
        let base = 1_700_000_000i64;
        proc.process_ticker(&make_update("LONER", base, 50));
        let signals = proc.process_ticker(&make_update("LONER", base + 10, 60));
        assert!(signals.is_empty());
    }
}
