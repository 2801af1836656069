//! Lifecycle-alpha processor - settlement cascades and new-market pricing
//!
//! Two patterns around market lifecycle transitions. When one market of a
//! mutually exclusive event settles, its siblings resolve by elimination
//! and must reprice now. When a market opens into an event with
//! established siblings, its first quote is checked against the residual
//! probability the siblings leave on the table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use crate::bus::{STREAM_LIFECYCLE, STREAM_TICKER_UPDATES};
use crate::config::LifecycleConfig;
use crate::error::SignalError;
use crate::models::{LifecycleEvent, MarketStatus, SeriesIndex, TakerSide, TickerUpdate};
use crate::signals::model::{
    Signal, SignalDirection, SignalIdGen, SignalType, SignalUrgency,
};
use crate::signals::processor::SignalProcessor;

pub struct LifecycleAlphaProcessor {
    config: LifecycleConfig,
    index: Arc<SeriesIndex>,
    ids: SignalIdGen,
    /// market -> open ts, for the new-market evaluation window.
    recent_opens: HashMap<String, i64>,
    /// Markets whose initial pricing has already been judged.
    evaluated: HashSet<String>,
    /// Last seen yes price per market.
    prices: HashMap<String, i64>,
}

impl LifecycleAlphaProcessor {
    pub fn new(config: LifecycleConfig, index: Arc<SeriesIndex>) -> Self {
        Self {
            config,
            index,
            ids: SignalIdGen::new("lifecycle"),
            recent_opens: HashMap::new(),
            evaluated: HashSet::new(),
            prices: HashMap::new(),
        }
    }

    pub fn process_lifecycle(&mut self, event: &LifecycleEvent) -> Vec<Signal> {
        match event.status {
            MarketStatus::Open => {
                self.index.apply_lifecycle(event);
                self.recent_opens.insert(event.market_id.clone(), event.ts);
                Vec::new()
            }
            MarketStatus::Settled | MarketStatus::Determined => {
                // Snapshot open siblings before flipping the status.
                let siblings = self.index.open_siblings(&event.market_id);
                self.index.apply_lifecycle(event);
                self.cascade(event, &siblings)
            }
            _ => {
                self.index.apply_lifecycle(event);
                Vec::new()
            }
        }
    }

    /// Elimination logic. A yes-settlement resolves the whole event: every
    /// sibling is dead weight. A no-settlement only points at a winner when
    /// exactly one candidate remains.
    fn cascade(&mut self, event: &LifecycleEvent, siblings: &[String]) -> Vec<Signal> {
        if siblings.is_empty() {
            return Vec::new();
        }

        let targets: Vec<(String, SignalDirection)> = match event.settled_side {
            Some(TakerSide::Yes) => siblings
                .iter()
                .map(|s| (s.clone(), SignalDirection::BuyNo))
                .collect(),
            Some(TakerSide::No) if siblings.len() == 1 => {
                vec![(siblings[0].clone(), SignalDirection::BuyYes)]
            }
            _ => return Vec::new(),
        };

        log::info!(
            "⚡ settlement cascade from {} onto {} siblings",
            event.market_id,
            targets.len()
        );

        targets
            .into_iter()
            .map(|(market_id, direction)| {
                Signal::builder(SignalType::LifecycleCascade, &market_id, event.ts)
                    .event_id(self.index.event_of(&market_id))
                    .series_id(self.index.series_of(&market_id))
                    .direction(direction)
                    .strength(0.9)
                    .confidence(0.9)
                    .urgency(SignalUrgency::Critical)
                    .ttl_seconds(self.config.cascade_ttl_sec)
                    .metadata(json!({
                        "pattern": "settlement_cascade",
                        "settled_market": event.market_id,
                        "settled_status": event.status.as_str(),
                        "settled_side": event.settled_side.map(|s| s.as_str()),
                    }))
                    .build(self.ids.next())
            })
            .collect()
    }

    pub fn process_ticker(&mut self, update: &TickerUpdate) -> Vec<Signal> {
        let Some(price) = update.price else {
            return Vec::new();
        };
        self.prices.insert(update.market_id.clone(), price);

        let Some(&opened_at) = self.recent_opens.get(&update.market_id) else {
            return Vec::new();
        };
        if update.ts - opened_at > self.config.new_market_window_sec {
            self.recent_opens.remove(&update.market_id);
            return Vec::new();
        }
        if self.evaluated.contains(&update.market_id) {
            return Vec::new();
        }
        self.evaluated.insert(update.market_id.clone());

        self.judge_initial_price(&update.market_id, price, update.ts)
    }

    /// Compare a fresh market's first quote to the probability its
    /// established siblings leave unclaimed.
    fn judge_initial_price(&mut self, market_id: &str, price: i64, ts: i64) -> Vec<Signal> {
        let siblings = self.index.open_siblings(market_id);
        let known: Vec<i64> = siblings
            .iter()
            .filter_map(|s| self.prices.get(s).copied())
            .collect();
        if known.is_empty() {
            return Vec::new();
        }

        let residual = (100 - known.iter().sum::<i64>()).clamp(1, 99);
        let divergence = price - residual;
        if divergence.abs() < self.config.new_market_min_divergence {
            return Vec::new();
        }

        let direction = if divergence > 0 {
            SignalDirection::BuyNo
        } else {
            SignalDirection::BuyYes
        };

        vec![
            Signal::builder(SignalType::LifecycleNewMarket, market_id, ts)
                .event_id(self.index.event_of(market_id))
                .series_id(self.index.series_of(market_id))
                .direction(direction)
                .strength((divergence.abs() as f64 / 50.0).clamp(0.0, 1.0))
                .confidence((0.3 + known.len() as f64 * 0.1).min(0.6))
                .urgency(SignalUrgency::Normal)
                .ttl_seconds(self.config.new_market_window_sec)
                .metadata(json!({
                    "pattern": "new_market_residual",
                    "initial_price": price,
                    "implied_residual": residual,
                    "divergence": divergence,
                    "siblings_priced": known.len(),
                }))
                .build(self.ids.next()),
        ]
    }
}

impl SignalProcessor for LifecycleAlphaProcessor {
    fn name(&self) -> &'static str {
        "lifecycle_alpha"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[STREAM_LIFECYCLE, STREAM_TICKER_UPDATES]
    }

    fn handle_event(&mut self, stream: &str, payload: &str) -> Result<Vec<Signal>, SignalError> {
        match stream {
            STREAM_LIFECYCLE => {
                let event = LifecycleEvent::from_payload(payload)?;
                Ok(self.process_lifecycle(&event))
            }
            STREAM_TICKER_UPDATES => {
                let update = TickerUpdate::from_payload(payload)?;
                Ok(self.process_ticker(&update))
            }
            other => Err(SignalError::Malformed(format!("unexpected stream {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::MarketMeta;

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

    fn processor(index: Arc<SeriesIndex>) -> LifecycleAlphaProcessor {
        LifecycleAlphaProcessor::new(Config::default().lifecycle, index)
    }

    fn settle(market: &str, side: TakerSide, ts: i64) -> LifecycleEvent {
        LifecycleEvent {
            market_id: market.to_string(),
            status: MarketStatus::Settled,
            settled_side: Some(side),
            ts,
        }
    }

    fn ticker(market: &str, price: i64, ts: i64) -> TickerUpdate {
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

    #[test]
    fn test_yes_settlement_cascades_buy_no() {
        let index = event_index(&["M1", "M2", "M3"]);
        let mut proc = processor(index);

        let signals = proc.process_lifecycle(&settle("M1", TakerSide::Yes, 1_700_000_000));

        assert_eq!(signals.len(), 2);
        for signal in &signals {
            assert_eq!(signal.signal_type, SignalType::LifecycleCascade);
            assert_eq!(signal.direction, SignalDirection::BuyNo);
            assert_eq!(signal.urgency, SignalUrgency::Critical);
            assert_eq!(signal.ttl_seconds, 60);
            assert_eq!(signal.metadata["settled_market"], "M1");
        }
    }

    #[test]
    fn test_no_settlement_picks_unique_survivor() {
        let index = event_index(&["M1", "M2"]);
        let mut proc = processor(index);

        let signals = proc.process_lifecycle(&settle("M1", TakerSide::No, 1_700_000_000));

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].market_id, "M2");
        assert_eq!(signals[0].direction, SignalDirection::BuyYes);
    }

    #[test]
    fn test_no_settlement_with_many_survivors_is_silent() {
        let index = event_index(&["M1", "M2", "M3"]);
        let mut proc = processor(index);

        let signals = proc.process_lifecycle(&settle("M1", TakerSide::No, 1_700_000_000));
        assert!(signals.is_empty(), "ambiguous elimination must not signal");
    }

    #[test]
    fn test_cascade_skips_already_settled_siblings() {
        let index = event_index(&["M1", "M2", "M3"]);
        let mut proc = processor(index.clone());

        proc.process_lifecycle(&settle("M3", TakerSide::No, 1_700_000_000));
        let signals = proc.process_lifecycle(&settle("M1", TakerSide::Yes, 1_700_000_100));

        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].market_id, "M2");
    }

    #[test]
    fn test_new_market_far_from_residual_corrected() {
        let index = event_index(&["M1", "M2"]);
        let mut proc = processor(index.clone());
        let base = 1_700_000_000i64;

        // Established sibling prices: M1 40, M2 35 -> residual 25.
        proc.process_ticker(&ticker("M1", 40, base));
        proc.process_ticker(&ticker("M2", 35, base));

        // M4 opens into the event priced way above the residual.
        index.upsert(MarketMeta {
            market_id: "M4".to_string(),
            event_id: Some("EV-1".to_string()),
            series_id: Some("SER-1".to_string()),
            close_time: None,
            status: MarketStatus::Open,
        });
        proc.process_lifecycle(&LifecycleEvent {
            market_id: "M4".to_string(),
            status: MarketStatus::Open,
            settled_side: None,
            ts: base + 10,
        });
        let signals = proc.process_ticker(&ticker("M4", 60, base + 20));

        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.signal_type, SignalType::LifecycleNewMarket);
        assert_eq!(signal.direction, SignalDirection::BuyNo);
        assert_eq!(signal.metadata["implied_residual"], 25);
        assert_eq!(signal.metadata["divergence"], 35);
    }

    #[test]
    fn test_new_market_near_residual_ignored() {
        let index = event_index(&["M1", "M2"]);
        let mut proc = processor(index.clone());
        let base = 1_700_000_000i64;

        proc.process_ticker(&ticker("M1", 40, base));
        proc.process_ticker(&ticker("M2", 35, base));
        index.upsert(MarketMeta {
            market_id: "M4".to_string(),
            event_id: Some("EV-1".to_string()),
            series_id: Some("SER-1".to_string()),
            close_time: None,
            status: MarketStatus::Open,
        });
        proc.process_lifecycle(&LifecycleEvent {
            market_id: "M4".to_string(),
            status: MarketStatus::Open,
            settled_side: None,
            ts: base + 10,
        });
        let signals = proc.process_ticker(&ticker("M4", 30, base + 20));
        assert!(signals.is_empty(), "5 cents off the residual is tolerable");
    }

    #[test]
    fn test_initial_price_judged_once() {
        let index = event_index(&["M1", "M2"]);
        let mut proc = processor(index.clone());
        let base = 1_700_000_000i64;

        proc.process_ticker(&ticker("M1", 40, base));
        proc.process_ticker(&ticker("M2", 35, base));
        index.upsert(MarketMeta {
            market_id: "M4".to_string(),
            event_id: Some("EV-1".to_string()),
            series_id: Some("SER-1".to_string()),
            close_time: None,
            status: MarketStatus::Open,
        });
        proc.process_lifecycle(&LifecycleEvent {
            market_id: "M4".to_string(),
            status: MarketStatus::Open,
            settled_side: None,
            ts: base + 10,
        });
        assert_eq!(proc.process_ticker(&ticker("M4", 60, base + 20)).len(), 1);
        assert!(proc.process_ticker(&ticker("M4", 61, base + 30)).is_empty());
    }
}
