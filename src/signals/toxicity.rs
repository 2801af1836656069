//! Flow-toxicity processor - VPIN over volume-synchronized buckets
//!
//! Trades accumulate into per-market volume buckets sized to roughly one
//! minute of flow. Each closed bucket contributes an absolute buy/sell
//! imbalance to a sliding window; VPIN is the window mean. A signal fires
//! when VPIN crosses upward through the threshold, plus a burst sub-signal
//! when a bucket fills abnormally fast.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;

use crate::bus::STREAM_TRADES;
use crate::config::VpinConfig;
use crate::error::SignalError;
use crate::models::{SeriesIndex, TakerSide, Trade};
use crate::signals::model::{
    Signal, SignalDirection, SignalIdGen, SignalType, SignalUrgency,
};
use crate::signals::processor::SignalProcessor;

const VPIN_TTL_SEC: i64 = 300;
const BURST_TTL_SEC: i64 = 120;
/// Lookback for the adaptive bucket target, seconds.
const VOLUME_LOOKBACK_SEC: i64 = 300;
/// Bucket-volume history length for burst z-scores.
const BUCKET_HISTORY: usize = 50;

/// Per-market VPIN state.
#[derive(Debug, Default)]
struct FlowState {
    bucket_volume: i64,
    bucket_buy_volume: i64,
    bucket_started_ts: Option<i64>,
    bucket_target: i64,
    /// Absolute imbalances of the last K closed buckets.
    imbalances: VecDeque<f64>,
    /// Closed-bucket volumes, for burst statistics.
    bucket_volumes: VecDeque<i64>,
    /// (ts, count) of recent trades, for the adaptive bucket target.
    recent_trades: VecDeque<(i64, i64)>,
    last_vpin: f64,
}

impl FlowState {
    fn add_trade(&mut self, trade: &Trade) {
        self.recent_trades.push_back((trade.ts, trade.count));
        while let Some(&(ts, _)) = self.recent_trades.front() {
            if trade.ts - ts > VOLUME_LOOKBACK_SEC {
                self.recent_trades.pop_front();
            } else {
                break;
            }
        }

        if self.bucket_started_ts.is_none() {
            self.bucket_started_ts = Some(trade.ts);
        }
        self.bucket_volume += trade.count;
        if trade.taker_side == TakerSide::Yes {
            self.bucket_buy_volume += trade.count;
        }
    }

    /// Rolling one-minute volume estimate, floored at `min_vol`.
    fn next_bucket_target(&self, min_vol: i64) -> i64 {
        if self.recent_trades.len() < 2 {
            return min_vol;
        }
        let total: i64 = self.recent_trades.iter().map(|(_, count)| count).sum();
        let span = self.recent_trades.back().unwrap().0 - self.recent_trades.front().unwrap().0;
        let per_minute = total * 60 / span.max(60);
        per_minute.max(min_vol)
    }

    fn bucket_full(&self) -> bool {
        self.bucket_target > 0 && self.bucket_volume >= self.bucket_target
    }

    /// Signed imbalance of the open bucket: (buy - sell) / volume.
    fn signed_imbalance(&self) -> f64 {
        if self.bucket_volume == 0 {
            return 0.0;
        }
        (2 * self.bucket_buy_volume - self.bucket_volume) as f64 / self.bucket_volume as f64
    }

    fn vpin(&self) -> f64 {
        if self.imbalances.is_empty() {
            return 0.0;
        }
        self.imbalances.iter().sum::<f64>() / self.imbalances.len() as f64
    }

    /// Mean and standard deviation of closed-bucket volumes.
    fn bucket_volume_stats(&self) -> Option<(f64, f64)> {
        if self.bucket_volumes.len() < 5 {
            return None;
        }
        let n = self.bucket_volumes.len() as f64;
        let mean = self.bucket_volumes.iter().sum::<i64>() as f64 / n;
        let variance = self
            .bucket_volumes
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        Some((mean, variance.sqrt()))
    }
}

/// Details of one closed bucket, consumed by the signal checks.
struct ClosedBucket {
    volume: i64,
    signed_imbalance: f64,
    fill_seconds: i64,
    prev_vpin: f64,
    vpin: f64,
}

pub struct ToxicityProcessor {
    config: VpinConfig,
    index: Arc<SeriesIndex>,
    ids: SignalIdGen,
    markets: HashMap<String, FlowState>,
}

impl ToxicityProcessor {
    pub fn new(config: VpinConfig, index: Arc<SeriesIndex>) -> Self {
        Self {
            config,
            index,
            ids: SignalIdGen::new("toxicity"),
            markets: HashMap::new(),
        }
    }

    pub fn process_trade(&mut self, trade: &Trade) -> Vec<Signal> {
        let config = self.config.clone();
        let state = self.markets.entry(trade.market_id.clone()).or_default();
        if state.bucket_target == 0 {
            state.bucket_target = config.bucket_min_vol;
        }
        state.add_trade(trade);

        if !state.bucket_full() {
            return Vec::new();
        }

        let closed = Self::close_bucket(state, trade.ts, &config);
        let mut signals = Vec::new();

        if let Some(signal) = self.check_vpin_crossing(trade, &closed) {
            signals.push(signal);
        }
        if let Some(signal) = self.check_burst(trade, &closed) {
            signals.push(signal);
        }
        signals
    }

    /// Roll the open bucket into the window and start the next one.
    fn close_bucket(state: &mut FlowState, now: i64, config: &VpinConfig) -> ClosedBucket {
        let signed = state.signed_imbalance();
        let volume = state.bucket_volume;
        let fill_seconds = now - state.bucket_started_ts.unwrap_or(now);
        let prev_vpin = state.last_vpin;

        state.imbalances.push_back(signed.abs());
        while state.imbalances.len() > config.window {
            state.imbalances.pop_front();
        }
        let vpin = state.vpin();
        state.last_vpin = vpin;

        let closed = ClosedBucket {
            volume,
            signed_imbalance: signed,
            fill_seconds,
            prev_vpin,
            vpin,
        };

        state.bucket_volumes.push_back(volume);
        while state.bucket_volumes.len() > BUCKET_HISTORY {
            state.bucket_volumes.pop_front();
        }
        state.bucket_volume = 0;
        state.bucket_buy_volume = 0;
        state.bucket_started_ts = None;
        state.bucket_target = state.next_bucket_target(config.bucket_min_vol);

        closed
    }

    fn check_vpin_crossing(&self, trade: &Trade, closed: &ClosedBucket) -> Option<Signal> {
        if closed.prev_vpin > self.config.threshold
            || closed.vpin <= self.config.threshold
            || closed.signed_imbalance == 0.0
        {
            return None;
        }

        let state = self.markets.get(&trade.market_id)?;
        let direction = if closed.signed_imbalance > 0.0 {
            SignalDirection::BuyYes
        } else {
            SignalDirection::BuyNo
        };
        let urgency = if closed.vpin > self.config.high {
            SignalUrgency::High
        } else {
            SignalUrgency::Normal
        };

        Some(
            Signal::builder(SignalType::ToxicityVpin, &trade.market_id, trade.ts)
                .event_id(self.index.event_of(&trade.market_id))
                .series_id(self.index.series_of(&trade.market_id))
                .direction(direction)
                .strength(((closed.vpin - 0.5) / 0.5).clamp(0.0, 1.0))
                .confidence(
                    (state.imbalances.len() as f64 / self.config.window as f64).min(1.0),
                )
                .urgency(urgency)
                .ttl_seconds(VPIN_TTL_SEC)
                .metadata(json!({
                    "vpin": closed.vpin,
                    "bucket_count": state.imbalances.len(),
                    "last_imbalance": closed.signed_imbalance,
                }))
                .build(self.ids.next()),
        )
    }

    fn check_burst(&self, trade: &Trade, closed: &ClosedBucket) -> Option<Signal> {
        if closed.fill_seconds > self.config.burst_max_fill_sec {
            return None;
        }
        let state = self.markets.get(&trade.market_id)?;
        let (mean, std) = state.bucket_volume_stats()?;
        if (closed.volume as f64) < self.config.burst_volume_mult * mean {
            return None;
        }

        let zscore = if std > f64::EPSILON {
            (closed.volume as f64 - mean) / std
        } else {
            self.config.burst_volume_mult
        };

        let direction = if closed.signed_imbalance > 0.0 {
            SignalDirection::BuyYes
        } else if closed.signed_imbalance < 0.0 {
            SignalDirection::BuyNo
        } else {
            SignalDirection::Neutral
        };

        Some(
            Signal::builder(SignalType::ToxicityBurst, &trade.market_id, trade.ts)
                .event_id(self.index.event_of(&trade.market_id))
                .series_id(self.index.series_of(&trade.market_id))
                .direction(direction)
                .strength((zscore / 4.0).clamp(0.0, 1.0))
                .confidence((state.bucket_volumes.len() as f64 / 20.0).clamp(0.0, 0.9))
                .urgency(SignalUrgency::High)
                .ttl_seconds(BURST_TTL_SEC)
                .metadata(json!({
                    "bucket_volume": closed.volume,
                    "fill_seconds": closed.fill_seconds,
                    "volume_zscore": zscore,
                }))
                .build(self.ids.next()),
        )
    }
}

impl SignalProcessor for ToxicityProcessor {
    fn name(&self) -> &'static str {
        "flow_toxicity"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[STREAM_TRADES]
    }

    fn handle_event(&mut self, _stream: &str, payload: &str) -> Result<Vec<Signal>, SignalError> {
        let trade = Trade::from_payload(payload)?;
        Ok(self.process_trade(&trade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn make_trade(id: u32, market: &str, ts: i64, count: i64, side: TakerSide) -> Trade {
        Trade {
            trade_id: format!("t{}", id),
            market_id: market.to_string(),
            yes_price: 50,
            no_price: 50,
            count,
            taker_side: side,
            ts,
        }
    }

    fn processor() -> ToxicityProcessor {
        ToxicityProcessor::new(Config::default().vpin, Arc::new(SeriesIndex::new()))
    }

    #[test]
    fn test_one_sided_flow_fires_vpin_signal() {
        let mut proc = processor();
        let mut signals = Vec::new();
        // 60 trades of 100 contracts over 60s, heavily yes-sided.
        for i in 0..60u32 {
            let side = if i % 12 == 11 { TakerSide::No } else { TakerSide::Yes };
            let trade = make_trade(i, "MKT-A", 1_700_000_000 + i as i64, 100, side);
            signals.extend(proc.process_trade(&trade));
        }

        let vpin: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.signal_type == SignalType::ToxicityVpin)
            .collect();
        assert!(!vpin.is_empty(), "one-sided flow must trigger a VPIN signal");
        let first = vpin[0];
        assert_eq!(first.direction, SignalDirection::BuyYes);
        assert!(first.strength >= 0.5, "strength {} too low", first.strength);
        assert!(first.metadata["vpin"].as_f64().unwrap() >= 0.60);
    }

    #[test]
    fn test_balanced_flow_stays_quiet() {
        let mut proc = processor();
        let mut signals = Vec::new();
        for i in 0..200u32 {
            let side = if i % 2 == 0 { TakerSide::Yes } else { TakerSide::No };
            // Alternate strictly inside each bucket: 25 yes + 25 no per bucket.
            let trade = make_trade(i, "MKT-A", 1_700_000_000 + (i as i64) * 2, 1, side);
            signals.extend(proc.process_trade(&trade));
        }
        assert!(
            signals.iter().all(|s| s.signal_type != SignalType::ToxicityVpin),
            "balanced flow must not fire VPIN"
        );
    }

    #[test]
    fn test_signal_fires_only_on_upward_crossing() {
        let mut proc = processor();
        let mut vpin_count = 0;
        for i in 0..300u32 {
            let trade = make_trade(i, "MKT-A", 1_700_000_000 + i as i64 * 31, 50, TakerSide::Yes);
            vpin_count += proc
                .process_trade(&trade)
                .iter()
                .filter(|s| s.signal_type == SignalType::ToxicityVpin)
                .count();
        }
        // VPIN saturates at 1.0 and stays there; only the crossing fires.
        assert_eq!(vpin_count, 1);
    }

    #[test]
    fn test_burst_on_fast_oversized_bucket() {
        let mut proc = processor();
        let mut ts = 1_700_000_000i64;
        // Build calm history: one 50-contract bucket a minute.
        for i in 0..10u32 {
            let side = if i % 2 == 0 { TakerSide::Yes } else { TakerSide::No };
            proc.process_trade(&make_trade(i, "MKT-A", ts, 50, side));
            ts += 60;
        }
        // Then 400 contracts inside two seconds.
        let signals = proc.process_trade(&make_trade(99, "MKT-A", ts + 1, 400, TakerSide::Yes));

        assert!(
            signals.iter().any(|s| s.signal_type == SignalType::ToxicityBurst),
            "oversized fast bucket must fire a burst"
        );
        let burst = signals
            .iter()
            .find(|s| s.signal_type == SignalType::ToxicityBurst)
            .unwrap();
        assert_eq!(burst.ttl_seconds, 120);
        assert_eq!(burst.direction, SignalDirection::BuyYes);
    }

    #[test]
    fn test_confidence_tracks_window_fill() {
        let mut proc = processor();
        let mut first_conf = None;
        for i in 0..400u32 {
            let trade = make_trade(i, "MKT-A", 1_700_000_000 + i as i64 * 31, 50, TakerSide::Yes);
            for signal in proc.process_trade(&trade) {
                if signal.signal_type == SignalType::ToxicityVpin && first_conf.is_none() {
                    first_conf = Some(signal.confidence);
                }
            }
        }
        let conf = first_conf.expect("expected a VPIN signal");
        assert!(conf <= 0.1, "early signal confidence {} should be low", conf);
    }
}
