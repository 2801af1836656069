//! OI-divergence processor - open-interest flow against price
//!
//! Tracks an exponentially weighted open-interest velocity per market and
//! z-scores it against its own history. A significant velocity combined
//! with the short-term price direction classifies into one of four
//! positioning regimes, two of which argue with the tape.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;

use crate::bus::STREAM_TICKER_UPDATES;
use crate::config::OiConfig;
use crate::error::SignalError;
use crate::models::{SeriesIndex, TickerUpdate};
use crate::signals::model::{
    Signal, SignalDirection, SignalIdGen, SignalType, SignalUrgency,
};
use crate::signals::processor::SignalProcessor;

const OI_TTL_SEC: i64 = 600;
/// Recent deltas compared for dollar-OI confirmation.
const CONFIRM_WINDOW: usize = 5;

/// The four classic OI/price regimes. Subtype names ride along in signal
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OiSubtype {
    NewLongs,
    ShortCovering,
    NewShorts,
    LongLiquidation,
}

impl OiSubtype {
    fn as_str(&self) -> &'static str {
        match self {
            OiSubtype::NewLongs => "new_longs",
            OiSubtype::ShortCovering => "short_covering",
            OiSubtype::NewShorts => "new_shorts",
            OiSubtype::LongLiquidation => "long_liquidation",
        }
    }

    fn direction(&self) -> SignalDirection {
        match self {
            OiSubtype::NewLongs | OiSubtype::LongLiquidation => SignalDirection::BuyYes,
            OiSubtype::NewShorts | OiSubtype::ShortCovering => SignalDirection::BuyNo,
        }
    }

    /// Conviction regimes (fresh positioning) read stronger than unwinds.
    fn base_confidence(&self) -> f64 {
        match self {
            OiSubtype::NewLongs | OiSubtype::NewShorts => 0.75,
            OiSubtype::ShortCovering | OiSubtype::LongLiquidation => 0.45,
        }
    }

    fn classify(zscore: f64, price_delta: i64, threshold: f64) -> Option<Self> {
        if price_delta == 0 {
            return None;
        }
        if zscore >= threshold {
            if price_delta > 0 {
                Some(OiSubtype::NewLongs)
            } else {
                Some(OiSubtype::NewShorts)
            }
        } else if zscore <= -threshold {
            if price_delta > 0 {
                Some(OiSubtype::ShortCovering)
            } else {
                Some(OiSubtype::LongLiquidation)
            }
        } else {
            None
        }
    }
}

/// Per-market OI state: EWMA velocity, Welford stats over it, and a short
/// price history for the divergence horizon.
#[derive(Debug, Default)]
struct OiState {
    oi_velocity: f64,
    last_ts: Option<i64>,
    observations: usize,
    // Welford accumulator over velocity samples.
    vel_n: f64,
    vel_mean: f64,
    vel_m2: f64,
    prices: VecDeque<(i64, i64)>,
    oi_recent: VecDeque<i64>,
    dollar_oi_recent: VecDeque<i64>,
}

impl OiState {
    fn update_velocity(&mut self, oi_delta: f64, ts: i64, halflife_sec: f64) {
        let dt = match self.last_ts {
            Some(last) => (ts - last).max(1) as f64,
            None => halflife_sec,
        };
        let alpha = 1.0 - 0.5_f64.powf(dt / halflife_sec);
        self.oi_velocity += alpha * (oi_delta - self.oi_velocity);
        self.last_ts = Some(ts);
    }

    /// Z-score of current velocity against history accumulated so far,
    /// then fold the current sample in.
    fn zscore_and_record(&mut self) -> f64 {
        let z = if self.vel_n >= 2.0 {
            let variance = self.vel_m2 / self.vel_n;
            let std = variance.sqrt();
            if std > 1e-9 {
                (self.oi_velocity - self.vel_mean) / std
            } else {
                0.0
            }
        } else {
            0.0
        };

        self.vel_n += 1.0;
        let delta = self.oi_velocity - self.vel_mean;
        self.vel_mean += delta / self.vel_n;
        self.vel_m2 += delta * (self.oi_velocity - self.vel_mean);

        z
    }

    fn record_price(&mut self, price: i64, ts: i64, horizon_sec: i64) {
        self.prices.push_back((ts, price));
        while let Some(&(front_ts, _)) = self.prices.front() {
            if ts - front_ts > 2 * horizon_sec {
                self.prices.pop_front();
            } else {
                break;
            }
        }
    }

    /// Price change over the divergence horizon, cents.
    fn price_delta(&self, horizon_sec: i64) -> Option<i64> {
        let &(last_ts, last_price) = self.prices.back()?;
        let (_, reference) = self
            .prices
            .iter()
            .find(|(ts, _)| last_ts - ts <= horizon_sec)?;
        Some(last_price - reference)
    }

    fn last_price(&self) -> Option<i64> {
        self.prices.back().map(|&(_, p)| p)
    }

    fn record_oi(&mut self, oi_delta: i64, dollar_delta: Option<i64>) {
        self.oi_recent.push_back(oi_delta);
        while self.oi_recent.len() > CONFIRM_WINDOW {
            self.oi_recent.pop_front();
        }
        if let Some(dollar) = dollar_delta {
            self.dollar_oi_recent.push_back(dollar);
            while self.dollar_oi_recent.len() > CONFIRM_WINDOW {
                self.dollar_oi_recent.pop_front();
            }
        }
    }

    fn dollar_oi_confirms(&self) -> bool {
        if self.oi_recent.is_empty() || self.dollar_oi_recent.is_empty() {
            return false;
        }
        let oi: i64 = self.oi_recent.iter().sum();
        let dollar: i64 = self.dollar_oi_recent.iter().sum();
        (oi > 0 && dollar > 0) || (oi < 0 && dollar < 0)
    }
}

pub struct OiDivergenceProcessor {
    config: OiConfig,
    index: Arc<SeriesIndex>,
    ids: SignalIdGen,
    markets: HashMap<String, OiState>,
}

impl OiDivergenceProcessor {
    pub fn new(config: OiConfig, index: Arc<SeriesIndex>) -> Self {
        Self {
            config,
            index,
            ids: SignalIdGen::new("oi_divergence"),
            markets: HashMap::new(),
        }
    }

    pub fn process_ticker(&mut self, update: &TickerUpdate) -> Vec<Signal> {
        if update.open_interest_delta.is_none() && update.price.is_none() {
            return Vec::new();
        }

        let config = self.config.clone();
        let horizon = config.ewma_halflife_sec as i64;
        let state = self.markets.entry(update.market_id.clone()).or_default();

        if let Some(price) = update.price {
            state.record_price(price, update.ts, horizon);
        }

        let Some(oi_delta) = update.open_interest_delta else {
            return Vec::new();
        };
        state.update_velocity(oi_delta as f64, update.ts, config.ewma_halflife_sec);
        state.record_oi(oi_delta, update.dollar_open_interest_delta);
        state.observations += 1;
        let zscore = state.zscore_and_record();

        // No edge at the price extremes.
        match state.last_price() {
            Some(price) if price < config.min_price || price > config.max_price => {
                return Vec::new();
            }
            None => return Vec::new(),
            _ => {}
        }

        if state.observations < config.min_observations {
            return Vec::new();
        }

        let Some(price_delta) = state.price_delta(horizon) else {
            return Vec::new();
        };
        let Some(subtype) = OiSubtype::classify(zscore, price_delta, config.zscore_threshold)
        else {
            return Vec::new();
        };

        let confirms = state.dollar_oi_confirms();
        let sample_fill =
            (state.observations as f64 / config.min_observations as f64).min(1.0);
        let mut confidence = subtype.base_confidence() * sample_fill;
        if confirms {
            confidence = (confidence + config.dollar_confirmation_boost).min(1.0);
        }

        let oi_velocity = state.oi_velocity;
        vec![
            Signal::builder(SignalType::OiDivergence, &update.market_id, update.ts)
                .event_id(self.index.event_of(&update.market_id))
                .series_id(self.index.series_of(&update.market_id))
                .direction(subtype.direction())
                .strength((zscore.abs() / 4.0).clamp(0.0, 1.0))
                .confidence(confidence)
                .urgency(SignalUrgency::Normal)
                .ttl_seconds(OI_TTL_SEC)
                .metadata(json!({
                    "subtype": subtype.as_str(),
                    "oi_velocity": oi_velocity,
                    "oi_velocity_zscore": zscore,
                    "price_delta": price_delta,
                    "dollar_oi_confirms": confirms,
                }))
                .build(self.ids.next()),
        ]
    }
}

impl SignalProcessor for OiDivergenceProcessor {
    fn name(&self) -> &'static str {
        "oi_divergence"
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

    fn make_update(market: &str, ts: i64, price: i64, oi_delta: i64) -> TickerUpdate {
        TickerUpdate {
            market_id: market.to_string(),
            price: Some(price),
            volume_delta: None,
            open_interest_delta: Some(oi_delta),
            dollar_volume_delta: None,
            dollar_open_interest_delta: Some(oi_delta * 50),
            ts,
        }
    }

    fn processor() -> OiDivergenceProcessor {
        OiDivergenceProcessor::new(Config::default().oi, Arc::new(SeriesIndex::new()))
    }

    /// Warm up with mildly varying OI flow, then surge it while moving the
    /// price in the given direction.
    fn run_surge(price_step: i64) -> Vec<Signal> {
        let mut proc = processor();
        let mut ts = 1_700_000_000i64;
        let mut price = 50i64;
        let mut signals = Vec::new();

        for i in 0..40 {
            let delta = if i % 2 == 0 { 4 } else { 6 };
            signals.extend(proc.process_ticker(&make_update("MKT-A", ts, price, delta)));
            ts += 30;
        }
        for _ in 0..10 {
            price += price_step;
            signals.extend(proc.process_ticker(&make_update("MKT-A", ts, price, 80)));
            ts += 30;
        }
        signals
    }

    #[test]
    fn test_new_longs_on_oi_surge_with_rising_price() {
        let signals = run_surge(1);
        assert!(!signals.is_empty(), "OI surge with rising price must signal");
        let first = &signals[0];
        assert_eq!(first.direction, SignalDirection::BuyYes);
        assert_eq!(first.metadata["subtype"], "new_longs");
        assert!(first.metadata["oi_velocity_zscore"].as_f64().unwrap() >= 2.0);
        assert_eq!(first.ttl_seconds, 600);
    }

    #[test]
    fn test_new_shorts_on_oi_surge_with_falling_price() {
        let signals = run_surge(-1);
        assert!(!signals.is_empty());
        assert_eq!(signals[0].direction, SignalDirection::BuyNo);
        assert_eq!(signals[0].metadata["subtype"], "new_shorts");
    }

    #[test]
    fn test_steady_oi_is_quiet() {
        let mut proc = processor();
        let mut ts = 1_700_000_000i64;
        let mut signals = Vec::new();
        for i in 0..80 {
            let delta = if i % 2 == 0 { 4 } else { 6 };
            signals.extend(proc.process_ticker(&make_update("MKT-A", ts, 50 + (i % 3), delta)));
            ts += 30;
        }
        assert!(signals.is_empty(), "steady flow should not signal");
    }

    #[test]
    fn test_extreme_price_suppressed() {
        let mut proc = processor();
        let mut ts = 1_700_000_000i64;
        let mut signals = Vec::new();
        for i in 0..40 {
            let delta = if i % 2 == 0 { 4 } else { 6 };
            signals.extend(proc.process_ticker(&make_update("MKT-A", ts, 97, delta)));
            ts += 30;
        }
        for _ in 0..10 {
            signals.extend(proc.process_ticker(&make_update("MKT-A", ts, 98, 80)));
            ts += 30;
        }
        assert!(signals.is_empty(), "no edge at extreme prices");
    }

    #[test]
    fn test_underflow_suppresses_until_min_observations() {
        let mut proc = processor();
        let mut ts = 1_700_000_000i64;
        let mut signals = Vec::new();
        // Only 10 observations, last one a huge surge.
        for i in 0..9 {
            let delta = if i % 2 == 0 { 4 } else { 6 };
            signals.extend(proc.process_ticker(&make_update("MKT-A", ts, 50, delta)));
            ts += 30;
        }
        signals.extend(proc.process_ticker(&make_update("MKT-A", ts, 55, 500)));
        assert!(signals.is_empty(), "window not filled yet");
    }
}
