//! Microstructure regime processor - five-state machine with hysteresis
//!
//! Classifies each market as DEAD / QUIET / ACTIVE / INFORMED / PRE_SETTLE
//! from rolling trade and message rates plus best-level depth imbalance.
//! Transitions are evaluated on a fixed event-time cadence and must hold
//! through a hysteresis window before they commit, so rate flicker around
//! a boundary does not thrash the classification. Every committed
//! transition is emitted as a neutral-direction signal the aggregator uses
//! to modulate trust in everything else.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::json;

use crate::bus::{STREAM_LIFECYCLE, STREAM_ORDERBOOK_DELTAS, STREAM_TICKER_UPDATES, STREAM_TRADES};
use crate::config::{GateConfig, RegimeConfig};
use crate::error::SignalError;
use crate::models::{LifecycleEvent, OrderbookDelta, SeriesIndex, TakerSide, TickerUpdate, Trade};
use crate::signals::model::{
    MarketRegime, Signal, SignalDirection, SignalIdGen, SignalType, SignalUrgency,
};
use crate::signals::processor::SignalProcessor;

const REGIME_TTL_SEC: i64 = 600;

/// Observables snapshot used by one evaluation.
#[derive(Debug, Clone, Copy)]
struct Observables {
    trade_rate: f64,
    message_rate: f64,
    depth_imbalance: f64,
    time_to_close: Option<i64>,
}

/// Per-market regime state. `regime` and `entered_at` are what the rest of
/// the system sees; everything else is the rolling evidence.
#[derive(Debug)]
pub struct RegimeState {
    pub regime: MarketRegime,
    pub entered_at: i64,
    trade_ts: VecDeque<i64>,
    message_ts: VecDeque<i64>,
    yes_book: BTreeMap<i64, i64>,
    no_book: BTreeMap<i64, i64>,
    last_eval_ts: i64,
    /// Candidate transition and when its condition started holding.
    pending: Option<(MarketRegime, i64)>,
}

impl RegimeState {
    fn new(ts: i64) -> Self {
        Self {
            regime: MarketRegime::Dead,
            entered_at: ts,
            trade_ts: VecDeque::new(),
            message_ts: VecDeque::new(),
            yes_book: BTreeMap::new(),
            no_book: BTreeMap::new(),
            last_eval_ts: ts,
            pending: None,
        }
    }

    fn record_message(&mut self, ts: i64, window_sec: i64) {
        self.message_ts.push_back(ts);
        Self::prune(&mut self.message_ts, ts, window_sec);
    }

    fn record_trade(&mut self, ts: i64, window_sec: i64) {
        self.trade_ts.push_back(ts);
        Self::prune(&mut self.trade_ts, ts, window_sec);
    }

    fn apply_book_delta(&mut self, delta: &OrderbookDelta) {
        let book = match delta.side {
            TakerSide::Yes => &mut self.yes_book,
            TakerSide::No => &mut self.no_book,
        };
        let size = book.entry(delta.price).or_insert(0);
        *size += delta.delta;
        if *size <= 0 {
            book.remove(&delta.price);
        }
    }

    fn prune(window: &mut VecDeque<i64>, now: i64, window_sec: i64) {
        while let Some(&front) = window.front() {
            if now - front > window_sec {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Best-level imbalance in [-1, +1]: +1 all yes depth, -1 all no.
    fn depth_imbalance(&self) -> f64 {
        let yes = self
            .yes_book
            .iter()
            .next_back()
            .map(|(_, &size)| size)
            .unwrap_or(0);
        let no = self
            .no_book
            .iter()
            .next_back()
            .map(|(_, &size)| size)
            .unwrap_or(0);
        let total = yes + no;
        if total == 0 {
            return 0.0;
        }
        (yes - no) as f64 / total as f64
    }

    fn observe(&mut self, now: i64, window_sec: i64, close_time: Option<i64>) -> Observables {
        Self::prune(&mut self.trade_ts, now, window_sec);
        Self::prune(&mut self.message_ts, now, window_sec);
        let per_minute = 60.0 / window_sec as f64;
        Observables {
            trade_rate: self.trade_ts.len() as f64 * per_minute,
            message_rate: self.message_ts.len() as f64 * per_minute,
            depth_imbalance: self.depth_imbalance(),
            time_to_close: close_time.map(|close| close - now),
        }
    }
}

fn transition_strength(to: MarketRegime) -> f64 {
    match to {
        MarketRegime::Informed | MarketRegime::PreSettle => 0.9,
        MarketRegime::Active => 0.6,
        MarketRegime::Quiet => 0.4,
        MarketRegime::Dead => 0.3,
    }
}

pub struct RegimeProcessor {
    config: RegimeConfig,
    index: Arc<SeriesIndex>,
    ids: SignalIdGen,
    markets: HashMap<String, RegimeState>,
    /// High-water event time across all markets; drives the sweep clock.
    latest_ts: i64,
}

impl RegimeProcessor {
    pub fn new(config: RegimeConfig, index: Arc<SeriesIndex>) -> Self {
        Self {
            config,
            index,
            ids: SignalIdGen::new("regime"),
            markets: HashMap::new(),
            latest_ts: 0,
        }
    }

    fn state_mut(&mut self, market_id: &str, ts: i64) -> &mut RegimeState {
        self.markets
            .entry(market_id.to_string())
            .or_insert_with(|| RegimeState::new(ts))
    }

    fn touch(&mut self, ts: i64) {
        if ts > self.latest_ts {
            self.latest_ts = ts;
        }
    }

    /// Where the machine wants to go from `current`, one step at a time.
    /// PRE_SETTLE dominates; DEAD catches total silence from anywhere.
    fn target(&self, current: MarketRegime, obs: &Observables) -> MarketRegime {
        if let Some(ttc) = obs.time_to_close {
            if ttc < self.config.pre_settle_min * 60 {
                return MarketRegime::PreSettle;
            }
        }
        if current == MarketRegime::PreSettle {
            return MarketRegime::PreSettle;
        }
        if obs.trade_rate < self.config.dead_trade_rate
            && obs.message_rate < self.config.dead_message_rate
        {
            return MarketRegime::Dead;
        }

        match current {
            MarketRegime::Dead => {
                if obs.trade_rate >= self.config.quiet_trade_rate {
                    MarketRegime::Quiet
                } else {
                    MarketRegime::Dead
                }
            }
            MarketRegime::Quiet => {
                if obs.trade_rate >= self.config.active_trade_rate
                    || obs.message_rate >= self.config.active_message_rate
                {
                    MarketRegime::Active
                } else {
                    MarketRegime::Quiet
                }
            }
            MarketRegime::Active => {
                if obs.depth_imbalance.abs() >= self.config.informed_imbalance
                    && obs.trade_rate >= self.config.active_trade_rate
                {
                    MarketRegime::Informed
                } else if obs.trade_rate < self.config.active_exit_trade_rate {
                    MarketRegime::Quiet
                } else {
                    MarketRegime::Active
                }
            }
            MarketRegime::Informed => {
                if obs.depth_imbalance.abs() < self.config.informed_exit_imbalance {
                    MarketRegime::Active
                } else {
                    MarketRegime::Informed
                }
            }
            MarketRegime::PreSettle => MarketRegime::PreSettle,
        }
    }

    /// Evaluate one market at `now`; returns the transition signal if the
    /// machine committed a move.
    fn evaluate(&mut self, market_id: &str, now: i64) -> Option<Signal> {
        let close_time = self.index.close_time(market_id);
        let config = self.config.clone();

        let state = self.markets.get_mut(market_id)?;
        if now - state.last_eval_ts < config.eval_period_sec {
            return None;
        }
        state.last_eval_ts = now;

        let obs = state.observe(now, config.window_sec, close_time);
        let current = state.regime;
        let target = self.target(current, &obs);

        let state = self.markets.get_mut(market_id)?;
        if target == current {
            state.pending = None;
            return None;
        }

        // PRE_SETTLE commits immediately; everything else must hold through
        // the hysteresis window.
        let commit = if target == MarketRegime::PreSettle {
            true
        } else {
            match state.pending {
                Some((pending, since)) if pending == target => {
                    now - since >= config.hysteresis_sec
                }
                _ => {
                    state.pending = Some((target, now));
                    false
                }
            }
        };
        if !commit {
            return None;
        }

        let old = state.regime;
        state.regime = target;
        state.entered_at = now;
        state.pending = None;

        log::info!(
            "🔀 {} regime {} -> {} (trades/min {:.1}, msgs/min {:.1}, imbalance {:.2})",
            market_id,
            old.as_str(),
            target.as_str(),
            obs.trade_rate,
            obs.message_rate,
            obs.depth_imbalance
        );

        let urgency = match target {
            MarketRegime::Informed | MarketRegime::PreSettle => SignalUrgency::High,
            _ => SignalUrgency::Low,
        };

        Some(
            Signal::builder(SignalType::RegimeChange, market_id, now)
                .event_id(self.index.event_of(market_id))
                .series_id(self.index.series_of(market_id))
                .direction(SignalDirection::Neutral)
                .strength(transition_strength(target))
                .confidence(0.8)
                .urgency(urgency)
                .ttl_seconds(REGIME_TTL_SEC)
                .metadata(json!({
                    "old_regime": old.as_str(),
                    "new_regime": target.as_str(),
                    "trade_rate": obs.trade_rate,
                    "message_rate": obs.message_rate,
                    "depth_imbalance": obs.depth_imbalance,
                    "time_to_close_sec": obs.time_to_close,
                }))
                .build(self.ids.next()),
        )
    }

    /// Sweep every tracked market against the event-time high-water mark.
    pub fn evaluate_due(&mut self) -> Vec<Signal> {
        let now = self.latest_ts;
        if now == 0 {
            return Vec::new();
        }
        let market_ids: Vec<String> = self.markets.keys().cloned().collect();
        market_ids
            .into_iter()
            .filter_map(|market_id| self.evaluate(&market_id, now))
            .collect()
    }

    pub fn current_regime(&self, market_id: &str) -> Option<MarketRegime> {
        self.markets.get(market_id).map(|s| s.regime)
    }
}

impl SignalProcessor for RegimeProcessor {
    fn name(&self) -> &'static str {
        "regime"
    }

    fn input_streams(&self) -> &'static [&'static str] {
        &[
            STREAM_TRADES,
            STREAM_TICKER_UPDATES,
            STREAM_ORDERBOOK_DELTAS,
            STREAM_LIFECYCLE,
        ]
    }

    fn handle_event(&mut self, stream: &str, payload: &str) -> Result<Vec<Signal>, SignalError> {
        let window = self.config.window_sec;
        match stream {
            STREAM_TRADES => {
                let trade = Trade::from_payload(payload)?;
                self.touch(trade.ts);
                let state = self.state_mut(&trade.market_id, trade.ts);
                state.record_trade(trade.ts, window);
                state.record_message(trade.ts, window);
            }
            STREAM_TICKER_UPDATES => {
                let update = TickerUpdate::from_payload(payload)?;
                self.touch(update.ts);
                let state = self.state_mut(&update.market_id, update.ts);
                state.record_message(update.ts, window);
            }
            STREAM_ORDERBOOK_DELTAS => {
                let delta = OrderbookDelta::from_payload(payload)?;
                self.touch(delta.ts);
                let state = self.state_mut(&delta.market_id, delta.ts);
                state.record_message(delta.ts, window);
                state.apply_book_delta(&delta);
            }
            STREAM_LIFECYCLE => {
                let event = LifecycleEvent::from_payload(payload)?;
                self.touch(event.ts);
                self.index.apply_lifecycle(&event);
                if event.status.is_terminal() {
                    self.markets.remove(&event.market_id);
                }
            }
            other => {
                return Err(SignalError::Malformed(format!("unexpected stream {}", other)));
            }
        }
        Ok(Vec::new())
    }

    fn housekeeping(&mut self) -> Vec<Signal> {
        self.evaluate_due()
    }

    /// Transitions are already throttled by the evaluation cadence and
    /// hysteresis; the default 30s cooldown would swallow legitimate ramps.
    fn gate_config(&self, _defaults: &GateConfig) -> GateConfig {
        GateConfig {
            cooldown_sec: self.config.eval_period_sec,
            min_delta: 0.0,
        }
    }
}
