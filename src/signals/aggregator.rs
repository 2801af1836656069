//! Signal aggregator - regime-conditioned fusion into composite scores
//!
//! Consumes the fan-in signal stream, maintains the per-market active set
//! (at most one signal per signal type and direction, newest wins, opposite
//! direction evicts), expires signals on TTL and terminal market status,
//! and fuses what remains into one score in [-1, +1]. Emission is
//! throttled: only a material score change, a sign flip, a meaningful
//! membership change, or the periodic heartbeat publishes a composite.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::bus::{
    Broker, SignalPublisher, StreamConsumer, RAW_STREAM_MAXLEN, SIGNAL_STREAM_MAXLEN,
    STREAM_ALL_SIGNALS, STREAM_LIFECYCLE,
};
use crate::config::{AggregatorConfig, BusConfig};
use crate::error::SignalError;
use crate::models::LifecycleEvent;
use crate::signals::model::{
    CompositeSignal, MarketRegime, Signal, SignalDirection, SignalType,
};

/// Per-market aggregation state.
#[derive(Default)]
struct MarketAgg {
    /// (type, direction) -> newest active signal of that kind.
    active: HashMap<(SignalType, SignalDirection), Signal>,
    regime: Option<MarketRegime>,
    latest_event_ts: i64,
    last_emitted_score: Option<f64>,
    last_emitted_count: usize,
    /// Wall clock of the last emission, for the heartbeat rule.
    last_emit_wall: Option<i64>,
}

impl MarketAgg {
    fn expire(&mut self, now: i64) {
        self.active.retain(|_, signal| !signal.is_expired_at(now));
    }
}

pub struct Aggregator {
    config: AggregatorConfig,
    markets: HashMap<String, MarketAgg>,
    /// Markets that reached a terminal status; late signals for them are
    /// dropped (bus arrival order is not event order).
    terminal: HashSet<String>,
    /// Sliding dedupe window over signal ids.
    seen_ids: HashSet<String>,
    seen_order: VecDeque<(i64, String)>,
    /// Wall clock source, injectable for deterministic tests.
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self::with_clock(config, Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn with_clock(
        config: AggregatorConfig,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self {
            config,
            markets: HashMap::new(),
            terminal: HashSet::new(),
            seen_ids: HashSet::new(),
            seen_order: VecDeque::new(),
            now_fn,
        }
    }

    /// Fold one incoming signal; returns a composite when the emission
    /// rules say the world changed enough to announce.
    pub fn handle_signal(&mut self, signal: Signal) -> Option<CompositeSignal> {
        if !self.remember_id(&signal) {
            return None; // duplicate delivery
        }
        if self.terminal.contains(&signal.market_id) {
            return None; // market already settled or closed
        }

        let market_id = signal.market_id.clone();
        let state = self.markets.entry(market_id.clone()).or_default();
        if signal.ts > state.latest_event_ts {
            state.latest_event_ts = signal.ts;
        }
        let now = state.latest_event_ts;
        state.expire(now);

        if signal.signal_type == SignalType::RegimeChange {
            // Regime signals modulate; they never join the active set.
            if let Some(new_regime) = signal
                .metadata
                .get("new_regime")
                .and_then(|v| v.as_str())
                .and_then(MarketRegime::from_str)
            {
                state.regime = Some(new_regime);
            }
        } else {
            let key = (signal.signal_type, signal.direction);

            // Bus arrival order is not event-time order; an older signal
            // than the one it would replace is stale.
            if let Some(existing) = state.active.get(&key) {
                if existing.ts > signal.ts {
                    return None;
                }
            }
            if signal.is_expired_at(now) {
                return None;
            }

            // Opposite direction within the same type evicts the prior one.
            state
                .active
                .remove(&(signal.signal_type, signal.direction.opposite()));
            state.active.insert(key, signal);
        }

        self.maybe_emit(&market_id, now)
    }

    /// Terminal lifecycle transitions end every active signal for the
    /// market immediately.
    pub fn handle_lifecycle(&mut self, event: &LifecycleEvent) {
        if event.status.is_terminal() {
            self.terminal.insert(event.market_id.clone());
            if self.markets.remove(&event.market_id).is_some() {
                log::debug!(
                    "🧹 cleared active signals for terminal market {}",
                    event.market_id
                );
            }
        }
    }

    /// Heartbeat sweep: expire by event time, then apply the periodic
    /// emission rule to every market still carrying a strong score.
    pub fn heartbeat(&mut self) -> Vec<CompositeSignal> {
        let wall = (self.now_fn)();
        let market_ids: Vec<String> = self.markets.keys().cloned().collect();
        let mut out = Vec::new();

        for market_id in market_ids {
            let config = self.config.clone();
            let state = self.markets.get_mut(&market_id).unwrap();
            state.expire(state.latest_event_ts);

            let due = match state.last_emit_wall {
                Some(last) => wall - last >= config.heartbeat_sec,
                None => false,
            };
            if !due {
                continue;
            }
            let score = Self::compute_score(&config, state);
            if score.abs() < config.heartbeat_min_score {
                continue;
            }
            out.push(Self::emit(&config, &market_id, state, score, wall));
        }
        out
    }

    fn remember_id(&mut self, signal: &Signal) -> bool {
        if self.seen_ids.contains(&signal.signal_id) {
            return false;
        }
        self.seen_ids.insert(signal.signal_id.clone());
        self.seen_order.push_back((signal.ts, signal.signal_id.clone()));

        // Prune the dedupe window against the newest event time seen.
        let horizon = signal.ts - self.config.dedupe_window_sec;
        while let Some((ts, _)) = self.seen_order.front() {
            if *ts < horizon {
                let (_, id) = self.seen_order.pop_front().unwrap();
                self.seen_ids.remove(&id);
            } else {
                break;
            }
        }
        true
    }

    /// Weighted regime-conditioned sum, clamped to [-1, +1].
    fn compute_score(config: &AggregatorConfig, state: &MarketAgg) -> f64 {
        let sum: f64 = state
            .active
            .values()
            .map(|s| {
                s.direction.sign() * s.strength * s.confidence * config.weight_for(s.signal_type)
            })
            .sum();
        let multiplier = state
            .regime
            .map(|r| config.multiplier_for(r))
            .unwrap_or(1.0);
        (sum * multiplier).clamp(-1.0, 1.0)
    }

    fn direction_for(config: &AggregatorConfig, score: f64) -> SignalDirection {
        if score.abs() < config.neutral_band {
            SignalDirection::Neutral
        } else if score > 0.0 {
            SignalDirection::BuyYes
        } else {
            SignalDirection::BuyNo
        }
    }

    fn maybe_emit(&mut self, market_id: &str, now: i64) -> Option<CompositeSignal> {
        let config = self.config.clone();
        let state = self.markets.get_mut(market_id)?;
        let score = Self::compute_score(&config, state);
        let count = state.active.len();

        let last_score = state.last_emitted_score.unwrap_or(0.0);
        let delta_rule = (score - last_score).abs() >= config.emit_delta;
        let sign_flip = state.last_emitted_score.is_some()
            && score.signum() != last_score.signum()
            && score != 0.0
            && last_score != 0.0;
        let count_rule =
            count != state.last_emitted_count && score.abs() >= config.count_change_min_score;

        if !(delta_rule || sign_flip || count_rule) {
            return None;
        }

        let wall = (self.now_fn)();
        Some(Self::emit(&config, market_id, state, score, wall))
    }

    fn emit(
        config: &AggregatorConfig,
        market_id: &str,
        state: &mut MarketAgg,
        score: f64,
        wall: i64,
    ) -> CompositeSignal {
        let mut active_signal_ids: Vec<String> = state
            .active
            .values()
            .map(|s| s.signal_id.clone())
            .collect();
        active_signal_ids.sort();

        let event_id = state.active.values().find_map(|s| s.event_id.clone());
        let series_id = state.active.values().find_map(|s| s.series_id.clone());

        state.last_emitted_score = Some(score);
        state.last_emitted_count = state.active.len();
        state.last_emit_wall = Some(wall);

        let composite = CompositeSignal {
            market_id: market_id.to_string(),
            event_id,
            series_id,
            direction: Self::direction_for(config, score),
            composite_score: score,
            regime: state.regime,
            active_signal_count: active_signal_ids.len(),
            active_signal_ids,
            ts: state.latest_event_ts,
        };

        log::info!(
            "🧮 composite {} {} {:.4} ({} active, regime {:?})",
            composite.market_id,
            composite.direction.as_str(),
            composite.composite_score,
            composite.active_signal_count,
            composite.regime.map(|r| r.as_str()).unwrap_or("unknown")
        );
        composite
    }

    /// Active signals currently held for a market (test/observability hook).
    pub fn active_count(&self, market_id: &str) -> usize {
        self.markets.get(market_id).map(|m| m.active.len()).unwrap_or(0)
    }
}

/// Drive the aggregator: consume the fan-in signal stream plus lifecycle
/// (terminal statuses end active signals), publish composites, and run the
/// wall-clock heartbeat between batches.
pub async fn run_aggregator(
    mut aggregator: Aggregator,
    broker: Arc<Broker>,
    bus_config: BusConfig,
    instance_id: String,
    stop: watch::Receiver<bool>,
) -> Result<(), SignalError> {
    let consumer = StreamConsumer::new(broker.clone(), bus_config.group("aggregator"), instance_id);
    consumer.register(STREAM_ALL_SIGNALS, SIGNAL_STREAM_MAXLEN);
    consumer.register(STREAM_LIFECYCLE, RAW_STREAM_MAXLEN);
    let publisher = SignalPublisher::new(broker);

    log::info!("🚀 aggregator starting");
    let block = Duration::from_millis(bus_config.block_timeout_ms.max(100) / 2);
    let mut composites = 0u64;
    let mut processed = 0u64;
    let mut last_stats = Instant::now();

    while !*stop.borrow() {
        for stream in [STREAM_ALL_SIGNALS, STREAM_LIFECYCLE] {
            let batch = match consumer.next_batch(stream, bus_config.batch_size, block).await {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("⚠️  aggregator read failed on {}: {}", stream, e);
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            for entry in &batch {
                match stream {
                    STREAM_ALL_SIGNALS => match Signal::from_payload(&entry.payload) {
                        Ok(signal) => {
                            processed += 1;
                            if let Some(composite) = aggregator.handle_signal(signal) {
                                publisher.publish_composite(&composite)?;
                                composites += 1;
                            }
                        }
                        Err(e) => {
                            log::warn!("⚠️  aggregator dropped malformed signal: {}", e);
                        }
                    },
                    _ => match LifecycleEvent::from_payload(&entry.payload) {
                        Ok(event) => aggregator.handle_lifecycle(&event),
                        Err(e) => {
                            log::warn!("⚠️  aggregator dropped malformed lifecycle: {}", e);
                        }
                    },
                }
            }

            let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
            consumer.ack(stream, &ids);
        }

        for composite in aggregator.heartbeat() {
            publisher.publish_composite(&composite)?;
            composites += 1;
        }

        if last_stats.elapsed() >= Duration::from_secs(60) {
            log::info!(
                "📊 aggregator: {} signals in, {} composites out",
                processed,
                composites
            );
            processed = 0;
            composites = 0;
            last_stats = Instant::now();
        }
    }

    log::info!("✅ aggregator stopped");
    Ok(())
}
