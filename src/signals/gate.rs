//! Chatter suppression for processor output

use std::collections::HashMap;

use crate::config::GateConfig;
use crate::signals::model::{Signal, SignalDirection, SignalType};

/// Re-arm horizon: after this many cooldowns without an emission, the
/// min-delta requirement is waived so a persistent condition resurfaces.
const REARM_COOLDOWNS: i64 = 5;

#[derive(Debug, Clone, Copy)]
struct GateState {
    last_ts: i64,
    last_strength: f64,
}

/// Per-market, per-(type,direction) emit gating.
///
/// Everything is keyed on event time, so a replay of the same stream makes
/// the same decisions. Two rules: a cooldown between successive signals of
/// the same kind, and a minimum strength delta so a flat condition does not
/// re-announce itself every batch.
pub struct EmitGate {
    config: GateConfig,
    state: HashMap<(String, SignalType, SignalDirection), GateState>,
}

impl EmitGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
        }
    }

    /// Decide whether `signal` passes the gate, recording it if it does.
    pub fn allow(&mut self, signal: &Signal) -> bool {
        let key = (
            signal.market_id.clone(),
            signal.signal_type,
            signal.direction,
        );

        match self.state.get(&key) {
            None => {
                self.record(key, signal);
                true
            }
            Some(prev) => {
                let elapsed = signal.ts - prev.last_ts;
                if elapsed < self.config.cooldown_sec {
                    return false;
                }
                let delta = (signal.strength - prev.last_strength).abs();
                if delta < self.config.min_delta
                    && elapsed < self.config.cooldown_sec * REARM_COOLDOWNS
                {
                    return false;
                }
                self.record(key, signal);
                true
            }
        }
    }

    fn record(&mut self, key: (String, SignalType, SignalDirection), signal: &Signal) {
        self.state.insert(
            key,
            GateState {
                last_ts: signal.ts,
                last_strength: signal.strength,
            },
        );
    }

    /// Drop gate entries for a market that reached a terminal status.
    pub fn forget_market(&mut self, market_id: &str) {
        self.state.retain(|(market, _, _), _| market != market_id);
    }
}
