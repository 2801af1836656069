//! Signal data model - the shared contract for every processor
//!
//! A `Signal` is one processor's observation about one market. It stays
//! active until its TTL expires or the market reaches a terminal status,
//! and it must satisfy the publication invariants checked by `validate`
//! before it is allowed onto the bus.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus;
use crate::error::SignalError;

/// Directional lean of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    BuyYes,
    BuyNo,
    Neutral,
}

impl SignalDirection {
    /// Contribution sign in the composite: +1 / -1 / 0.
    pub fn sign(&self) -> f64 {
        match self {
            SignalDirection::BuyYes => 1.0,
            SignalDirection::BuyNo => -1.0,
            SignalDirection::Neutral => 0.0,
        }
    }

    pub fn opposite(&self) -> SignalDirection {
        match self {
            SignalDirection::BuyYes => SignalDirection::BuyNo,
            SignalDirection::BuyNo => SignalDirection::BuyYes,
            SignalDirection::Neutral => SignalDirection::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::BuyYes => "buy_yes",
            SignalDirection::BuyNo => "buy_no",
            SignalDirection::Neutral => "neutral",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalUrgency {
    Low,
    Normal,
    High,
    Critical,
}

impl SignalUrgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalUrgency::Low => "low",
            SignalUrgency::Normal => "normal",
            SignalUrgency::High => "high",
            SignalUrgency::Critical => "critical",
        }
    }
}

/// Per-market microstructure regime, produced by the regime processor and
/// consumed by the aggregator as a trust multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Dead,
    Quiet,
    Active,
    Informed,
    PreSettle,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Dead => "dead",
            MarketRegime::Quiet => "quiet",
            MarketRegime::Active => "active",
            MarketRegime::Informed => "informed",
            MarketRegime::PreSettle => "pre_settle",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dead" => Some(MarketRegime::Dead),
            "quiet" => Some(MarketRegime::Quiet),
            "active" => Some(MarketRegime::Active),
            "informed" => Some(MarketRegime::Informed),
            "pre_settle" => Some(MarketRegime::PreSettle),
            _ => None,
        }
    }
}

/// Every signal type in the system, mapped to its typed output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    ToxicityVpin,
    ToxicityBurst,
    OiDivergence,
    CrossMarket,
    LifecycleCascade,
    LifecycleNewMarket,
    RegimeChange,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::ToxicityVpin => "toxicity_vpin",
            SignalType::ToxicityBurst => "toxicity_burst",
            SignalType::OiDivergence => "oi_divergence",
            SignalType::CrossMarket => "cross_market",
            SignalType::LifecycleCascade => "lifecycle_cascade",
            SignalType::LifecycleNewMarket => "lifecycle_new_market",
            SignalType::RegimeChange => "regime_change",
        }
    }

    /// Typed output stream this signal type is published to (in addition
    /// to the fan-in stream).
    pub fn stream(&self) -> &'static str {
        match self {
            SignalType::ToxicityVpin | SignalType::ToxicityBurst => bus::STREAM_FLOW_TOXICITY,
            SignalType::OiDivergence => bus::STREAM_OI_DIVERGENCE,
            SignalType::RegimeChange => bus::STREAM_REGIME,
            SignalType::CrossMarket => bus::STREAM_CROSS_MARKET,
            SignalType::LifecycleCascade | SignalType::LifecycleNewMarket => {
                bus::STREAM_LIFECYCLE_SIGNALS
            }
        }
    }
}

/// One processor observation about one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub signal_type: SignalType,
    pub market_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    pub direction: SignalDirection,
    pub strength: f64,
    pub confidence: f64,
    pub urgency: SignalUrgency,
    /// Event time, unix seconds.
    pub ts: i64,
    pub ttl_seconds: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Signal {
    pub fn builder(signal_type: SignalType, market_id: &str, ts: i64) -> SignalBuilder {
        SignalBuilder {
            signal_type,
            market_id: market_id.to_string(),
            event_id: None,
            series_id: None,
            direction: SignalDirection::Neutral,
            strength: 0.0,
            confidence: 0.0,
            urgency: SignalUrgency::Normal,
            ts,
            ttl_seconds: 300,
            metadata: serde_json::Value::Null,
        }
    }

    /// Active at `t` iff `ts <= t < ts + ttl_seconds`. Terminal-status
    /// eviction is the aggregator's concern; expiry is purely temporal.
    pub fn is_active_at(&self, t: i64) -> bool {
        self.ts <= t && t < self.ts + self.ttl_seconds
    }

    pub fn is_expired_at(&self, t: i64) -> bool {
        t >= self.ts + self.ttl_seconds
    }

    /// Publication invariants. A violation is fatal for the worker; the
    /// signal never reaches the bus.
    pub fn validate(&self) -> Result<(), SignalError> {
        if self.signal_id.is_empty() {
            return Err(SignalError::InvariantViolation("empty signal_id".to_string()));
        }
        if self.market_id.is_empty() {
            return Err(SignalError::InvariantViolation("empty market_id".to_string()));
        }
        if !(0.0..=1.0).contains(&self.strength) || !self.strength.is_finite() {
            return Err(SignalError::InvariantViolation(format!(
                "strength {} outside [0,1]",
                self.strength
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) || !self.confidence.is_finite() {
            return Err(SignalError::InvariantViolation(format!(
                "confidence {} outside [0,1]",
                self.confidence
            )));
        }
        if self.ttl_seconds <= 0 {
            return Err(SignalError::InvariantViolation(format!(
                "ttl_seconds {} not positive",
                self.ttl_seconds
            )));
        }
        Ok(())
    }

    pub fn from_payload(payload: &str) -> Result<Self, SignalError> {
        serde_json::from_str(payload)
            .map_err(|e| SignalError::Malformed(format!("signal: {}", e)))
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("signal serialization cannot fail")
    }
}

pub struct SignalBuilder {
    signal_type: SignalType,
    market_id: String,
    event_id: Option<String>,
    series_id: Option<String>,
    direction: SignalDirection,
    strength: f64,
    confidence: f64,
    urgency: SignalUrgency,
    ts: i64,
    ttl_seconds: i64,
    metadata: serde_json::Value,
}

impl SignalBuilder {
    pub fn event_id(mut self, event_id: Option<String>) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn series_id(mut self, series_id: Option<String>) -> Self {
        self.series_id = series_id;
        self
    }

    pub fn direction(mut self, direction: SignalDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn urgency(mut self, urgency: SignalUrgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn build(self, signal_id: String) -> Signal {
        Signal {
            signal_id,
            signal_type: self.signal_type,
            market_id: self.market_id,
            event_id: self.event_id,
            series_id: self.series_id,
            direction: self.direction,
            strength: self.strength,
            confidence: self.confidence,
            urgency: self.urgency,
            ts: self.ts,
            ttl_seconds: self.ttl_seconds,
            metadata: self.metadata,
        }
    }
}

/// System-wide unique signal ids: source name, monotonic counter, random
/// suffix. The counter keeps ids ordered per source; the suffix keeps ids
/// unique across restarted instances with the same source name.
pub struct SignalIdGen {
    source: String,
    counter: AtomicU64,
}

impl SignalIdGen {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", self.source, seq, Uuid::new_v4().simple())
    }
}

/// Aggregator output: one fused directional score per market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSignal {
    pub market_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    pub direction: SignalDirection,
    pub composite_score: f64,
    pub regime: Option<MarketRegime>,
    /// Ids of the signals contributing to this score, for traceability.
    pub active_signal_ids: Vec<String>,
    pub active_signal_count: usize,
    /// Event time of the update that triggered this emission.
    pub ts: i64,
}

impl CompositeSignal {
    pub fn from_payload(payload: &str) -> Result<Self, SignalError> {
        serde_json::from_str(payload)
            .map_err(|e| SignalError::Malformed(format!("composite: {}", e)))
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("composite serialization cannot fail")
    }
}
