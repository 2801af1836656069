//! Runtime configuration from environment variables
//!
//! Every tuning parameter is an environment variable with a default. Workers
//! call `Config::from_env()` once at startup after `dotenv::dotenv()`.

use std::env;

use crate::signals::model::{MarketRegime, SignalType};

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Bus and consumer-loop settings shared by every worker.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Prefix for consumer-group names, so parallel deployments can share
    /// a broker without stealing each other's cursors.
    pub group_prefix: String,
    /// Max events per batch read.
    pub batch_size: usize,
    /// Blocking-read timeout per batch.
    pub block_timeout_ms: u64,
    /// Acks after this many handler retries on the same batch (poison cap).
    pub max_batch_retries: u32,
}

impl BusConfig {
    pub fn from_env() -> Self {
        Self {
            group_prefix: env_string("CONSUMER_GROUP_PREFIX", "kass"),
            batch_size: env_usize("BATCH_SIZE", 100),
            block_timeout_ms: env_u64("BLOCK_TIMEOUT_MS", 5_000),
            max_batch_retries: env_u64("MAX_BATCH_RETRIES", 3) as u32,
        }
    }

    pub fn group(&self, name: &str) -> String {
        format!("{}:{}", self.group_prefix, name)
    }
}

/// Emit gating applied to every processor's output.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Event-time cooldown between signals of the same (market, type,
    /// direction), seconds.
    pub cooldown_sec: i64,
    /// Minimum strength change required within the re-arm horizon.
    pub min_delta: f64,
}

impl GateConfig {
    pub fn from_env() -> Self {
        Self {
            cooldown_sec: env_i64("SIGNAL_COOLDOWN_SEC", 30),
            min_delta: env_f64("SIGNAL_MIN_DELTA", 0.05),
        }
    }
}

/// Flow-toxicity (VPIN) processor settings.
#[derive(Debug, Clone)]
pub struct VpinConfig {
    /// Floor on the adaptive volume-bucket size, contracts.
    pub bucket_min_vol: i64,
    /// Buckets in the sliding VPIN window.
    pub window: usize,
    /// Emit when VPIN crosses upward through this.
    pub threshold: f64,
    /// VPIN above this escalates urgency.
    pub high: f64,
    /// Burst: bucket must close within this many seconds...
    pub burst_max_fill_sec: i64,
    /// ...with at least this multiple of the rolling mean bucket volume.
    pub burst_volume_mult: f64,
}

impl VpinConfig {
    pub fn from_env() -> Self {
        Self {
            bucket_min_vol: env_i64("VPIN_BUCKET_MIN_VOL", 50),
            window: env_usize("VPIN_WINDOW", 50),
            threshold: env_f64("VPIN_THRESHOLD", 0.60),
            high: env_f64("VPIN_HIGH", 0.80),
            burst_max_fill_sec: env_i64("VPIN_BURST_MAX_FILL_SEC", 10),
            burst_volume_mult: env_f64("VPIN_BURST_VOLUME_MULT", 3.0),
        }
    }
}

/// OI-divergence processor settings.
#[derive(Debug, Clone)]
pub struct OiConfig {
    pub zscore_threshold: f64,
    pub ewma_halflife_sec: f64,
    /// Observations required before any signal.
    pub min_observations: usize,
    /// No edge at the price extremes; suppress signals outside this band.
    pub min_price: i64,
    pub max_price: i64,
    /// Confidence boost when dollar OI confirms contract-count OI.
    pub dollar_confirmation_boost: f64,
}

impl OiConfig {
    pub fn from_env() -> Self {
        Self {
            zscore_threshold: env_f64("OI_ZSCORE_THRESHOLD", 2.0),
            ewma_halflife_sec: env_f64("OI_EWMA_HALFLIFE_SEC", 300.0),
            min_observations: env_usize("OI_MIN_OBSERVATIONS", 30),
            min_price: env_i64("OI_MIN_PRICE", 5),
            max_price: env_i64("OI_MAX_PRICE", 95),
            dollar_confirmation_boost: env_f64("OI_DOLLAR_CONFIRMATION_BOOST", 0.15),
        }
    }
}

/// Regime state-machine settings.
#[derive(Debug, Clone)]
pub struct RegimeConfig {
    /// Evaluation cadence per market, event-time seconds.
    pub eval_period_sec: i64,
    /// An opposing condition must hold this long before transitioning.
    pub hysteresis_sec: i64,
    /// Minutes to close that force PRE_SETTLE.
    pub pre_settle_min: i64,
    /// Rolling observation window, seconds.
    pub window_sec: i64,
    pub dead_trade_rate: f64,
    pub dead_message_rate: f64,
    pub quiet_trade_rate: f64,
    pub active_trade_rate: f64,
    pub active_message_rate: f64,
    pub active_exit_trade_rate: f64,
    pub informed_imbalance: f64,
    pub informed_exit_imbalance: f64,
}

impl RegimeConfig {
    pub fn from_env() -> Self {
        Self {
            eval_period_sec: env_i64("REGIME_EVAL_PERIOD_SEC", 5),
            hysteresis_sec: env_i64("REGIME_HYSTERESIS_SEC", 15),
            pre_settle_min: env_i64("PRE_SETTLE_MIN", 15),
            window_sec: env_i64("REGIME_WINDOW_SEC", 30),
            dead_trade_rate: env_f64("REGIME_DEAD_TRADE_RATE", 0.1),
            dead_message_rate: env_f64("REGIME_DEAD_MESSAGE_RATE", 1.0),
            quiet_trade_rate: env_f64("REGIME_QUIET_TRADE_RATE", 0.5),
            active_trade_rate: env_f64("REGIME_ACTIVE_TRADE_RATE", 5.0),
            active_message_rate: env_f64("REGIME_ACTIVE_MESSAGE_RATE", 20.0),
            active_exit_trade_rate: env_f64("REGIME_ACTIVE_EXIT_TRADE_RATE", 2.0),
            informed_imbalance: env_f64("REGIME_INFORMED_IMBALANCE", 0.6),
            informed_exit_imbalance: env_f64("REGIME_INFORMED_EXIT_IMBALANCE", 0.3),
        }
    }
}

/// Cross-market propagation settings.
#[derive(Debug, Clone)]
pub struct CrossMarketConfig {
    /// Leader move threshold, cents.
    pub leader_min_move: i64,
    /// Leader move must complete within this window, seconds.
    pub leader_window_sec: i64,
    /// A sibling that moved at least this much is not lagging, cents.
    pub follower_max_move: i64,
    /// Sibling lookback, seconds.
    pub window_sec: i64,
    /// Skip siblings signaled in the same direction within this, seconds.
    pub suppression_sec: i64,
    /// Sibling fan-out cap per event.
    pub max_siblings: usize,
}

impl CrossMarketConfig {
    pub fn from_env() -> Self {
        Self {
            leader_min_move: env_i64("CROSS_LEADER_MIN_MOVE", 3),
            leader_window_sec: env_i64("CROSS_LEADER_WINDOW_SEC", 60),
            follower_max_move: env_i64("CROSS_FOLLOWER_MAX_MOVE", 1),
            window_sec: env_i64("CROSS_WINDOW_SEC", 120),
            suppression_sec: env_i64("CROSS_SUPPRESSION_SEC", 60),
            max_siblings: env_usize("CROSS_MAX_SIBLINGS", 20),
        }
    }
}

/// Lifecycle-alpha settings.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Cascade signal TTL, seconds.
    pub cascade_ttl_sec: i64,
    /// Window after open during which initial pricing is evaluated.
    pub new_market_window_sec: i64,
    /// Divergence from implied residual that triggers a correction, cents.
    pub new_market_min_divergence: i64,
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        Self {
            cascade_ttl_sec: env_i64("LIFECYCLE_CASCADE_TTL_SEC", 60),
            new_market_window_sec: env_i64("LIFECYCLE_NEW_MARKET_WINDOW_SEC", 300),
            new_market_min_divergence: env_i64("LIFECYCLE_NEW_MARKET_MIN_DIVERGENCE", 15),
        }
    }
}

/// Aggregator fusion settings: weights, regime multipliers, emission rules.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub emit_delta: f64,
    pub neutral_band: f64,
    /// Wall-clock heartbeat for emission rule (d), seconds.
    pub heartbeat_sec: i64,
    /// Minimum |score| for the count-changed emission rule (c).
    pub count_change_min_score: f64,
    /// Minimum |score| for the heartbeat emission rule (d).
    pub heartbeat_min_score: f64,
    /// Sliding dedupe window for signal ids, seconds.
    pub dedupe_window_sec: i64,
    pub weight_toxicity_vpin: f64,
    pub weight_toxicity_burst: f64,
    pub weight_oi_divergence: f64,
    pub weight_cross_market: f64,
    pub weight_lifecycle_cascade: f64,
    pub weight_lifecycle_new_market: f64,
    pub mult_dead: f64,
    pub mult_quiet: f64,
    pub mult_active: f64,
    pub mult_informed: f64,
    pub mult_pre_settle: f64,
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        Self {
            emit_delta: env_f64("AGG_EMIT_DELTA", 0.10),
            neutral_band: env_f64("AGG_NEUTRAL_BAND", 0.05),
            heartbeat_sec: env_i64("AGG_HEARTBEAT_SEC", 60),
            count_change_min_score: env_f64("AGG_COUNT_CHANGE_MIN_SCORE", 0.15),
            heartbeat_min_score: env_f64("AGG_HEARTBEAT_MIN_SCORE", 0.20),
            dedupe_window_sec: env_i64("AGG_DEDUPE_WINDOW_SEC", 300),
            weight_toxicity_vpin: env_f64("WEIGHT_TOXICITY_VPIN", 0.25),
            weight_toxicity_burst: env_f64("WEIGHT_TOXICITY_BURST", 0.15),
            weight_oi_divergence: env_f64("WEIGHT_OI_DIVERGENCE", 0.25),
            weight_cross_market: env_f64("WEIGHT_CROSS_MARKET", 0.20),
            weight_lifecycle_cascade: env_f64("WEIGHT_LIFECYCLE_CASCADE", 0.30),
            weight_lifecycle_new_market: env_f64("WEIGHT_LIFECYCLE_NEW_MARKET", 0.15),
            mult_dead: env_f64("REGIME_MULT_DEAD", 0.2),
            mult_quiet: env_f64("REGIME_MULT_QUIET", 0.6),
            mult_active: env_f64("REGIME_MULT_ACTIVE", 1.0),
            mult_informed: env_f64("REGIME_MULT_INFORMED", 1.3),
            mult_pre_settle: env_f64("REGIME_MULT_PRE_SETTLE", 1.5),
        }
    }

    /// Base weight per signal type. Regime changes carry no weight; they
    /// modulate the composite rather than contribute to it.
    pub fn weight_for(&self, signal_type: SignalType) -> f64 {
        match signal_type {
            SignalType::ToxicityVpin => self.weight_toxicity_vpin,
            SignalType::ToxicityBurst => self.weight_toxicity_burst,
            SignalType::OiDivergence => self.weight_oi_divergence,
            SignalType::CrossMarket => self.weight_cross_market,
            SignalType::LifecycleCascade => self.weight_lifecycle_cascade,
            SignalType::LifecycleNewMarket => self.weight_lifecycle_new_market,
            SignalType::RegimeChange => 0.0,
        }
    }

    pub fn multiplier_for(&self, regime: MarketRegime) -> f64 {
        match regime {
            MarketRegime::Dead => self.mult_dead,
            MarketRegime::Quiet => self.mult_quiet,
            MarketRegime::Active => self.mult_active,
            MarketRegime::Informed => self.mult_informed,
            MarketRegime::PreSettle => self.mult_pre_settle,
        }
    }
}

/// Audit-writer settings.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub db_path: String,
}

impl AuditConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env_string("AUDIT_DB_PATH", "kass_audit.db"),
        }
    }
}

/// Full configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusConfig,
    pub gate: GateConfig,
    pub vpin: VpinConfig,
    pub oi: OiConfig,
    pub regime: RegimeConfig,
    pub cross_market: CrossMarketConfig,
    pub lifecycle: LifecycleConfig,
    pub aggregator: AggregatorConfig,
    pub audit: AuditConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            gate: GateConfig::from_env(),
            vpin: VpinConfig::from_env(),
            oi: OiConfig::from_env(),
            regime: RegimeConfig::from_env(),
            cross_market: CrossMarketConfig::from_env(),
            lifecycle: LifecycleConfig::from_env(),
            aggregator: AggregatorConfig::from_env(),
            audit: AuditConfig::from_env(),
        }
    }
}

impl Default for Config {
    /// Documented defaults without touching the environment. Tests run in
    /// parallel, so reading env vars here would race with override tests.
    fn default() -> Self {
        Self {
            bus: BusConfig {
                group_prefix: "kass".to_string(),
                batch_size: 100,
                block_timeout_ms: 5_000,
                max_batch_retries: 3,
            },
            gate: GateConfig { cooldown_sec: 30, min_delta: 0.05 },
            vpin: VpinConfig {
                bucket_min_vol: 50,
                window: 50,
                threshold: 0.60,
                high: 0.80,
                burst_max_fill_sec: 10,
                burst_volume_mult: 3.0,
            },
            oi: OiConfig {
                zscore_threshold: 2.0,
                ewma_halflife_sec: 300.0,
                min_observations: 30,
                min_price: 5,
                max_price: 95,
                dollar_confirmation_boost: 0.15,
            },
            regime: RegimeConfig {
                eval_period_sec: 5,
                hysteresis_sec: 15,
                pre_settle_min: 15,
                window_sec: 30,
                dead_trade_rate: 0.1,
                dead_message_rate: 1.0,
                quiet_trade_rate: 0.5,
                active_trade_rate: 5.0,
                active_message_rate: 20.0,
                active_exit_trade_rate: 2.0,
                informed_imbalance: 0.6,
                informed_exit_imbalance: 0.3,
            },
            cross_market: CrossMarketConfig {
                leader_min_move: 3,
                leader_window_sec: 60,
                follower_max_move: 1,
                window_sec: 120,
                suppression_sec: 60,
                max_siblings: 20,
            },
            lifecycle: LifecycleConfig {
                cascade_ttl_sec: 60,
                new_market_window_sec: 300,
                new_market_min_divergence: 15,
            },
            aggregator: AggregatorConfig {
                emit_delta: 0.10,
                neutral_band: 0.05,
                heartbeat_sec: 60,
                count_change_min_score: 0.15,
                heartbeat_min_score: 0.20,
                dedupe_window_sec: 300,
                weight_toxicity_vpin: 0.25,
                weight_toxicity_burst: 0.15,
                weight_oi_divergence: 0.25,
                weight_cross_market: 0.20,
                weight_lifecycle_cascade: 0.30,
                weight_lifecycle_new_market: 0.15,
                mult_dead: 0.2,
                mult_quiet: 0.6,
                mult_active: 1.0,
                mult_informed: 1.3,
                mult_pre_settle: 1.5,
            },
            audit: AuditConfig { db_path: "kass_audit.db".to_string() },
        }
    }
}
