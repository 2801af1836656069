//! Broker-backed message bus: named streams, consumer groups, fan-in
//!
//! Raw market-data streams come in from the ingest layer; every processor
//! publishes typed signal streams plus a fan-in `signals:all` duplicate the
//! aggregator consumes. Delivery is at-least-once: consumers acknowledge
//! after processing and unacknowledged entries are redelivered on restart.

pub mod broker;
pub mod consumer;
pub mod publisher;

pub use broker::{Broker, StreamEntry};
pub use consumer::StreamConsumer;
pub use publisher::SignalPublisher;

// Raw input streams (published by ingest, consumed by processors).
pub const STREAM_TRADES: &str = "trades";
pub const STREAM_TICKER_UPDATES: &str = "ticker_updates";
pub const STREAM_ORDERBOOK_DELTAS: &str = "orderbook_deltas";
pub const STREAM_LIFECYCLE: &str = "lifecycle";
pub const STREAM_SYSTEM: &str = "system";

// Signal output streams.
pub const STREAM_FLOW_TOXICITY: &str = "signals:flow_toxicity";
pub const STREAM_OI_DIVERGENCE: &str = "signals:oi_divergence";
pub const STREAM_REGIME: &str = "signals:regime";
pub const STREAM_CROSS_MARKET: &str = "signals:cross_market";
pub const STREAM_LIFECYCLE_SIGNALS: &str = "signals:lifecycle";
pub const STREAM_ALL_SIGNALS: &str = "signals:all";
pub const STREAM_COMPOSITE: &str = "signals:composite";

/// Approximate trim length for raw data streams.
pub const RAW_STREAM_MAXLEN: usize = 100_000;
/// Approximate trim length for signal streams.
pub const SIGNAL_STREAM_MAXLEN: usize = 10_000;
