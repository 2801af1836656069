//! Signal generation and aggregation engine
//!
//! Five stateful processors over the raw data streams plus the aggregator
//! that fuses their output into one composite score per market. Processors
//! share nothing but the bus: each owns its per-market state exclusively.

pub mod aggregator;
pub mod cross_market;
pub mod gate;
pub mod lifecycle_alpha;
pub mod model;
pub mod oi_divergence;
pub mod processor;
pub mod regime;
pub mod toxicity;

pub use aggregator::{run_aggregator, Aggregator};
pub use cross_market::CrossMarketProcessor;
pub use gate::EmitGate;
pub use lifecycle_alpha::LifecycleAlphaProcessor;
pub use model::{
    CompositeSignal, MarketRegime, Signal, SignalDirection, SignalIdGen, SignalType,
    SignalUrgency,
};
pub use oi_divergence::OiDivergenceProcessor;
pub use processor::{run_processor, SignalProcessor};
pub use regime::RegimeProcessor;
pub use toxicity::ToxicityProcessor;
