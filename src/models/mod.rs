//! Wire-format records consumed from the raw data streams

pub mod lifecycle;
pub mod market;
pub mod orderbook;
pub mod ticker;
pub mod trade;

pub use lifecycle::{LifecycleEvent, MarketStatus};
pub use market::{MarketMeta, SeriesIndex};
pub use orderbook::OrderbookDelta;
pub use ticker::TickerUpdate;
pub use trade::{TakerSide, Trade};
