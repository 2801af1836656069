//! Orderbook level-change records

use serde::{Deserialize, Serialize};

use crate::error::SignalError;
use crate::models::trade::TakerSide;

/// One level change on one side of a market's book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderbookDelta {
    pub market_id: String,
    pub side: TakerSide,
    pub price: i64,
    /// Signed contract-count change at this level.
    pub delta: i64,
    /// Advisory flag from the ingest layer; never used to skip events.
    #[serde(default)]
    pub is_own_order: bool,
    /// Unix timestamp in seconds (event time).
    pub ts: i64,
}

impl OrderbookDelta {
    pub fn from_payload(payload: &str) -> Result<Self, SignalError> {
        serde_json::from_str(payload)
            .map_err(|e| SignalError::Malformed(format!("orderbook delta: {}", e)))
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("orderbook delta serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delta() {
        let delta = OrderbookDelta::from_payload(
            r#"{"market_id":"MKT-A","side":"no","price":45,"delta":-20,"ts":1700000000}"#,
        )
        .unwrap();
        assert_eq!(delta.side, TakerSide::No);
        assert_eq!(delta.delta, -20);
        assert!(!delta.is_own_order);
    }
}
