//! Trade records from the exchange push stream

use serde::{Deserialize, Serialize};

use crate::error::SignalError;

/// Which side the taker was on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    Yes,
    No,
}

impl TakerSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakerSide::Yes => "yes",
            TakerSide::No => "no",
        }
    }
}

/// A single executed trade on one market.
///
/// Prices are integer cents; a binary contract always satisfies
/// `yes_price + no_price == 100`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub market_id: String,
    pub yes_price: i64,
    pub no_price: i64,
    pub count: i64,
    pub taker_side: TakerSide,
    /// Unix timestamp in seconds (event time).
    pub ts: i64,
}

impl Trade {
    /// Parse a trade from a raw stream payload, rejecting records that
    /// violate the price-complement invariant or carry a non-positive count.
    pub fn from_payload(payload: &str) -> Result<Self, SignalError> {
        let trade: Trade = serde_json::from_str(payload)
            .map_err(|e| SignalError::Malformed(format!("trade: {}", e)))?;

        if trade.yes_price + trade.no_price != 100 {
            return Err(SignalError::Malformed(format!(
                "trade {}: yes_price {} + no_price {} != 100",
                trade.trade_id, trade.yes_price, trade.no_price
            )));
        }
        if !(1..=99).contains(&trade.yes_price) {
            return Err(SignalError::Malformed(format!(
                "trade {}: yes_price {} out of range",
                trade.trade_id, trade.yes_price
            )));
        }
        if trade.count <= 0 {
            return Err(SignalError::Malformed(format!(
                "trade {}: non-positive count {}",
                trade.trade_id, trade.count
            )));
        }

        Ok(trade)
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("trade serialization cannot fail")
    }
}
