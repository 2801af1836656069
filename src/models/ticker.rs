//! Incremental ticker updates (price / volume / open interest deltas)

use serde::{Deserialize, Serialize};

use crate::error::SignalError;

/// A ticker update from the push stream.
///
/// The exchange only sends fields that changed, so everything except the
/// market id and timestamp is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub market_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dollar_volume_delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dollar_open_interest_delta: Option<i64>,
    /// Unix timestamp in seconds (event time).
    pub ts: i64,
}

impl TickerUpdate {
    pub fn from_payload(payload: &str) -> Result<Self, SignalError> {
        let update: TickerUpdate = serde_json::from_str(payload)
            .map_err(|e| SignalError::Malformed(format!("ticker: {}", e)))?;

        if let Some(price) = update.price {
            if !(0..=99).contains(&price) {
                return Err(SignalError::Malformed(format!(
                    "ticker {}: price {} out of range",
                    update.market_id, price
                )));
            }
        }

        Ok(update)
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("ticker serialization cannot fail")
    }
}
