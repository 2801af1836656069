//! Market lifecycle transition records

use serde::{Deserialize, Serialize};

use crate::error::SignalError;
use crate::models::trade::TakerSide;

/// Market status carried on lifecycle events and market metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Paused,
    Closed,
    Settled,
    Determined,
    #[serde(other)]
    Unknown,
}

impl MarketStatus {
    /// Terminal statuses end a market's life for signal purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MarketStatus::Closed | MarketStatus::Settled | MarketStatus::Determined
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Paused => "paused",
            MarketStatus::Closed => "closed",
            MarketStatus::Settled => "settled",
            MarketStatus::Determined => "determined",
            MarketStatus::Unknown => "unknown",
        }
    }
}

/// A market state transition from the push stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub market_id: String,
    pub status: MarketStatus,
    /// Winning side, present once a settlement outcome is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_side: Option<TakerSide>,
    /// Unix timestamp in seconds (event time).
    pub ts: i64,
}

impl LifecycleEvent {
    pub fn from_payload(payload: &str) -> Result<Self, SignalError> {
        serde_json::from_str(payload)
            .map_err(|e| SignalError::Malformed(format!("lifecycle: {}", e)))
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).expect("lifecycle serialization cannot fail")
    }
}
