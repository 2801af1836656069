//! Error taxonomy for the signal pipeline

use std::fmt;

/// Everything that can go wrong inside a signal worker.
///
/// Recovery policy per variant:
/// - `TransientBus`: backoff and retry, input is preserved by the broker.
/// - `Malformed`: acknowledge and count, never redeliver.
/// - `StateUnderflow`: not a failure, rolling state is still warming up;
///   emission is suppressed and confidence reflects the fill level.
/// - `InvariantViolation`: fatal, the worker exits without publishing.
/// - `Downstream`: publish failed; retried, then the worker halts.
#[derive(Debug)]
pub enum SignalError {
    TransientBus(String),
    Malformed(String),
    StateUnderflow { filled: usize, required: usize },
    InvariantViolation(String),
    Downstream(String),
}

impl SignalError {
    /// Malformed events are acked and counted instead of redelivered.
    pub fn is_poison(&self) -> bool {
        matches!(self, SignalError::Malformed(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SignalError::InvariantViolation(_))
    }
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::TransientBus(msg) => write!(f, "transient bus error: {}", msg),
            SignalError::Malformed(msg) => write!(f, "malformed event: {}", msg),
            SignalError::StateUnderflow { filled, required } => {
                write!(f, "state underflow: {}/{} samples", filled, required)
            }
            SignalError::InvariantViolation(msg) => {
                write!(f, "signal invariant violation: {}", msg)
            }
            SignalError::Downstream(msg) => write!(f, "downstream publish error: {}", msg),
        }
    }
}

impl std::error::Error for SignalError {}

impl From<serde_json::Error> for SignalError {
    fn from(err: serde_json::Error) -> Self {
        SignalError::Malformed(err.to_string())
    }
}
