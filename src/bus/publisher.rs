//! Signal publishing: typed stream plus fan-in duplicate

use std::sync::Arc;

use crate::bus::broker::Broker;
use crate::bus::{SIGNAL_STREAM_MAXLEN, STREAM_ALL_SIGNALS, STREAM_COMPOSITE};
use crate::error::SignalError;
use crate::signals::model::{CompositeSignal, Signal};

/// Publishes each signal to its processor's typed stream and then to the
/// fan-in `signals:all` stream.
///
/// Fan-in goes last: a retry after a partial publish can only duplicate the
/// fan-in copy, and the aggregator drops duplicates by signal id. A signal
/// is therefore never visible downstream without its typed-stream record.
pub struct SignalPublisher {
    broker: Arc<Broker>,
}

impl SignalPublisher {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn publish(&self, signal: &Signal) -> Result<(), SignalError> {
        let payload = serde_json::to_string(signal)
            .map_err(|e| SignalError::Downstream(format!("signal encode: {}", e)))?;

        let typed_stream = signal.signal_type.stream();
        self.broker
            .publish(typed_stream, payload.clone(), SIGNAL_STREAM_MAXLEN);
        self.broker
            .publish(STREAM_ALL_SIGNALS, payload, SIGNAL_STREAM_MAXLEN);

        log::debug!(
            "📤 signal {} {} {} strength={:.2}",
            signal.signal_type.as_str(),
            signal.market_id,
            signal.direction.as_str(),
            signal.strength
        );
        Ok(())
    }

    pub fn publish_composite(&self, composite: &CompositeSignal) -> Result<(), SignalError> {
        let payload = serde_json::to_string(composite)
            .map_err(|e| SignalError::Downstream(format!("composite encode: {}", e)))?;
        self.broker
            .publish(STREAM_COMPOSITE, payload, SIGNAL_STREAM_MAXLEN);
        Ok(())
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}
