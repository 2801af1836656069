//! Durable batch consumption over the broker

use std::sync::Arc;
use std::time::Duration;

use crate::bus::broker::{Broker, StreamEntry};
use crate::error::SignalError;

/// Consumer-group membership for one worker on one or more streams.
///
/// The contract is claim-then-read: at startup `claim_pending` drains
/// deliveries an earlier incarnation read but never acknowledged, then
/// `next_batch` reads new entries. Callers ack only after the whole batch
/// processed; a crash in between means redelivery, which downstream
/// consumers tolerate (the aggregator dedupes by signal id).
pub struct StreamConsumer {
    broker: Arc<Broker>,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    pub fn new(broker: Arc<Broker>, group: String, consumer: String) -> Self {
        Self {
            broker,
            group,
            consumer,
        }
    }

    pub fn register(&self, stream: &str, maxlen: usize) {
        self.broker.ensure_group(stream, &self.group, maxlen);
    }

    /// Unacknowledged deliveries from a previous run of this consumer.
    pub fn claim_pending(&self, stream: &str, count: usize) -> Vec<StreamEntry> {
        let pending = self
            .broker
            .read_pending(stream, &self.group, &self.consumer, count);
        if !pending.is_empty() {
            log::info!(
                "🔁 {} reclaimed {} pending entries on {}",
                self.consumer,
                pending.len(),
                stream
            );
        }
        pending
    }

    /// Next batch of new entries; empty after `block` with nothing to read.
    pub async fn next_batch(
        &self,
        stream: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, SignalError> {
        self.broker
            .read_group(stream, &self.group, &self.consumer, count, block)
            .await
    }

    pub fn ack(&self, stream: &str, ids: &[u64]) {
        self.broker.ack(stream, &self.group, &self.consumer, ids);
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }
}
