//! Processor contract and the shared drive loop
//!
//! A processor is pure state + `handle_event`: it never touches the bus.
//! The drive loop owns consumption (claim pending, read batch, ack after
//! success), emit gating, invariant validation, publishing, poison-message
//! accounting, periodic stats, and cooperative shutdown. Keeping I/O out of
//! the processors makes replay tests deterministic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::backoff::ExponentialBackoff;
use crate::bus::broker::StreamEntry;
use crate::bus::{Broker, SignalPublisher, StreamConsumer, RAW_STREAM_MAXLEN, SIGNAL_STREAM_MAXLEN};
use crate::config::{BusConfig, GateConfig};
use crate::error::SignalError;
use crate::signals::gate::EmitGate;
use crate::signals::model::Signal;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// One stateful stream processor.
///
/// `handle_event` folds one raw event into per-market state and returns any
/// signals it implies. `housekeeping` runs after every batch for work that
/// is driven by the advance of event time rather than by a single event
/// (regime sweeps, expiry).
pub trait SignalProcessor: Send {
    fn name(&self) -> &'static str;

    fn input_streams(&self) -> &'static [&'static str];

    fn handle_event(&mut self, stream: &str, payload: &str) -> Result<Vec<Signal>, SignalError>;

    fn housekeeping(&mut self) -> Vec<Signal> {
        Vec::new()
    }

    /// Gate override hook; most processors run the shared defaults.
    fn gate_config(&self, defaults: &GateConfig) -> GateConfig {
        defaults.clone()
    }
}

#[derive(Default)]
struct ProcessorStats {
    messages: u64,
    signals: u64,
    malformed: u64,
    poison_batches: u64,
}

fn maxlen_for(stream: &str) -> usize {
    if stream.starts_with("signals:") {
        SIGNAL_STREAM_MAXLEN
    } else {
        RAW_STREAM_MAXLEN
    }
}

/// Drive a processor until the stop flag flips.
///
/// Delivery contract: a batch is acknowledged only after every event in it
/// has been handled and every resulting signal published. A failed batch is
/// retried in place; after `max_batch_retries` it is acknowledged anyway and
/// counted as poison so one bad message cannot wedge the stream. Invariant
/// violations abort the worker before anything is published.
pub async fn run_processor<P: SignalProcessor>(
    mut processor: P,
    broker: Arc<Broker>,
    bus_config: BusConfig,
    gate_defaults: GateConfig,
    instance_id: String,
    stop: watch::Receiver<bool>,
) -> Result<(), SignalError> {
    let name = processor.name();
    let group = bus_config.group(name);
    let consumer = StreamConsumer::new(broker.clone(), group, instance_id);
    let publisher = SignalPublisher::new(broker);
    let mut gate = EmitGate::new(processor.gate_config(&gate_defaults));
    let mut stats = ProcessorStats::default();
    let mut backoff = ExponentialBackoff::bus_default();

    let streams = processor.input_streams();
    for stream in streams {
        consumer.register(stream, maxlen_for(stream));
    }

    log::info!("🚀 {} starting, inputs: {:?}", name, streams);

    // Reclaim deliveries a previous incarnation read but never acked.
    for stream in streams {
        let pending = consumer.claim_pending(stream, bus_config.batch_size);
        if !pending.is_empty() {
            process_batch(
                &mut processor,
                stream,
                &pending,
                &mut gate,
                &publisher,
                &mut stats,
                &consumer,
                bus_config.max_batch_retries,
                &mut backoff,
            )
            .await?;
        }
    }

    let block = Duration::from_millis(
        (bus_config.block_timeout_ms / streams.len().max(1) as u64).max(50),
    );
    let mut last_stats = Instant::now();

    while !*stop.borrow() {
        for stream in streams {
            let batch = match consumer.next_batch(stream, bus_config.batch_size, block).await {
                Ok(batch) => {
                    backoff.reset();
                    batch
                }
                Err(SignalError::TransientBus(msg)) => {
                    log::warn!("⚠️  {} bus read failed on {}: {}", name, stream, msg);
                    backoff.sleep().await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if batch.is_empty() {
                continue;
            }

            process_batch(
                &mut processor,
                stream,
                &batch,
                &mut gate,
                &publisher,
                &mut stats,
                &consumer,
                bus_config.max_batch_retries,
                &mut backoff,
            )
            .await?;
        }

        // Event-time housekeeping (regime sweeps, structure expiry).
        let extra = processor.housekeeping();
        emit_signals(extra, &mut gate, &publisher, &mut stats)?;

        if last_stats.elapsed() >= STATS_INTERVAL {
            let elapsed = last_stats.elapsed().as_secs_f64();
            log::info!(
                "📊 {}: {} msgs ({:.1}/s), {} signals, {} malformed, {} poison batches",
                name,
                stats.messages,
                stats.messages as f64 / elapsed,
                stats.signals,
                stats.malformed,
                stats.poison_batches
            );
            stats = ProcessorStats::default();
            last_stats = Instant::now();
        }
    }

    log::info!("✅ {} stopped", name);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_batch<P: SignalProcessor>(
    processor: &mut P,
    stream: &str,
    batch: &[StreamEntry],
    gate: &mut EmitGate,
    publisher: &SignalPublisher,
    stats: &mut ProcessorStats,
    consumer: &StreamConsumer,
    max_retries: u32,
    backoff: &mut ExponentialBackoff,
) -> Result<(), SignalError> {
    let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
    let mut attempts = 0u32;

    loop {
        match try_batch(processor, stream, batch, gate, publisher, stats) {
            Ok(()) => {
                consumer.ack(stream, &ids);
                backoff.reset();
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                attempts += 1;
                if attempts > max_retries {
                    // Ack anyway: a poison batch must not block the stream.
                    log::error!(
                        "❌ {} giving up on batch of {} from {} after {} attempts: {}",
                        processor.name(),
                        batch.len(),
                        stream,
                        attempts,
                        e
                    );
                    stats.poison_batches += 1;
                    consumer.ack(stream, &ids);
                    return Ok(());
                }
                log::warn!(
                    "⚠️  {} batch retry {}/{} on {}: {}",
                    processor.name(),
                    attempts,
                    max_retries,
                    stream,
                    e
                );
                backoff.sleep().await;
            }
        }
    }
}

fn try_batch<P: SignalProcessor>(
    processor: &mut P,
    stream: &str,
    batch: &[StreamEntry],
    gate: &mut EmitGate,
    publisher: &SignalPublisher,
    stats: &mut ProcessorStats,
) -> Result<(), SignalError> {
    for entry in batch {
        match processor.handle_event(stream, &entry.payload) {
            Ok(signals) => {
                stats.messages += 1;
                emit_signals(signals, gate, publisher, stats)?;
            }
            Err(e) if e.is_poison() => {
                // Malformed events are counted and dropped, never retried.
                stats.malformed += 1;
                log::warn!("⚠️  {} dropped malformed event on {}: {}", processor.name(), stream, e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn emit_signals(
    signals: Vec<Signal>,
    gate: &mut EmitGate,
    publisher: &SignalPublisher,
    stats: &mut ProcessorStats,
) -> Result<(), SignalError> {
    for signal in signals {
        if !gate.allow(&signal) {
            continue;
        }
        signal.validate()?;
        publisher.publish(&signal)?;
        stats.signals += 1;
    }
    Ok(())
}
