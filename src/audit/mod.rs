//! Audit trail: persist every emitted signal, composite and regime
//! transition verbatim
//!
//! The core never reads this data back; it exists for downstream analysis
//! and traceability. The writer is its own consumer group on the output
//! streams, so a slow disk never backpressures a processor.

pub mod backend;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

pub use backend::{AuditWriterBackend, AuditWriterError};
pub use sqlite::SqliteAuditWriter;

use crate::bus::{Broker, StreamConsumer, SIGNAL_STREAM_MAXLEN, STREAM_ALL_SIGNALS, STREAM_COMPOSITE};
use crate::config::BusConfig;
use crate::signals::model::{CompositeSignal, Signal, SignalType};

/// Consume the signal and composite streams and persist every record.
/// Write failures are logged and the entry skipped; the audit trail is
/// best-effort and must never wedge the bus.
pub async fn audit_task(
    broker: Arc<Broker>,
    bus_config: BusConfig,
    mut backend: Box<dyn AuditWriterBackend>,
    stop: watch::Receiver<bool>,
) {
    let consumer = StreamConsumer::new(broker, bus_config.group("audit"), "audit-1".to_string());
    consumer.register(STREAM_ALL_SIGNALS, SIGNAL_STREAM_MAXLEN);
    consumer.register(STREAM_COMPOSITE, SIGNAL_STREAM_MAXLEN);

    log::info!("🗄️  audit writer starting ({})", backend.backend_type());
    let block = Duration::from_millis(bus_config.block_timeout_ms.max(100) / 2);

    while !*stop.borrow() {
        for stream in [STREAM_ALL_SIGNALS, STREAM_COMPOSITE] {
            let batch = match consumer.next_batch(stream, bus_config.batch_size, block).await {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("⚠️  audit read failed on {}: {}", stream, e);
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            for entry in &batch {
                let result = match stream {
                    STREAM_ALL_SIGNALS => match Signal::from_payload(&entry.payload) {
                        Ok(signal) => {
                            let mut result = backend.write_signal(&signal).await;
                            if result.is_ok() && signal.signal_type == SignalType::RegimeChange {
                                result = backend.write_regime_transition(&signal).await;
                            }
                            result
                        }
                        Err(e) => {
                            log::warn!("⚠️  audit skipped unparseable signal: {}", e);
                            Ok(())
                        }
                    },
                    _ => match CompositeSignal::from_payload(&entry.payload) {
                        Ok(composite) => backend.write_composite(&composite).await,
                        Err(e) => {
                            log::warn!("⚠️  audit skipped unparseable composite: {}", e);
                            Ok(())
                        }
                    },
                };
                if let Err(e) = result {
                    log::error!("❌ audit write failed: {}", e);
                }
            }

            let ids: Vec<u64> = batch.iter().map(|e| e.id).collect();
            consumer.ack(stream, &ids);
        }
    }

    if let Err(e) = backend.flush().await {
        log::error!("❌ audit flush on shutdown failed: {}", e);
    }
    log::info!("✅ audit writer stopped");
}
