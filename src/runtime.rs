//! Wiring: spawn every core worker against a shared broker
//!
//! Each worker is an independent task with its own consumer-group
//! membership; within a worker every market has exactly one owner, so
//! there is no cross-worker shared mutable state beyond the broker handle
//! and the read-mostly market catalog.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audit::{audit_task, SqliteAuditWriter};
use crate::bus::Broker;
use crate::config::Config;
use crate::models::SeriesIndex;
use crate::signals::{
    run_aggregator, run_processor, Aggregator, CrossMarketProcessor, LifecycleAlphaProcessor,
    OiDivergenceProcessor, RegimeProcessor, SignalProcessor, ToxicityProcessor,
};

pub struct CoreHandles {
    pub stop: watch::Sender<bool>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl CoreHandles {
    /// Flip the stop flag and wait for every worker to drain and exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn spawn_worker<P: SignalProcessor + 'static>(
    processor: P,
    broker: Arc<Broker>,
    config: &Config,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let bus_config = config.bus.clone();
    let gate = config.gate.clone();
    let instance = format!("{}-1", processor.name());
    tokio::spawn(async move {
        if let Err(e) = run_processor(processor, broker, bus_config, gate, instance, stop).await {
            log::error!("❌ worker died: {}", e);
        }
    })
}

/// Spawn the five processors and the aggregator. The caller owns the broker
/// (ingest publishes into it) and the market catalog (discovery maintains it).
pub fn spawn_core(config: &Config, broker: Arc<Broker>, index: Arc<SeriesIndex>) -> CoreHandles {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(spawn_worker(
        ToxicityProcessor::new(config.vpin.clone(), index.clone()),
        broker.clone(),
        config,
        stop_rx.clone(),
    ));
    tasks.push(spawn_worker(
        OiDivergenceProcessor::new(config.oi.clone(), index.clone()),
        broker.clone(),
        config,
        stop_rx.clone(),
    ));
    tasks.push(spawn_worker(
        RegimeProcessor::new(config.regime.clone(), index.clone()),
        broker.clone(),
        config,
        stop_rx.clone(),
    ));
    tasks.push(spawn_worker(
        CrossMarketProcessor::new(config.cross_market.clone(), index.clone()),
        broker.clone(),
        config,
        stop_rx.clone(),
    ));
    tasks.push(spawn_worker(
        LifecycleAlphaProcessor::new(config.lifecycle.clone(), index.clone()),
        broker.clone(),
        config,
        stop_rx.clone(),
    ));

    let aggregator = Aggregator::new(config.aggregator.clone());
    let bus_config = config.bus.clone();
    let agg_broker = broker.clone();
    let agg_stop = stop_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_aggregator(
            aggregator,
            agg_broker,
            bus_config,
            "aggregator-1".to_string(),
            agg_stop,
        )
        .await
        {
            log::error!("❌ aggregator died: {}", e);
        }
    }));

    CoreHandles {
        stop: stop_tx,
        tasks,
    }
}

/// Spawn the audit writer onto the output streams.
pub fn spawn_audit(
    config: &Config,
    broker: Arc<Broker>,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, crate::audit::AuditWriterError> {
    let backend = SqliteAuditWriter::new(&config.audit.db_path)?;
    let bus_config = config.bus.clone();
    Ok(tokio::spawn(async move {
        audit_task(broker, bus_config, Box::new(backend), stop).await;
    }))
}
