//! Signal pipeline runtime: every core worker in one process
//!
//! Spawns the five processors, the aggregator and the audit writer against
//! a shared broker. The ingest layer publishes into the broker's raw
//! streams; for development, `KASS_REPLAY_FILE` points at a JSONL capture
//! (`{"stream": "...", "data": {...}}` per line) that is replayed into the
//! raw streams at startup. `KASS_MARKETS_FILE` seeds the market catalog.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use kass::bus::{Broker, RAW_STREAM_MAXLEN};
use kass::config::Config;
use kass::models::{MarketMeta, SeriesIndex};
use kass::runtime::{spawn_audit, spawn_core};

#[derive(serde::Deserialize)]
struct ReplayLine {
    stream: String,
    data: serde_json::Value,
}

fn load_catalog(index: &SeriesIndex, path: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let markets: Vec<MarketMeta> = serde_json::from_reader(BufReader::new(file))?;
    let count = markets.len();
    for meta in markets {
        index.upsert(meta);
    }
    Ok(count)
}

fn replay_capture(broker: &Broker, path: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ReplayLine = serde_json::from_str(&line)?;
        broker.publish(&parsed.stream, parsed.data.to_string(), RAW_STREAM_MAXLEN);
        count += 1;
    }
    Ok(count)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    let broker = Arc::new(Broker::new());
    let index = Arc::new(SeriesIndex::new());

    log::info!("🚀 Starting KASS signal runtime...");

    if let Ok(path) = std::env::var("KASS_MARKETS_FILE") {
        let count = load_catalog(&index, &path)?;
        log::info!("📇 Loaded {} markets from {}", count, path);
    }

    let handles = spawn_core(&config, broker.clone(), index.clone());
    let audit_handle = spawn_audit(&config, broker.clone(), handles.stop.subscribe())?;
    log::info!("✅ Core workers running ({} markets known)", index.len());

    if let Ok(path) = std::env::var("KASS_REPLAY_FILE") {
        let count = replay_capture(&broker, &path)?;
        log::info!("📼 Replayed {} events from {}", count, path);
    }

    tokio::signal::ctrl_c().await?;
    log::info!("🛑 Shutting down...");
    handles.shutdown().await;
    let _ = audit_handle.await;

    Ok(())
}
