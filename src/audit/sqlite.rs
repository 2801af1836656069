//! SQLite backend for the audit trail

use async_trait::async_trait;
use rusqlite::{params, Connection};

use super::backend::{AuditWriterBackend, AuditWriterError};
use crate::signals::model::{CompositeSignal, Signal};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS signal_log (
    signal_id   TEXT NOT NULL,
    ts          INTEGER NOT NULL,
    signal_type TEXT NOT NULL,
    market_id   TEXT NOT NULL,
    event_id    TEXT,
    series_id   TEXT,
    direction   TEXT NOT NULL,
    strength    REAL NOT NULL,
    confidence  REAL NOT NULL,
    urgency     TEXT NOT NULL,
    ttl_seconds INTEGER NOT NULL,
    metadata    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signal_log_market_ts ON signal_log (market_id, ts);

CREATE TABLE IF NOT EXISTS composite_log (
    ts                  INTEGER NOT NULL,
    market_id           TEXT NOT NULL,
    direction           TEXT NOT NULL,
    composite_score     REAL NOT NULL,
    regime              TEXT,
    active_signal_count INTEGER NOT NULL,
    active_signal_ids   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_composite_log_market_ts ON composite_log (market_id, ts);

CREATE TABLE IF NOT EXISTS regime_log (
    ts         INTEGER NOT NULL,
    market_id  TEXT NOT NULL,
    old_regime TEXT NOT NULL,
    new_regime TEXT NOT NULL,
    metadata   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_regime_log_market_ts ON regime_log (market_id, ts);
";

/// Append-only audit log in a single SQLite file, WAL mode.
pub struct SqliteAuditWriter {
    conn: Connection,
}

impl SqliteAuditWriter {
    pub fn new(db_path: impl AsRef<std::path::Path>) -> Result<Self, AuditWriterError> {
        let conn = Connection::open(db_path)
            .map_err(|e| AuditWriterError::Database(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AuditWriterError::Database(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| AuditWriterError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| AuditWriterError::Database(e.to_string()))?;

        log::info!("✅ SQLite audit writer initialized");
        Ok(Self { conn })
    }
}

#[async_trait]
impl AuditWriterBackend for SqliteAuditWriter {
    async fn write_signal(&mut self, signal: &Signal) -> Result<(), AuditWriterError> {
        self.conn
            .execute(
                "INSERT INTO signal_log
                 (signal_id, ts, signal_type, market_id, event_id, series_id,
                  direction, strength, confidence, urgency, ttl_seconds, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    signal.signal_id,
                    signal.ts,
                    signal.signal_type.as_str(),
                    signal.market_id,
                    signal.event_id,
                    signal.series_id,
                    signal.direction.as_str(),
                    signal.strength,
                    signal.confidence,
                    signal.urgency.as_str(),
                    signal.ttl_seconds,
                    signal.metadata.to_string(),
                ],
            )
            .map_err(|e| AuditWriterError::Database(e.to_string()))?;
        Ok(())
    }

    async fn write_composite(
        &mut self,
        composite: &CompositeSignal,
    ) -> Result<(), AuditWriterError> {
        self.conn
            .execute(
                "INSERT INTO composite_log
                 (ts, market_id, direction, composite_score, regime,
                  active_signal_count, active_signal_ids)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    composite.ts,
                    composite.market_id,
                    composite.direction.as_str(),
                    composite.composite_score,
                    composite.regime.map(|r| r.as_str()),
                    composite.active_signal_count as i64,
                    serde_json::to_string(&composite.active_signal_ids)?,
                ],
            )
            .map_err(|e| AuditWriterError::Database(e.to_string()))?;
        Ok(())
    }

    async fn write_regime_transition(&mut self, signal: &Signal) -> Result<(), AuditWriterError> {
        let old_regime = signal.metadata["old_regime"].as_str().unwrap_or("unknown");
        let new_regime = signal.metadata["new_regime"].as_str().unwrap_or("unknown");
        self.conn
            .execute(
                "INSERT INTO regime_log (ts, market_id, old_regime, new_regime, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    signal.ts,
                    signal.market_id,
                    old_regime,
                    new_regime,
                    signal.metadata.to_string(),
                ],
            )
            .map_err(|e| AuditWriterError::Database(e.to_string()))?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), AuditWriterError> {
        // Autocommit per insert; nothing buffered.
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::model::{
        MarketRegime, SignalDirection, SignalIdGen, SignalType, SignalUrgency,
    };
    use serde_json::json;
    use tempfile::tempdir;

    fn make_signal(signal_type: SignalType) -> Signal {
        Signal::builder(signal_type, "MKT-A", 1_700_000_000)
            .direction(SignalDirection::BuyYes)
            .strength(0.7)
            .confidence(0.8)
            .urgency(SignalUrgency::Normal)
            .ttl_seconds(300)
            .metadata(json!({"old_regime": "quiet", "new_regime": "active"}))
            .build(SignalIdGen::new("test").next())
    }

    #[tokio::test]
    async fn test_signal_roundtrip() {
        let dir = tempdir().unwrap();
        let mut writer = SqliteAuditWriter::new(dir.path().join("audit.db")).unwrap();

        let signal = make_signal(SignalType::ToxicityVpin);
        writer.write_signal(&signal).await.unwrap();

        let conn = Connection::open(dir.path().join("audit.db")).unwrap();
        let (signal_type, strength): (String, f64) = conn
            .query_row(
                "SELECT signal_type, strength FROM signal_log WHERE signal_id = ?1",
                params![signal.signal_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(signal_type, "toxicity_vpin");
        assert_eq!(strength, 0.7);
    }

    #[tokio::test]
    async fn test_composite_and_regime_rows() {
        let dir = tempdir().unwrap();
        let mut writer = SqliteAuditWriter::new(dir.path().join("audit.db")).unwrap();

        let composite = CompositeSignal {
            market_id: "MKT-A".to_string(),
            event_id: None,
            series_id: None,
            direction: SignalDirection::BuyYes,
            composite_score: 0.31,
            regime: Some(MarketRegime::Informed),
            active_signal_ids: vec!["a".to_string(), "b".to_string()],
            active_signal_count: 2,
            ts: 1_700_000_000,
        };
        writer.write_composite(&composite).await.unwrap();
        writer
            .write_regime_transition(&make_signal(SignalType::RegimeChange))
            .await
            .unwrap();

        let conn = Connection::open(dir.path().join("audit.db")).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM composite_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let (old_regime, new_regime): (String, String) = conn
            .query_row(
                "SELECT old_regime, new_regime FROM regime_log",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(old_regime, "quiet");
        assert_eq!(new_regime, "active");
    }
}
