//! Audit writer backend trait

use async_trait::async_trait;

use crate::signals::model::{CompositeSignal, Signal};

#[derive(Debug)]
pub enum AuditWriterError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Database(String),
}

impl From<std::io::Error> for AuditWriterError {
    fn from(err: std::io::Error) -> Self {
        AuditWriterError::Io(err)
    }
}

impl From<serde_json::Error> for AuditWriterError {
    fn from(err: serde_json::Error) -> Self {
        AuditWriterError::Serialization(err)
    }
}

impl std::fmt::Display for AuditWriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditWriterError::Io(e) => write!(f, "IO error: {}", e),
            AuditWriterError::Serialization(e) => write!(f, "Serialization error: {}", e),
            AuditWriterError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for AuditWriterError {}

/// Backend for the append-only audit trail. Every emitted signal, composite
/// and regime transition is persisted verbatim; the core never reads back.
#[async_trait]
pub trait AuditWriterBackend: Send {
    async fn write_signal(&mut self, signal: &Signal) -> Result<(), AuditWriterError>;

    async fn write_composite(&mut self, composite: &CompositeSignal)
        -> Result<(), AuditWriterError>;

    /// Regime transitions get their own log so regime history is queryable
    /// without unpacking signal metadata.
    async fn write_regime_transition(&mut self, signal: &Signal) -> Result<(), AuditWriterError>;

    async fn flush(&mut self) -> Result<(), AuditWriterError>;

    fn backend_type(&self) -> &'static str;
}
