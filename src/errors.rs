// src/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to establish connection for scope '{scope}': {source}")]
    Establish {
        scope: String,
        #[source]
        source: LapinError,
    },

    #[error("broker operation failed: {0}")]
    Broker(#[from] LapinError),

    #[error("registry lock poisoned")]
    LockPoisoned,

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),
}

// Custom Result type for broker lifecycle operations
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// True when the error came from failing to open a connection,
    /// as opposed to a channel-level or broker-level operation.
    pub fn is_establishment(&self) -> bool {
        matches!(self, BrokerError::Establish { .. })
    }
}
