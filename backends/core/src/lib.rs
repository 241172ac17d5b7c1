use std::time::Duration;
use thiserror::Error;

/// Ordered sequences sent to the downstream classifier in a single call
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub sequences: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

/// One result per sequence of the batch, positionally aligned
pub type Predictions = Vec<String>;

pub trait Backend {
    fn health(&self) -> Result<(), BackendError>;

    /// Whether `health` actually probes the downstream. When it does not, health is
    /// derived from the outcome of the last call.
    fn probes_health(&self) -> bool {
        true
    }

    fn predict(&self, batch: Batch) -> Result<Predictions, BackendError>;
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("Downstream is rate limiting requests: {0}")]
    RateLimited(String),
    #[error("{0}")]
    Inference(String),
    #[error("Unexpected downstream response: {0}")]
    ProtocolMismatch(String),
    #[error("Downstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Backend is unhealthy")]
    Unhealthy,
}

impl BackendError {
    /// Short label used for metrics and error payloads
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Start(_) => "start",
            BackendError::RateLimited(_) => "rate_limited",
            BackendError::Inference(_) => "inference",
            BackendError::ProtocolMismatch(_) => "protocol_mismatch",
            BackendError::Timeout(_) => "timeout",
            BackendError::Unhealthy => "unhealthy",
        }
    }
}
