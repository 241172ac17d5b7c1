pub mod infer;
pub mod queue;

use classify_proxy_backend::BackendError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::TryAcquireError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Classification failed after {attempts} attempt(s): {source}")]
    Downstream {
        attempts: usize,
        #[source]
        source: BackendError,
    },
    #[error("No classification result after {0:?}")]
    Timeout(Duration),
    #[error("Proxy is overloaded")]
    Overloaded(#[from] TryAcquireError),
    #[error("Dispatcher stopped before the request was classified")]
    Shutdown,
}

impl ProxyError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Downstream { .. } => "downstream",
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Overloaded(_) => "overloaded",
            ProxyError::Shutdown => "shutdown",
        }
    }
}
