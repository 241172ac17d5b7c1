//! Downstream classification backend over HTTP

mod client;

pub use client::AsyncClient;
use classify_proxy_backend_core::{Backend, BackendError, Batch, Predictions};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Could not connect to classification server: {0}")]
    Connection(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("Server error: {0}")]
    Inference(String),
    #[error("{0}")]
    Protocol(String),
    #[error("Request timed out")]
    Timeout,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let err = if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else {
            Self::Inference(err.to_string())
        };
        tracing::error!("{err}");
        err
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub struct HttpBackend {
    tokio_runtime: Runtime,
    backend_client: AsyncClient,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(
        downstream_url: &str,
        health_url: Option<&str>,
        request_timeout: Duration,
    ) -> std::result::Result<Self, BackendError> {
        let backend_client = AsyncClient::connect(downstream_url, health_url, request_timeout)
            .map_err(|err| BackendError::Start(err.to_string()))?;

        // Built last: a runtime must not be dropped from within an async context
        let tokio_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| BackendError::Start(format!("Could not start Tokio runtime: {err}")))?;

        Ok(Self {
            tokio_runtime,
            backend_client,
            request_timeout,
        })
    }
}

impl Backend for HttpBackend {
    fn health(&self) -> std::result::Result<(), BackendError> {
        if self
            .tokio_runtime
            .block_on(self.backend_client.health())
            .is_err()
        {
            return Err(BackendError::Unhealthy);
        }
        Ok(())
    }

    fn probes_health(&self) -> bool {
        self.backend_client.has_health_url()
    }

    fn predict(&self, batch: Batch) -> std::result::Result<Predictions, BackendError> {
        self.tokio_runtime
            .block_on(self.backend_client.classify(&batch.sequences))
            .map_err(|err| match err {
                ClientError::RateLimited(message) => BackendError::RateLimited(message),
                ClientError::Protocol(message) => BackendError::ProtocolMismatch(message),
                ClientError::Timeout => BackendError::Timeout(self.request_timeout),
                err => BackendError::Inference(err.to_string()),
            })
    }
}
