use classify_proxy_backend_http::HttpBackend;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{instrument, Span};

pub use classify_proxy_backend_core::{
    Backend as CoreBackend, BackendError, Batch, Predictions,
};

#[derive(Debug, Clone)]
pub struct Backend {
    /// Channel to communicate with the background thread
    backend_sender: mpsc::Sender<BackendCommand>,
    /// Whether the last downstream call succeeded
    health_receiver: watch::Receiver<bool>,
    probes_health: bool,
    _backend_thread: Arc<BackendThread>,
}

impl Backend {
    /// Run `backend` on a dedicated thread.
    ///
    /// The thread exclusively owns the downstream connection and processes one command at
    /// a time.
    pub fn new(backend: Box<dyn CoreBackend + Send>) -> Self {
        let probes_health = backend.probes_health();
        let (backend_sender, backend_receiver) = mpsc::channel(8);
        // Without a probe the downstream is healthy until a call fails
        let (health_sender, health_receiver) = watch::channel(!probes_health);
        let _backend_thread =
            Arc::new(BackendThread::new(backend, backend_receiver, health_sender));

        Self {
            backend_sender,
            health_receiver,
            probes_health,
            _backend_thread,
        }
    }

    /// Connect to a downstream classification server over HTTP
    pub fn http(
        downstream_url: &str,
        health_url: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let backend = HttpBackend::new(downstream_url, health_url, request_timeout)?;
        tracing::info!("Downstream classification server: {downstream_url}");
        Ok(Self::new(Box::new(backend)))
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        if !self.probes_health {
            return match *self.health_receiver.borrow() {
                true => Ok(()),
                false => Err(BackendError::Unhealthy),
            };
        }

        let (sender, receiver) = oneshot::channel();
        self.backend_sender
            .send(BackendCommand::Health(Span::current(), sender))
            .await
            .map_err(|_| BackendError::Unhealthy)?;
        receiver.await.map_err(|_| BackendError::Unhealthy)?
    }

    #[instrument(skip_all)]
    pub async fn predict(&self, batch: Batch) -> Result<(Predictions, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();
        self.backend_sender
            .send(BackendCommand::Predict(batch, Span::current(), sender))
            .await
            .map_err(|_| BackendError::Inference("Backend thread has stopped".to_string()))?;
        receiver.await.map_err(|_| {
            BackendError::Inference(
                "Backend thread dropped the request without a response".to_string(),
            )
        })?
    }
}

#[derive(Debug)]
struct BackendThread(Option<JoinHandle<()>>);

impl BackendThread {
    fn new(
        backend: Box<dyn CoreBackend + Send>,
        mut backend_receiver: mpsc::Receiver<BackendCommand>,
        health_sender: watch::Sender<bool>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            while let Some(cmd) = backend_receiver.blocking_recv() {
                let start = Instant::now();
                // Health is published before the caller sees the outcome
                match cmd {
                    BackendCommand::Health(span, sender) => {
                        let _span = span.entered();
                        let result = backend.health();
                        let _ = health_sender.send(result.is_ok());
                        let _ = sender.send(result);
                    }
                    BackendCommand::Predict(batch, span, sender) => {
                        let _span = span.entered();
                        let result = backend.predict(batch).map(|p| (p, start.elapsed()));
                        let _ = health_sender.send(result.is_ok());
                        let _ = sender.send(result);
                    }
                };
            }
        });
        Self(Some(handle))
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            if handle.join().is_err() {
                tracing::error!("Backend thread panicked");
            }
        }
    }
}

enum BackendCommand {
    Health(Span, oneshot::Sender<Result<(), BackendError>>),
    Predict(
        Batch,
        Span,
        #[allow(clippy::type_complexity)]
        oneshot::Sender<Result<(Predictions, Duration), BackendError>>,
    ),
}
