use crate::queue::{Entry, Metadata, NextBatch, Queue};
use crate::ProxyError;
use classify_proxy_backend::{Backend, BackendError, Batch, Predictions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Batching and retry parameters of the dispatcher
#[derive(Debug, Clone)]
pub struct BatchingConfig {
    /// Maximum number of requests sent downstream in one call
    pub max_batch_requests: usize,
    /// Attempts per batch, the first one included
    pub max_retries: usize,
    /// Deadline of a single downstream call
    pub request_timeout: Duration,
    /// Multiplied by the attempt index after a rate limited attempt
    pub rate_limit_backoff: Duration,
    /// Multiplied by the attempt index after any other failed attempt
    pub failure_backoff: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_requests: 5,
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_millis(100),
            failure_backoff: Duration::from_millis(50),
        }
    }
}

/// Inference struct
#[derive(Debug, Clone)]
pub struct Infer {
    queue: Queue,
    /// Shared notify
    notify_batching_task: Arc<Notify>,
    /// Inference limit
    limit_concurrent_requests: Arc<Semaphore>,
    backend: Backend,
    /// How long a caller waits for its result
    wait_timeout: Duration,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    batching_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Infer {
    pub fn new(
        queue: Queue,
        backend: Backend,
        config: BatchingConfig,
        max_concurrent_requests: usize,
        wait_timeout: Duration,
    ) -> Self {
        let notify_batching_task = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        // Batching task
        let batching_task = tokio::spawn(batching_task(
            queue.clone(),
            notify_batching_task.clone(),
            backend.clone(),
            config,
            shutdown.clone(),
        ));

        // Inference limit with a semaphore
        let semaphore = Arc::new(Semaphore::new(max_concurrent_requests));

        Self {
            queue,
            notify_batching_task,
            limit_concurrent_requests: semaphore,
            backend,
            wait_timeout,
            next_id: Arc::new(AtomicU64::new(0)),
            shutdown,
            batching_task: Arc::new(Mutex::new(Some(batching_task))),
        }
    }

    #[instrument(skip(self))]
    pub fn try_acquire_permit(&self) -> Result<OwnedSemaphorePermit, ProxyError> {
        // Limit concurrent requests by acquiring a permit from the semaphore
        self.clone()
            .limit_concurrent_requests
            .try_acquire_owned()
            .map_err(|err| {
                let counter = metrics::counter!("cp_request_failure", "err" => "overloaded");
                counter.increment(1);
                tracing::error!("{err}");
                ProxyError::from(err)
            })
    }

    /// Queue `sequence` for classification and wait for its result.
    ///
    /// The permit is held by the queued entry until the dispatcher resolves it, even if this
    /// call returns earlier with [`ProxyError::Timeout`].
    #[instrument(skip(self, sequence, permit))]
    pub async fn classify(
        &self,
        sequence: String,
        permit: OwnedSemaphorePermit,
    ) -> Result<ClassifyInferResponse, ProxyError> {
        if self.shutdown.is_cancelled() {
            let counter = metrics::counter!("cp_request_failure", "err" => "shutdown");
            counter.increment(1);
            return Err(ProxyError::Shutdown);
        }

        let start_time = Instant::now();
        let counter = metrics::counter!("cp_classify_count");
        counter.increment(1);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Result slot written by the batching task
        let (response_tx, response_rx) = oneshot::channel();

        // Append the request to the queue
        self.queue.append(Entry::new(id, sequence, response_tx, permit));

        self.notify_batching_task.notify_one();

        let response = match tokio::time::timeout(self.wait_timeout, response_rx).await {
            Ok(Ok(response)) => response,
            // The batching task dropped the slot without resolving it
            Ok(Err(_)) => Err(ProxyError::Shutdown),
            Err(_) => Err(ProxyError::Timeout(self.wait_timeout)),
        }
        .map_err(|err| {
            let counter = metrics::counter!("cp_request_failure", "err" => err.kind());
            counter.increment(1);
            tracing::error!(id, "{err}");
            err
        })?;

        // Timings
        let total_time = start_time.elapsed();

        // Metrics
        let counter = metrics::counter!("cp_classify_success");
        counter.increment(1);
        let histogram = metrics::histogram!("cp_classify_duration");
        histogram.record(total_time.as_secs_f64());
        let histogram = metrics::histogram!("cp_classify_queue_duration");
        histogram.record(response.metadata.queue.as_secs_f64());
        let histogram = metrics::histogram!("cp_classify_inference_duration");
        histogram.record(response.metadata.inference.as_secs_f64());
        let histogram = metrics::histogram!("cp_classify_input_length");
        histogram.record(response.metadata.input_length as f64);

        Ok(response)
    }

    /// Stop the batching task and wait until it has exited.
    ///
    /// The batch in flight is finished; entries still queued are resolved with
    /// [`ProxyError::Shutdown`].
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.batching_task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!("Batching task failed: {err}");
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> bool {
        self.backend.health().await.is_ok()
    }
}

#[instrument(skip_all)]
async fn batching_task(
    queue: Queue,
    notify: Arc<Notify>,
    backend: Backend,
    config: BatchingConfig,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        match queue.next_batch(config.max_batch_requests).await {
            Some(next_batch) => dispatch(&backend, &config, &shutdown, next_batch).await,
            // A notification sent while we were busy is stored by `Notify`
            None => tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = notify.notified() => {}
            },
        }
    }

    let mut pending = 0;
    while let Some((metadata, _)) = queue.next_batch(usize::MAX).await {
        pending += metadata.len();
        metadata
            .into_iter()
            .for_each(|m| resolve(m, Err(ProxyError::Shutdown)));
    }
    tracing::info!("Batching task stopped, {pending} pending request(s) cancelled");
}

#[instrument(skip_all, fields(batch_size = next_batch.0.len()))]
async fn dispatch(
    backend: &Backend,
    config: &BatchingConfig,
    shutdown: &CancellationToken,
    next_batch: NextBatch,
) {
    let (metadata, batch) = next_batch;

    let start = Instant::now();
    let results = predict_with_retry(backend, config, shutdown, batch).await;
    let inference = start.elapsed();

    match results {
        Ok((predictions, attempts)) => {
            let histogram = metrics::histogram!("cp_batch_attempts");
            histogram.record(attempts as f64);

            metadata
                .into_iter()
                .zip(predictions)
                .for_each(|(m, result)| {
                    let infer_metadata = InferMetadata {
                        input_length: m.input_length,
                        queue: m.queue_time.elapsed().saturating_sub(inference),
                        inference,
                        attempts,
                    };
                    resolve(
                        m,
                        Ok(ClassifyInferResponse {
                            result,
                            metadata: infer_metadata,
                        }),
                    );
                });
        }
        Err((err, attempts)) => {
            let counter = metrics::counter!("cp_batch_failure", "err" => err.kind());
            counter.increment(1);

            metadata.into_iter().for_each(|m| {
                resolve(
                    m,
                    Err(ProxyError::Downstream {
                        attempts,
                        source: err.clone(),
                    }),
                )
            });
        }
    }
}

/// Call the downstream until it succeeds or `max_retries` attempts failed.
/// Returns the number of attempts made alongside the outcome.
///
/// A shutdown during a backoff gives up with the last error.
async fn predict_with_retry(
    backend: &Backend,
    config: &BatchingConfig,
    shutdown: &CancellationToken,
    batch: Batch,
) -> Result<(Predictions, usize), (BackendError, usize)> {
    let expected = batch.len();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match tokio::time::timeout(config.request_timeout, backend.predict(batch.clone()))
            .await
        {
            Ok(Ok((predictions, _))) if predictions.len() == expected => {
                return Ok((predictions, attempt));
            }
            Ok(Ok((predictions, _))) => BackendError::ProtocolMismatch(format!(
                "downstream returned {} result(s) for {expected} sequence(s)",
                predictions.len()
            )),
            Ok(Err(err)) => err,
            Err(_) => BackendError::Timeout(config.request_timeout),
        };

        if attempt >= config.max_retries {
            tracing::error!("Attempt {attempt}/{} failed: {err}", config.max_retries);
            return Err((err, attempt));
        }

        let backoff = match err {
            BackendError::RateLimited(_) => config.rate_limit_backoff,
            _ => config.failure_backoff,
        }
        .saturating_mul(attempt as u32);

        let counter = metrics::counter!("cp_batch_retry", "err" => err.kind());
        counter.increment(1);
        tracing::warn!(
            "Attempt {attempt}/{} failed: {err}. Retrying in {backoff:?}",
            config.max_retries
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::warn!("Shutting down, attempt {attempt}/{} is the last", config.max_retries);
                return Err((err, attempt));
            }
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Write the result slot. A caller that stopped waiting is not an error.
fn resolve(metadata: Metadata, result: Result<ClassifyInferResponse, ProxyError>) {
    if metadata.response_tx.send(result).is_err() {
        let counter = metrics::counter!("cp_request_discarded");
        counter.increment(1);
        tracing::debug!(id = metadata.id, "Caller is gone, result discarded");
    }
}

#[derive(Debug)]
pub struct InferMetadata {
    /// Number of characters of the input
    pub input_length: usize,
    pub queue: Duration,
    pub inference: Duration,
    /// Downstream attempts made for the batch
    pub attempts: usize,
}

#[derive(Debug)]
pub struct ClassifyInferResponse {
    pub result: String,
    pub metadata: InferMetadata,
}
