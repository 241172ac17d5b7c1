/// Priority batching classification proxy
mod logging;
mod prometheus;
mod shutdown;

pub mod http;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderValue};
use classify_proxy_backend::Backend;
use classify_proxy_core::infer::{BatchingConfig, Infer};
use classify_proxy_core::queue::Queue;
use classify_proxy_core::ProxyError;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::Span;
use utoipa::ToSchema;

pub use logging::init_logging;

/// Start the batching task and serve the HTTP API until a shutdown signal is received
#[allow(clippy::too_many_arguments)]
pub async fn run(
    downstream_url: String,
    downstream_health_url: Option<String>,
    batching_config: BatchingConfig,
    wait_timeout: Duration,
    max_concurrent_requests: usize,
    hostname: Option<String>,
    port: u16,
    payload_limit: usize,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<()> {
    if batching_config.max_batch_requests == 0 {
        anyhow::bail!("`max_batch_requests` must be > 0");
    }
    if batching_config.max_retries == 0 {
        anyhow::bail!("`max_retries` must be > 0");
    }
    if batching_config.request_timeout.is_zero() {
        anyhow::bail!("`request_timeout_ms` must be > 0");
    }
    if wait_timeout.is_zero() {
        anyhow::bail!("`wait_timeout_ms` must be > 0");
    }
    if max_concurrent_requests == 0 {
        anyhow::bail!("`max_concurrent_requests` must be > 0");
    }

    let backend = Backend::http(
        &downstream_url,
        downstream_health_url.as_deref(),
        batching_config.request_timeout,
    )
    .context("Could not create downstream backend")?;

    // The downstream may come up after us
    if let Err(err) = backend.health().await {
        tracing::warn!("Downstream is not healthy yet: {err}");
    }

    let prom_builder = prometheus::prometheus_builder(
        batching_config.max_batch_requests,
        batching_config.max_retries,
    )
    .context("Could not build the metrics exporter")?;

    let info = Info {
        downstream_url,
        downstream_health_url,
        max_batch_requests: batching_config.max_batch_requests,
        max_retries: batching_config.max_retries,
        request_timeout_ms: batching_config.request_timeout.as_millis() as u64,
        wait_timeout_ms: wait_timeout.as_millis() as u64,
        max_concurrent_requests,
        version: env!("CARGO_PKG_VERSION"),
        sha: option_env!("VERGEN_GIT_SHA"),
        docker_label: option_env!("DOCKER_LABEL"),
    };

    let infer = Infer::new(
        Queue::new(),
        backend,
        batching_config,
        max_concurrent_requests,
        wait_timeout,
    );

    let addr = match hostname.unwrap_or("0.0.0.0".to_string()).parse() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port)
        }
    };

    let server = http::server::run(
        infer.clone(),
        info,
        addr,
        prom_builder,
        payload_limit,
        cors_allow_origin,
    )
    .await;

    // Requests still queued are answered before we exit
    infer.stop().await;

    server
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Info {
    /// Downstream
    #[schema(example = "http://localhost:8001/classify")]
    pub downstream_url: String,
    #[schema(nullable = true, example = "http://localhost:8001/health")]
    pub downstream_health_url: Option<String>,
    /// Router Parameters
    #[schema(example = "5")]
    pub max_batch_requests: usize,
    #[schema(example = "3")]
    pub max_retries: usize,
    #[schema(example = "30000")]
    pub request_timeout_ms: u64,
    #[schema(example = "30000")]
    pub wait_timeout_ms: u64,
    #[schema(example = "512")]
    pub max_concurrent_requests: usize,
    /// Router Info
    #[schema(example = "0.1.0")]
    pub version: &'static str,
    #[schema(nullable = true, example = "null")]
    pub sha: Option<&'static str>,
    #[schema(nullable = true, example = "null")]
    pub docker_label: Option<&'static str>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Unhealthy,
    Downstream,
    Timeout,
    Overloaded,
    Shutdown,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub error_type: ErrorType,
}

impl From<ProxyError> for ErrorResponse {
    fn from(err: ProxyError) -> Self {
        let error_type = match err {
            ProxyError::Downstream { .. } => ErrorType::Downstream,
            ProxyError::Timeout(_) => ErrorType::Timeout,
            ProxyError::Overloaded(_) => ErrorType::Overloaded,
            ProxyError::Shutdown => ErrorType::Shutdown,
        };
        Self {
            error: err.to_string(),
            error_type,
        }
    }
}

struct ResponseMetadata {
    compute_chars: usize,
    start_time: Instant,
    queue_time: Duration,
    inference_time: Duration,
    attempts: usize,
}

impl ResponseMetadata {
    fn new(
        compute_chars: usize,
        start_time: Instant,
        queue_time: Duration,
        inference_time: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            compute_chars,
            start_time,
            queue_time,
            inference_time,
            attempts,
        }
    }

    fn record_span(&self, span: &Span) {
        // Tracing metadata
        span.record("compute_chars", self.compute_chars);
        span.record("attempts", self.attempts);
        span.record("total_time", format!("{:?}", self.start_time.elapsed()));
        span.record("queue_time", format!("{:?}", self.queue_time));
        span.record("inference_time", format!("{:?}", self.inference_time));
    }

    fn record_metrics(&self) {
        // Metrics
        let histogram = metrics::histogram!("cp_request_duration");
        histogram.record(self.start_time.elapsed().as_secs_f64());
        let histogram = metrics::histogram!("cp_request_queue_duration");
        histogram.record(self.queue_time.as_secs_f64());
        let histogram = metrics::histogram!("cp_request_inference_duration");
        histogram.record(self.inference_time.as_secs_f64());
    }
}

impl From<ResponseMetadata> for HeaderMap {
    fn from(value: ResponseMetadata) -> Self {
        let millis = |duration: Duration| HeaderValue::from(duration.as_millis() as u64);

        // Headers
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-compute-characters",
            HeaderValue::from(value.compute_chars),
        );
        headers.insert("x-total-time", millis(value.start_time.elapsed()));
        headers.insert("x-queue-time", millis(value.queue_time));
        headers.insert("x-inference-time", millis(value.inference_time));
        headers.insert("x-attempts", HeaderValue::from(value.attempts));
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classify_proxy_backend::BackendError;

    #[test]
    fn proxy_errors_keep_their_kind() {
        let response = ErrorResponse::from(ProxyError::Downstream {
            attempts: 3,
            source: BackendError::RateLimited("slow down".to_string()),
        });
        assert!(matches!(response.error_type, ErrorType::Downstream));
        assert!(response.error.contains("3 attempt(s)"));

        let response = ErrorResponse::from(ProxyError::Timeout(Duration::from_secs(30)));
        assert!(matches!(response.error_type, ErrorType::Timeout));

        let response = ErrorResponse::from(ProxyError::Shutdown);
        assert!(matches!(response.error_type, ErrorType::Shutdown));
    }

    #[test]
    fn error_type_is_snake_case() {
        let response = ErrorResponse {
            error: "unhealthy".to_string(),
            error_type: ErrorType::Unhealthy,
        };
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            serde_json::json!({"error": "unhealthy", "error_type": "unhealthy"})
        );
    }

    #[test]
    fn response_metadata_headers() {
        let metadata = ResponseMetadata::new(
            12,
            Instant::now(),
            Duration::from_millis(7),
            Duration::from_millis(40),
            2,
        );
        let headers = HeaderMap::from(metadata);
        assert_eq!(headers["x-compute-characters"], "12");
        assert_eq!(headers["x-queue-time"], "7");
        assert_eq!(headers["x-inference-time"], "40");
        assert_eq!(headers["x-attempts"], "2");
        assert!(headers.contains_key("x-total-time"));
    }
}
