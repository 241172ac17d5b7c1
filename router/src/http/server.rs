/// HTTP Server logic
use crate::http::types::{ClassifyRequest, ClassifyResponse};
use crate::logging::http::caller_trace_middleware;
use crate::{shutdown, ErrorResponse, ErrorType, Info, ResponseMetadata};
use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{http, Json, Router};
use classify_proxy_core::infer::Infer;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

/// Proxy configuration
#[utoipa::path(
get,
tag = "Classify Proxy",
path = "/info",
responses((status = 200, description = "Proxy configuration", body = Info))
)]
#[instrument]
async fn get_info(info: Extension<Info>) -> Json<Info> {
    Json(info.0)
}

#[utoipa::path(
get,
tag = "Classify Proxy",
path = "/health",
responses(
(status = 200, description = "Everything is working fine"),
(status = 503, description = "Downstream is down", body = ErrorResponse,
example = json ! ({"error": "unhealthy", "error_type": "unhealthy"})),
)
)]
#[instrument(skip(infer))]
/// Health check method
async fn health(infer: Extension<Infer>) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    match infer.health().await {
        true => Ok(()),
        false => Err(ErrorResponse {
            error: "unhealthy".to_string(),
            error_type: ErrorType::Unhealthy,
        })?,
    }
}

/// Classify one sequence. Concurrent requests are batched, longest sequences first.
#[utoipa::path(
post,
tag = "Classify Proxy",
path = "/classify",
request_body = ClassifyRequest,
responses(
(status = 200, description = "Classification", body = ClassifyResponse),
(status = 429, description = "Proxy is overloaded", body = ErrorResponse,
example = json ! ({"error": "Proxy is overloaded", "error_type": "overloaded"})),
(status = 502, description = "Downstream failed", body = ErrorResponse,
example = json ! ({"error": "Classification failed after 3 attempt(s): Server error: 500", "error_type": "downstream"})),
(status = 503, description = "Proxy is shutting down", body = ErrorResponse,
example = json ! ({"error": "Dispatcher stopped before the request was classified", "error_type": "shutdown"})),
(status = 504, description = "No result in time", body = ErrorResponse,
example = json ! ({"error": "No classification result after 30s", "error_type": "timeout"})),
)
)]
#[instrument(
    skip_all,
    fields(total_time, queue_time, inference_time, compute_chars, attempts)
)]
async fn classify(
    infer: Extension<Infer>,
    Extension(context): Extension<Option<opentelemetry::Context>>,
    Json(req): Json<ClassifyRequest>,
) -> Result<(HeaderMap, Json<ClassifyResponse>), (StatusCode, Json<ErrorResponse>)> {
    let span = tracing::Span::current();
    if let Some(context) = context {
        span.set_parent(context);
    }
    let start_time = Instant::now();

    let counter = metrics::counter!("cp_request_count");
    counter.increment(1);

    let compute_chars = req.sequence.chars().count();

    let permit = infer.try_acquire_permit().map_err(ErrorResponse::from)?;
    let response = infer
        .classify(req.sequence, permit)
        .await
        .map_err(ErrorResponse::from)?;

    let counter = metrics::counter!("cp_request_success");
    counter.increment(1);

    let metadata = ResponseMetadata::new(
        compute_chars,
        start_time,
        response.metadata.queue,
        response.metadata.inference,
        response.metadata.attempts,
    );
    metadata.record_span(&span);
    metadata.record_metrics();

    tracing::info!("Success");

    Ok((
        HeaderMap::from(metadata),
        Json(ClassifyResponse {
            result: response.result,
        }),
    ))
}

/// Prometheus metrics scrape endpoint
#[utoipa::path(
get,
tag = "Classify Proxy",
path = "/metrics",
responses((status = 200, description = "Prometheus Metrics", body = String))
)]
async fn metrics(prom_handle: Extension<PrometheusHandle>) -> String {
    prom_handle.render()
}

/// Serving method
pub async fn run(
    infer: Infer,
    info: Info,
    addr: SocketAddr,
    prom_builder: PrometheusBuilder,
    payload_limit: usize,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<(), anyhow::Error> {
    // OpenAPI documentation
    #[derive(OpenApi)]
    #[openapi(
    paths(
    get_info,
    health,
    classify,
    metrics,
    ),
    components(
    schemas(
    Info,
    ClassifyRequest,
    ClassifyResponse,
    ErrorResponse,
    ErrorType,
    )
    ),
    tags(
    (name = "Classify Proxy", description = "Priority batching proxy for classification services")
    ),
    info(
    title = "Classify Proxy",
    license(
    name = "Apache 2.0",
    url = "https://www.apache.org/licenses/LICENSE-2.0"
    )
    )
    )]
    struct ApiDoc;

    // CORS allowed origins
    let allow_origin = match cors_allow_origin {
        Some(cors_allow_origin) => AllowOrigin::list(
            cors_allow_origin
                .into_iter()
                .map(|origin| origin.parse::<HeaderValue>())
                .collect::<Result<Vec<_>, _>>()
                .context("invalid CORS origin")?,
        ),
        None => AllowOrigin::any(),
    };

    let prom_handle = prom_builder
        .install_recorder()
        .context("failed to install metrics recorder")?;

    // CORS layer
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([http::header::CONTENT_TYPE])
        .allow_origin(allow_origin);

    // Create router
    let app = Router::new()
        .route(
            "/api-doc/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        // Base routes
        .route("/info", get(get_info))
        .route("/classify", post(classify))
        // Legacy route
        .route("/proxy_classify", post(classify))
        // Base Health route
        .route("/health", get(health))
        // Inference API health route
        .route("/", get(health))
        // AWS Sagemaker health route
        .route("/ping", get(health))
        // Prometheus metrics route
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(payload_limit))
        .layer(Extension(infer))
        .layer(Extension(info))
        .layer(Extension(prom_handle))
        .layer(axum::middleware::from_fn(caller_trace_middleware))
        .layer(cors_layer);

    // Run server
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind to {addr}"))?;

    tracing::info!("Starting HTTP server: {}", &addr);
    tracing::info!("Ready");

    axum::serve(listener, app)
        // Wait until all requests are finished to shut down
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;

    Ok(())
}

impl From<&ErrorType> for StatusCode {
    fn from(value: &ErrorType) -> Self {
        match value {
            ErrorType::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::Downstream => StatusCode::BAD_GATEWAY,
            ErrorType::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorType::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Convert to Axum supported formats
impl From<ErrorResponse> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: ErrorResponse) -> Self {
        (StatusCode::from(&err.error_type), Json(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_failures_are_server_errors() {
        for error_type in [
            ErrorType::Unhealthy,
            ErrorType::Downstream,
            ErrorType::Timeout,
            ErrorType::Shutdown,
        ] {
            assert!(StatusCode::from(&error_type).is_server_error());
        }
        assert_eq!(
            StatusCode::from(&ErrorType::Overloaded),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            StatusCode::from(&ErrorType::Downstream),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            StatusCode::from(&ErrorType::Timeout),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
