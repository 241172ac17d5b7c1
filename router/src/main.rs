use anyhow::Result;
use clap::Parser;
use classify_proxy_core::infer::BatchingConfig;
use opentelemetry::global;
use std::time::Duration;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// URL of the downstream classification endpoint. Each batch is sent as one
    /// `{"sequences": [...]}` POST request to this URL.
    #[clap(default_value = "http://localhost:8001/classify", long, env)]
    downstream_url: String,

    /// Optional URL probed with a GET request by the `/health` route.
    /// Without it the downstream is considered healthy.
    #[clap(long, env)]
    downstream_health_url: Option<String>,

    /// Maximum number of requests sent downstream in one call
    #[clap(default_value = "5", long, env)]
    max_batch_requests: usize,

    /// Attempts per batch, the first one included
    #[clap(default_value = "3", long, env)]
    max_retries: usize,

    /// Deadline of one downstream call, in milliseconds
    #[clap(default_value = "30000", long, env)]
    request_timeout_ms: u64,

    /// How long a client waits for its classification, in milliseconds.
    /// A request that times out is still sent downstream, its result is discarded.
    #[clap(default_value = "30000", long, env)]
    wait_timeout_ms: u64,

    /// Base delay before retrying a rate limited batch, multiplied by the attempt index
    #[clap(default_value = "100", long, env)]
    rate_limit_backoff_ms: u64,

    /// Base delay before retrying any other failed batch, multiplied by the attempt index
    #[clap(default_value = "50", long, env)]
    failure_backoff_ms: u64,

    /// The maximum amount of queued and in flight requests.
    /// Having a low limit will refuse clients requests instead of having them
    /// wait for too long and is usually good to handle backpressure correctly.
    #[clap(default_value = "512", long, env)]
    max_concurrent_requests: usize,

    /// The IP address to listen on
    #[clap(default_value = "0.0.0.0", long, env)]
    hostname: String,

    /// The port to listen on.
    #[clap(default_value = "3000", long, short, env)]
    port: u16,

    /// Payload size limit in bytes
    ///
    /// Default is 2MB
    #[clap(default_value = "2000000", long, env)]
    payload_limit: usize,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// The grpc endpoint for opentelemetry. Telemetry is sent to this endpoint as OTLP over gRPC.
    /// e.g. `http://localhost:4317`
    #[clap(long, env)]
    otlp_endpoint: Option<String>,

    /// The service name for opentelemetry.
    #[clap(default_value = "classify-proxy.server", long, env)]
    otlp_service_name: String,

    /// Allowed CORS origins. Any origin is allowed when unset
    #[clap(long, env)]
    cors_allow_origin: Option<Vec<String>>,
}

impl Args {
    fn batching_config(&self) -> BatchingConfig {
        BatchingConfig {
            max_batch_requests: self.max_batch_requests,
            max_retries: self.max_retries,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            rate_limit_backoff: Duration::from_millis(self.rate_limit_backoff_ms),
            failure_backoff: Duration::from_millis(self.failure_backoff_ms),
        }
    }
}

#[cfg(test)]
mod main_tests;

#[tokio::main]
async fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    // Initialize logging and telemetry
    let global_tracer = classify_proxy_router::init_logging(
        args.otlp_endpoint.as_ref(),
        args.otlp_service_name.clone(),
        args.json_output,
        args.disable_spans,
    );

    tracing::info!("{args:?}");

    let batching_config = args.batching_config();

    let result = classify_proxy_router::run(
        args.downstream_url,
        args.downstream_health_url,
        batching_config,
        Duration::from_millis(args.wait_timeout_ms),
        args.max_concurrent_requests,
        Some(args.hostname),
        args.port,
        args.payload_limit,
        args.cors_allow_origin,
    )
    .await;

    if global_tracer {
        // Shutdown tracer
        global::shutdown_tracer_provider();
    }
    result
}
