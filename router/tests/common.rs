use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use classify_proxy_core::infer::BatchingConfig;
use classify_proxy_router::run;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Every batch received by the mock downstream, in arrival order
pub type Batches = Arc<Mutex<Vec<Vec<String>>>>;

#[derive(Deserialize)]
struct DownstreamRequest {
    sequences: Vec<String>,
}

#[derive(Serialize)]
struct DownstreamResponse {
    results: Vec<String>,
}

async fn classify(
    State(batches): State<Batches>,
    Json(req): Json<DownstreamRequest>,
) -> Json<DownstreamResponse> {
    let results = req
        .sequences
        .iter()
        .map(|s| format!("label-{}", s.chars().count()))
        .collect();
    batches.lock().unwrap().push(req.sequences);
    Json(DownstreamResponse { results })
}

async fn fail(
    State(batches): State<Batches>,
    Json(req): Json<DownstreamRequest>,
) -> (StatusCode, &'static str) {
    batches.lock().unwrap().push(req.sequences);
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn slow(state: State<Batches>, req: Json<DownstreamRequest>) -> Json<DownstreamResponse> {
    tokio::time::sleep(Duration::from_millis(300)).await;
    classify(state, req).await
}

/// Mock classification service labelling each sequence with its length in characters
pub async fn start_downstream() -> Result<(SocketAddr, Batches)> {
    let batches = Batches::default();
    let app = Router::new()
        .route("/classify", post(classify))
        .route("/fail", post(fail))
        .route("/slow", post(slow))
        .route("/health", get(|| async { StatusCode::OK }))
        .route(
            "/health_down",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
        .with_state(batches.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });

    Ok((addr, batches))
}

async fn check_health(port: u16, timeout: Duration) -> Result<()> {
    let addr = format!("http://127.0.0.1:{port}/health");
    let client = reqwest::ClientBuilder::new()
        .timeout(timeout)
        .build()
        .unwrap();

    let start = Instant::now();
    loop {
        if client.get(&addr).send().await.is_ok() {
            return Ok(());
        }
        if start.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;
        } else {
            anyhow::bail!("Proxy is not up");
        }
    }
}

pub async fn start_server(
    port: u16,
    downstream_url: String,
    downstream_health_url: Option<String>,
    batching_config: BatchingConfig,
    wait_timeout: Duration,
) -> Result<()> {
    let server_task = tokio::spawn({
        run(
            downstream_url,
            downstream_health_url,
            batching_config,
            wait_timeout,
            64,
            Some("127.0.0.1".to_string()),
            port,
            2_000_000,
            None,
        )
    });

    tokio::select! {
        err = server_task => err?,
        res = check_health(port, Duration::from_secs(30)) => res,
    }?;
    Ok(())
}
