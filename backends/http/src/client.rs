use crate::{ClientError, Result};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    sequences: &'a [String],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    results: Vec<String>,
}

/// Downstream classification server client
#[derive(Debug, Clone)]
pub struct AsyncClient {
    client: reqwest::Client,
    classify_url: Url,
    health_url: Option<Url>,
}

impl AsyncClient {
    /// Returns a client for the given classification and health endpoints.
    ///
    /// The underlying connection pool is reused for every call.
    pub fn connect(classify_url: &str, health_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let classify_url = parse_url(classify_url)?;
        let health_url = health_url.map(parse_url).transpose()?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Connection(format!("Could not build HTTP client: {err}")))?;

        Ok(Self {
            client,
            classify_url,
            health_url,
        })
    }

    pub fn has_health_url(&self) -> bool {
        self.health_url.is_some()
    }

    /// Get downstream health
    ///
    /// Without a health endpoint the downstream is assumed to be healthy
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<()> {
        let Some(health_url) = &self.health_url else {
            return Ok(());
        };

        let response = self.client.get(health_url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Inference(format!(
                "health check returned {status}"
            )));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(batch_size = sequences.len()))]
    pub async fn classify(&self, sequences: &[String]) -> Result<Vec<String>> {
        let response = self
            .client
            .post(self.classify_url.clone())
            .json(&ClassifyRequest { sequences })
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::RateLimited(format!(
                "{} returned {status}",
                self.classify_url
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Inference(format!("{status}: {body}")));
        }

        let response: ClassifyResponse = response.json().await?;
        Ok(response.results)
    }
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|err| ClientError::Connection(format!("Invalid url `{url}`: {err}")))
}
