//! Outbound fetches against the origin conversion service.
//!
//! Aggregation sends one GET per subscription set: the member links are
//! pipe-joined, URL-encoded, and handed to the converter together with
//! the target format. Failures retry with fixed exponential backoff (no
//! jitter) and rotate across configured servers; 4xx responses and the
//! converter's literal "1" failure body never retry.

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::metrics;
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A successful upstream response.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub body: Bytes,
    pub content_type: String,
}

/// Issues converter and passthrough fetches with retry.
pub struct FetchOrchestrator {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl FetchOrchestrator {
    pub fn new(config: UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.total_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// Build the converter URL for one attempt. Retries rotate through
    /// the configured servers.
    fn converter_url(&self, attempt: usize, links: &[String], target: &str) -> String {
        let server = &self.config.servers[attempt % self.config.servers.len()];
        let joined = links.join("|");
        format!(
            "{}?target={}&url={}",
            server,
            urlencoding::encode(target),
            urlencoding::encode(&joined)
        )
    }

    /// Convert a set of subscription links into `target` format.
    pub async fn resolve(
        &self,
        links: &[String],
        target: &str,
        user_agent: Option<&str>,
    ) -> Result<FetchResult, UpstreamError> {
        self.get_with_retries(|attempt| self.converter_url(attempt, links, target), user_agent)
            .await
    }

    /// Fetch a single subscription link as-is, no conversion.
    pub async fn fetch_raw(
        &self,
        link: &str,
        user_agent: Option<&str>,
    ) -> Result<FetchResult, UpstreamError> {
        self.get_with_retries(|_| link.to_string(), user_agent).await
    }

    async fn get_with_retries(
        &self,
        url_for_attempt: impl Fn(usize) -> String,
        user_agent: Option<&str>,
    ) -> Result<FetchResult, UpstreamError> {
        let mut last_error = UpstreamError::Exhausted("no attempts made".to_string());
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                metrics::record_upstream_retry();
                let delay = self.config.backoff_base_ms * 2u64.pow(attempt - 1);
                debug!(attempt = attempt, delay_ms = delay, "Retrying upstream fetch");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let url = url_for_attempt(attempt as usize);
            let started = Instant::now();
            match self.attempt(&url, user_agent).await {
                Ok(result) => {
                    metrics::record_upstream_attempt("ok", started.elapsed().as_secs_f64());
                    return Ok(result);
                }
                Err(e) => {
                    metrics::record_upstream_attempt("error", started.elapsed().as_secs_f64());
                    warn!(error = %e, attempt = attempt, "Upstream fetch failed");
                    let retryable = e.is_retryable();
                    last_error = e;
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn attempt(
        &self,
        url: &str,
        user_agent: Option<&str>,
    ) -> Result<FetchResult, UpstreamError> {
        let mut request = self.client.get(url);
        if let Some(ua) = user_agent {
            request = request.header(reqwest::header::USER_AGENT, ua);
        }
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = response.bytes().await.map_err(classify)?;
        // The converter signals failure with a bare "1" body and a 200.
        if body.as_ref().trim_ascii() == b"1" {
            return Err(UpstreamError::BadBody);
        }
        Ok(FetchResult { body, content_type })
    }
}

fn classify(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout
    } else if e.is_connect() {
        UpstreamError::Connect
    } else {
        UpstreamError::Transport(e.to_string())
    }
}
