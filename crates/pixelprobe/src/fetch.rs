//! Markup retrieval over plain HTTP.
//!
//! Not a browser, just a GET. Handles redirects, timeouts, retry on 5xx
//! and transport errors, and backoff on 429. Bodies are capped in size and
//! must look like markup.

use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Something that can return a page's source for static analysis.
#[async_trait]
pub trait MarkupSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Largest body kept for static analysis; anything after it is dropped.
const MAX_MARKUP_BYTES: usize = 5 * 1024 * 1024;

/// Response from an HTTP GET request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Final URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    /// The body was cut at the size limit.
    pub truncated: bool,
}

impl HttpResponse {
    /// Whether the body is something worth scanning for page markup.
    /// A missing content type is given the benefit of the doubt.
    pub fn is_markup(&self) -> bool {
        self.content_type.as_deref().map_or(true, |ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/") || ct.contains("html") || ct.contains("xml")
        })
    }
}

/// HTTP client for markup fetching.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for sites that reject HTTP/2.
    h1_client: reqwest::Client,
    max_retries: u32,
    max_body_bytes: usize,
}

impl HttpClient {
    /// Create a new HTTP client with a desktop Chrome user agent.
    pub fn new(timeout: Duration) -> Self {
        let build = |http1_only: bool| {
            let builder = reqwest::Client::builder()
                .timeout(timeout)
                .redirect(reqwest::redirect::Policy::limited(5))
                .user_agent(USER_AGENT);
            let builder = if http1_only { builder.http1_only() } else { builder };
            builder.build().unwrap_or_default()
        };

        Self {
            client: build(false),
            h1_client: build(true),
            max_retries: 2,
            max_body_bytes: MAX_MARKUP_BYTES,
        }
    }

    /// Keep at most `limit` bytes of each body.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// GET a page, retrying transient failures.
    ///
    /// Falls back to HTTP/1.1 on protocol errors (some CDNs reject HTTP/2).
    pub async fn get(&self, url: &str) -> anyhow::Result<HttpResponse> {
        match self.get_with(&self.client, url).await {
            Err(e) if is_protocol_error(&e) => {
                debug!(url, error = %e, "retrying over HTTP/1.1");
                self.get_with(&self.h1_client, url).await
            }
            other => other,
        }
    }

    async fn get_with(&self, client: &reqwest::Client, url: &str) -> anyhow::Result<HttpResponse> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let last = attempt > self.max_retries;
            match client.get(url).send().await {
                Ok(resp) => match retry_delay(&resp, attempt) {
                    Some(delay) if !last => {
                        debug!(url, status = resp.status().as_u16(), attempt, "retrying");
                        tokio::time::sleep(delay).await;
                    }
                    _ => return self.read(resp).await,
                },
                Err(e) if !last => {
                    debug!(url, error = %e, attempt, "retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read at most `max_body_bytes` of the body.
    async fn read(&self, mut resp: reqwest::Response) -> anyhow::Result<HttpResponse> {
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp.chunk().await? {
            let room = self.max_body_bytes - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            final_url,
            status,
            content_type,
            body: String::from_utf8_lossy(&body).into_owned(),
            truncated,
        })
    }
}

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                          AppleWebKit/537.36 (KHTML, like Gecko) \
                          Chrome/131.0.0.0 Safari/537.36";

fn is_protocol_error(e: &anyhow::Error) -> bool {
    let text = format!("{e:#}");
    text.contains("http2") || text.contains("protocol") || text.contains("connection closed")
}

/// How long to wait before asking again, or `None` to keep this response.
fn retry_delay(resp: &reqwest::Response, attempt: u32) -> Option<Duration> {
    match resp.status().as_u16() {
        429 => {
            let secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(2);
            Some(Duration::from_secs(secs.min(10)))
        }
        status if status >= 500 => Some(backoff(attempt)),
        _ => None,
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt - 1))
}

#[async_trait]
impl MarkupSource for HttpClient {
    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .get(url)
            .await
            .map_err(|e| ProbeError::fetch(url, format!("{e:#}")))?;
        if !(200..300).contains(&resp.status) {
            return Err(ProbeError::fetch(url, format!("HTTP {}", resp.status)));
        }
        if !resp.is_markup() {
            return Err(ProbeError::fetch(
                url,
                format!(
                    "unexpected content type {}",
                    resp.content_type.as_deref().unwrap_or_default()
                ),
            ));
        }
        if resp.truncated {
            warn!(url, limit = self.max_body_bytes, "markup truncated");
        }
        debug!(url, final_url = %resp.final_url, bytes = resp.body.len(), "fetched markup");
        Ok(resp.body)
    }
}
