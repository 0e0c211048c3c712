use crate::config::RetryPolicy;
use crate::models::{ReasonCode, StrategyResult};
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url, header};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {0}")]
    Status(StatusCode),
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("response is not an image: {0}")]
    NotAnImage(String),
    #[error("empty response body")]
    EmptyBody,
    #[error("request failed: {0}")]
    Request(String),
}

impl FetchError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            FetchError::Status(status) => ReasonCode::HttpStatus(status.as_u16()),
            FetchError::Timeout => ReasonCode::Timeout,
            FetchError::Connect(_) | FetchError::Request(_) => ReasonCode::Connect,
            FetchError::NotAnImage(_) => ReasonCode::NotAnImage,
            FetchError::EmptyBody => ReasonCode::EmptyBody,
        }
    }

    /// Only failures that a second try could plausibly fix. A timeout is
    /// never retried and neither is a 4xx block.
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Connect(_) | FetchError::Request(_) => true,
            FetchError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() {
            FetchError::Connect(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}

#[derive(Debug)]
pub(crate) struct Fetched {
    pub bytes: Bytes,
    pub content_type: String,
}

/// GETs `url` and accepts the body only if it looks like an image, retrying
/// once after a fixed backoff when the policy allows it.
pub(crate) async fn fetch_image(
    client: &Client,
    url: &Url,
    host_header: Option<&str>,
    retry: &RetryPolicy,
) -> Result<Fetched, FetchError> {
    let mut attempt = 0;
    loop {
        match fetch_once(client, url, host_header).await {
            Ok(fetched) => return Ok(fetched),
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                debug!(
                    target = "valuer.strategy",
                    url = %url,
                    error = %err,
                    attempt,
                    "fetch_retry"
                );
                sleep(retry.backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fetch_once(
    client: &Client,
    url: &Url,
    host_header: Option<&str>,
) -> Result<Fetched, FetchError> {
    let mut request = client.get(url.clone());
    if let Some(host) = host_header {
        request = request.header(header::HOST, host);
    }
    let response = request.send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_lowercase());
    if let Some(kind) = &content_type
        && !accepts_content_type(kind)
    {
        return Err(FetchError::NotAnImage(kind.clone()));
    }

    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Err(FetchError::EmptyBody);
    }

    Ok(Fetched {
        bytes,
        content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
    })
}

fn accepts_content_type(value: &str) -> bool {
    value.starts_with("image/") || value.starts_with("application/octet-stream")
}

/// Folds a fetch into the strategy result, logging the failure at item level.
pub(crate) fn into_result(
    strategy: &str,
    lot_ref: &str,
    fetched: Result<Fetched, FetchError>,
) -> StrategyResult {
    match fetched {
        Ok(fetched) => StrategyResult::success(strategy, fetched.bytes, fetched.content_type),
        Err(err) => {
            warn!(
                target = "valuer.strategy",
                strategy,
                lot_ref,
                error = %err,
                "strategy_attempt_failed"
            );
            StrategyResult::failure(strategy, err.reason())
        }
    }
}
