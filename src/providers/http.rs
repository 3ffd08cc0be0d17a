//! Shared upstream HTTP clients.
//!
//! Synchronous calls retry transient failures with exponential backoff.
//! Streaming calls are capped at one retry: partial output is not
//! resumable, so a mid-stream failure surfaces instead of replaying.

use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};

use super::ProviderError;

pub fn sync_client(timeout_secs: u64) -> ClientWithMiddleware {
    build(timeout_secs, 3)
}

pub fn stream_client(timeout_secs: u64) -> ClientWithMiddleware {
    build(timeout_secs, 1)
}

fn build(timeout_secs: u64, max_retries: u32) -> ClientWithMiddleware {
    let reqwest_client = reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(32)
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build HTTP client");

    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
    ClientBuilder::new(reqwest_client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

pub fn map_send_error(e: reqwest_middleware::Error) -> ProviderError {
    ProviderError::Network(e.to_string())
}

/// Convert a non-success upstream response into a `ProviderError::Http`.
pub async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Http { status: status.as_u16(), body })
}
