// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use reqwest::StatusCode;

use crate::error::{AppError, Result};
use crate::models::HttpConfig;

/// Create the shared asynchronous HTTP client.
pub fn create_async_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.timeout())
        .build()
        .map_err(|e| AppError::config(format!("failed to build HTTP client: {e}")))?;
    Ok(client)
}

/// GET a URL and return its body, mapping failures onto the source taxonomy.
///
/// Throttling and server errors are transient (network); a 404 means the
/// page moved, which is a layout problem (parse).
pub async fn fetch_text(
    client: &reqwest::Client,
    source_id: &str,
    url: &str,
    timeout: Duration,
) -> Result<String> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| AppError::from_http(source_id, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(status_error(source_id, url, status));
    }

    response
        .text()
        .await
        .map_err(|e| AppError::from_http(source_id, e))
}

/// Lightweight reachability check used by adapter health checks.
pub async fn reachable(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.head(url).timeout(timeout).send().await {
        Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
        Err(e) => {
            log::debug!("Health check of {} failed: {}", url, e);
            false
        }
    }
}

fn status_error(source_id: &str, url: &str, status: StatusCode) -> AppError {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        AppError::parse(source_id, format!("{url} returned {status}"), "")
    } else {
        AppError::network(source_id, format!("{url} returned {status}"))
    }
}
