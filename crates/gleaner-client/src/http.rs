//! Shared HTTP plumbing: client construction and retry with backoff.

use gleaner_core::config::HttpConfig;
use gleaner_core::error::AppError;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::time::sleep;

const USER_AGENT: &str = "Gleaner/0.1 (metadata-harvester)";

pub(crate) fn build_client(config: &HttpConfig) -> Result<Client, AppError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.timeout)
        .build()
        .map_err(|e| AppError::ClientError(e.to_string()))
}

/// Maps a reqwest failure onto the error taxonomy.
pub(crate) fn transport_error(e: reqwest::Error, config: &HttpConfig) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(config.timeout.as_secs())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {}", e))
    } else {
        AppError::ClientError(e.to_string())
    }
}

/// Sends a request, retrying on network errors, timeouts, 429 and 5xx.
///
/// Any other response is returned as-is, so callers decide what a 4xx
/// means for them. `build` is called once per attempt.
pub(crate) async fn send_with_retry<F>(config: &HttpConfig, build: F) -> Result<Response, AppError>
where
    F: Fn() -> RequestBuilder,
{
    let attempts = config.max_retries.max(1);
    let mut last_error = AppError::Generic("No attempts made".to_string());

    for attempt in 1..=attempts {
        let retry = attempt < attempts;
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    last_error = AppError::RateLimitExceeded;
                    if retry {
                        sleep(config.retry_base_delay * 2_u32.pow(attempt)).await;
                        continue;
                    }
                } else if status.is_server_error() {
                    last_error =
                        AppError::NetworkError(format!("Server error: HTTP {}", status.as_u16()));
                    if retry {
                        sleep(config.retry_base_delay * attempt).await;
                        continue;
                    }
                } else {
                    return Ok(resp);
                }
            }
            Err(e) => {
                let transient = e.is_timeout() || e.is_connect();
                last_error = transport_error(e, config);
                if retry && transient {
                    sleep(config.retry_base_delay * attempt).await;
                    continue;
                }
                return Err(last_error);
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_build_client_with_config() {
        let config = HttpConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(build_client(&config).is_ok());
    }
}
