//! Blocking HTTP client shared by the embedding and chat backends.

use anyhow::{anyhow, bail, Result};
use std::sync::OnceLock;
use std::time::Duration;

/// A `reqwest::blocking::Client` built on first use.
///
/// Backends are constructed while assembling a pipeline inside the async
/// server, but only send requests from worker threads. Building the blocking
/// client lazily keeps its internal runtime off the async executor.
pub struct LazyClient {
    timeout: Duration,
    cell: OnceLock<reqwest::blocking::Client>,
}

impl LazyClient {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            cell: OnceLock::new(),
        }
    }

    pub fn get(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.cell.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        Ok(self.cell.get_or_init(|| client))
    }
}

/// Sends the request built by `build` and returns the successful response.
///
/// 429, 5xx and connection failures are retried up to `max_retries` times
/// with exponential backoff (1s, 2s, 4s, .. capped at 32s). Other 4xx
/// statuses fail at once.
pub fn send_with_retry<F>(
    service: &str,
    max_retries: u32,
    build: F,
) -> Result<reqwest::blocking::Response>
where
    F: Fn() -> reqwest::blocking::RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let failure = match build().send() {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status();
                let body = response.text().unwrap_or_default();
                if !is_transient(status) {
                    bail!("{} API error {}: {}", service, status, body);
                }
                anyhow!("{} API error {}: {}", service, status, body)
            }
            Err(e) => anyhow!("{} connection error: {}", service, e),
        };

        if attempt >= max_retries {
            return Err(failure.context(format!("{} request failed after {} attempts", service, attempt + 1)));
        }
        let delay = backoff(attempt);
        attempt += 1;
        tracing::warn!(service, attempt, ?delay, error = %failure, "retrying request");
        std::thread::sleep(delay);
    }
}

fn is_transient(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(9), Duration::from_secs(32));
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_transient(reqwest::StatusCode::UNAUTHORIZED));
    }
}
