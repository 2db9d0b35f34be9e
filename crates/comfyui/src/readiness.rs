//! Bounded-retry readiness check run before any traffic is sent.
//!
//! A failed attempt (connection error or non-200 response) is not fatal:
//! the probe waits `delay` and tries again until `max_attempts` is used up,
//! then reports `false`. "Not ready yet" and "permanently broken" look the
//! same to the caller.

use std::time::Duration;

use reqwest::StatusCode;

/// Readiness probe against a plain HTTP `GET` endpoint.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: reqwest::Client,
    max_attempts: u32,
    delay: Duration,
}

impl ReadinessProbe {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), max_attempts, delay)
    }

    pub fn with_client(client: reqwest::Client, max_attempts: u32, delay: Duration) -> Self {
        Self {
            client,
            max_attempts,
            delay,
        }
    }

    /// Return `true` on the first HTTP 200 from `url`, `false` once every
    /// attempt has failed.
    pub async fn probe(&self, url: &str) -> bool {
        for attempt in 1..=self.max_attempts {
            match self.client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    tracing::info!(url, attempt, "Service is reachable");
                    return true;
                }
                Ok(response) => {
                    tracing::debug!(
                        url,
                        attempt,
                        status = response.status().as_u16(),
                        "Service not ready",
                    );
                }
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "Service not reachable");
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        tracing::error!(
            url,
            attempts = self.max_attempts,
            "Failed to connect to server after {} attempts",
            self.max_attempts,
        );
        false
    }
}

/// One-shot form of [`ReadinessProbe::probe`].
pub async fn probe(url: &str, max_attempts: u32, delay: Duration) -> bool {
    ReadinessProbe::new(max_attempts, delay).probe(url).await
}
