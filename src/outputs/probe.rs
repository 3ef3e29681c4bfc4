//! HTTP probe of the deployed web tier.
//!
//! After an apply converges, the load balancer DNS name is the public entry
//! point. The probe issues a plain GET against it and reports what came back.

use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, TieredError};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Result of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    /// URL that was requested.
    pub url: String,
    /// Whether a 2xx response was received.
    pub healthy: bool,
    /// HTTP status code, if a response arrived.
    pub status_code: Option<u16>,
    /// Response time in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Whether the body looks like the bootstrap page.
    pub served_page: bool,
    /// Error message, if any.
    pub error: Option<String>,
}

/// Probes a deployed endpoint over HTTP.
#[derive(Debug)]
pub struct EndpointProber {
    client: Client,
    /// Path appended to the host.
    path: String,
    /// Text expected somewhere in the body.
    marker: Option<String>,
}

impl EndpointProber {
    /// Creates a prober with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a prober with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| TieredError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            path: String::from("/"),
            marker: None,
        })
    }

    /// Sets the request path.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Requires the body to contain `marker` for `served_page`.
    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /// Probes a host name or base URL.
    ///
    /// A bare host is requested over plain HTTP, which is what the listener
    /// serves.
    pub async fn probe(&self, target: &str) -> ProbeResult {
        let base = if target.starts_with("http://") || target.starts_with("https://") {
            target.trim_end_matches('/').to_string()
        } else {
            format!("http://{target}")
        };
        let url = format!("{base}{}", self.path);
        debug!(url = %url, "Probing endpoint");

        let start = Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                let response_time = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let body = response.text().await.unwrap_or_default();
                let served_page = self.marker.as_ref().map_or(!body.is_empty(), |m| body.contains(m.as_str()));
                let healthy = status.is_success();
                if !healthy {
                    debug!(url = %url, status = %status, "Endpoint returned an error status");
                }

                ProbeResult {
                    url,
                    healthy,
                    status_code: Some(status.as_u16()),
                    response_time_ms: Some(response_time),
                    served_page,
                    error: (!healthy).then(|| format!("HTTP {status}")),
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Probe failed");
                ProbeResult {
                    url,
                    healthy: false,
                    status_code: None,
                    response_time_ms: None,
                    served_page: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Probes until healthy or the deadline passes.
    ///
    /// Freshly registered targets take a while to pass the load balancer's
    /// health checks.
    pub async fn wait_until_healthy(&self, target: &str, timeout: Duration, interval: Duration) -> ProbeResult {
        let start = Instant::now();
        loop {
            let result = self.probe(target).await;
            if result.healthy || start.elapsed() + interval > timeout {
                return result;
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl std::fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.healthy { "healthy" } else { "unhealthy" };
        write!(f, "{}: {status}", self.url)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {code}")?;
            if let Some(ms) = self.response_time_ms {
                write!(f, ", {ms} ms")?;
            }
            write!(f, ")")?;
        }
        if let Some(error) = &self.error {
            write!(f, " - {error}")?;
        }
        Ok(())
    }
}
