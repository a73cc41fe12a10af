// ABOUTME: Bounded-timeout HTTP health probe shared by every strategy.
// ABOUTME: A 200-class response means healthy; connect errors and timeouts do not.

use std::time::Duration;

use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

/// How often `wait_healthy` re-probes an instance.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The endpoint answered with a non-2xx status.
    Unhealthy,
    /// Connection failure or timeout.
    Unreachable,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("instance failed health checks after {attempts} attempts against {addr}")]
    RetriesExhausted { addr: String, attempts: u32 },
}

/// Issues bounded-timeout GETs against an instance health endpoint.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    path: String,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self { path, timeout }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// One probe against `addr` (a `host:port` pair).
    pub async fn check(&self, addr: &str) -> ProbeOutcome {
        match tokio::time::timeout(self.timeout, self.request(addr)).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                tracing::debug!(addr, path = %self.path, "health probe timed out");
                ProbeOutcome::Unreachable
            }
        }
    }

    async fn request(&self, addr: &str) -> ProbeOutcome {
        let stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(addr, error = %e, "health probe connect failed");
                return ProbeOutcome::Unreachable;
            }
        };

        let (mut sender, conn) =
            match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::debug!(addr, error = %e, "health probe handshake failed");
                    return ProbeOutcome::Unreachable;
                }
            };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(&self.path)
            .header(http::header::HOST, addr)
            .header(http::header::USER_AGENT, "cutover-probe/0.1")
            .body(Empty::<bytes::Bytes>::new());

        let request = match request {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(addr, error = %e, "health probe request build failed");
                return ProbeOutcome::Unreachable;
            }
        };

        match sender.send_request(request).await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => {
                tracing::debug!(addr, status = %response.status(), "health probe non-2xx");
                ProbeOutcome::Unhealthy
            }
            Err(e) => {
                tracing::debug!(addr, error = %e, "health probe request failed");
                ProbeOutcome::Unreachable
            }
        }
    }

    /// Poll until healthy, every 2s, up to `retries` attempts.
    ///
    /// # Errors
    ///
    /// Returns `ProbeError::RetriesExhausted` once the budget runs out.
    pub async fn wait_healthy(&self, addr: &str, retries: u32) -> Result<(), ProbeError> {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            if self.check(addr).await == ProbeOutcome::Healthy {
                tracing::debug!(addr, attempt, "instance healthy");
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        }
        Err(ProbeError::RetriesExhausted {
            addr: addr.to_string(),
            attempts,
        })
    }
}
