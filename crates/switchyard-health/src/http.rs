//! HTTP health probing.
//!
//! Performs a plain HTTP/1.1 GET against a target's health endpoint.
//! This is the production-shaped `ProbeTransport`; tests and the CLI's
//! local mode use the platform-backed transport instead.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use switchyard_core::Target;

use crate::prober::ProbeTransport;
use crate::tracker::ProbeOutcome;

/// Probe transport that issues HTTP GETs straight to target addresses.
pub struct HttpProbeTransport {
    /// Path probed on every target (e.g., "/healthz").
    path: String,
    timeout: Duration,
}

impl HttpProbeTransport {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn probe(&self, target: &Target) -> ProbeOutcome {
        http_probe(&target.address, &self.path, self.timeout).await
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Pass` if the response is 2xx, `Fail` for non-2xx, or
/// `Error` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeOutcome {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeOutcome::Error;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeOutcome::Error;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "switchyard-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request build failed");
                return ProbeOutcome::Error;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeOutcome::Pass
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeOutcome::Fail
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeOutcome::Error
            }
        }
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeOutcome::Error
        }
    }
}
