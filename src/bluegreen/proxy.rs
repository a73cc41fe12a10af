// ABOUTME: Pass-through HTTP reverse proxy for blue-green traffic switching.
// ABOUTME: Forwards to the single active target; 503 with no target, 502 on upstream failure.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};

use crate::shutdown::GracefulShutdownManager;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// The single piece of shared routing state: the port of the active
/// environment. Written only by deploy/rollback switches; read by every
/// inbound request. Readers always observe the old or the new value,
/// never a partial update.
#[derive(Clone, Default)]
pub struct ProxyTarget {
    port: Arc<RwLock<Option<u16>>>,
}

impl ProxyTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<u16> {
        *self.port.read()
    }

    pub fn switch(&self, port: Option<u16>) {
        *self.port.write() = port;
    }
}

/// Handle to a bound proxy; dropping it does not stop the server, call
/// [`ReverseProxy::stop`].
pub struct ReverseProxy {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl ReverseProxy {
    /// Bind the proxy and start serving. Bound exactly once per
    /// blue-green deployment lifetime.
    ///
    /// With a shutdown manager attached, every accepted connection counts
    /// toward the drain phase and can be aborted by a forced shutdown.
    pub async fn bind(
        port: u16,
        target: ProxyTarget,
        shutdown_manager: Option<Arc<GracefulShutdownManager>>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::debug!(error = %e, "proxy accept failed");
                            continue;
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                };

                let target = target.clone();
                // The guard is registered with the task's own abort handle,
                // so the task holds it; it arrives over a oneshot because
                // the handle only exists once the task is spawned.
                let (guard_tx, guard_rx) = oneshot::channel();
                let task = tokio::spawn(async move {
                    let _guard = guard_rx.await.ok().flatten();
                    let service = service_fn(move |req| forward(req, target.clone()));
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!(%peer, error = %e, "proxy connection error");
                    }
                });
                let guard = shutdown_manager
                    .as_ref()
                    .map(|m| m.track_connection(Some(task.abort_handle())));
                let _ = guard_tx.send(guard);
            }
            tracing::debug!("proxy accept loop stopped");
        });

        tracing::info!(addr = %local_addr, "reverse proxy listening");
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. In-flight requests finish on
    /// their own connections.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Forward one request verbatim to the active environment.
async fn forward(req: Request<Incoming>, target: ProxyTarget) -> Result<Response<ProxyBody>, Infallible> {
    let Some(port) = target.get() else {
        return Ok(status_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no active environment",
        ));
    };

    let upstream = format!("127.0.0.1:{port}");
    let stream = match TcpStream::connect(&upstream).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(%upstream, error = %e, "upstream connect failed");
            return Ok(status_response(StatusCode::BAD_GATEWAY, "upstream unavailable"));
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(%upstream, error = %e, "upstream handshake failed");
            return Ok(status_response(StatusCode::BAD_GATEWAY, "upstream unavailable"));
        }
    };

    tokio::spawn(async move {
        let _ = conn.await;
    });

    // Method, headers, and body stream pass through untouched.
    match sender.send_request(req).await {
        Ok(response) => Ok(response.map(|body| body.boxed())),
        Err(e) => {
            tracing::warn!(%upstream, error = %e, "upstream request failed");
            Ok(status_response(StatusCode::BAD_GATEWAY, "upstream unavailable"))
        }
    }
}

fn status_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(
            Full::new(Bytes::from_static(body.as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("static response builds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_switch_is_visible_to_clones() {
        let target = ProxyTarget::new();
        let reader = target.clone();
        assert_eq!(reader.get(), None);

        target.switch(Some(3001));
        assert_eq!(reader.get(), Some(3001));

        target.switch(None);
        assert_eq!(reader.get(), None);
    }
}
