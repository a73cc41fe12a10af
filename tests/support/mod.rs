// ABOUTME: Shared test fixtures: a recording fake runtime, tiny HTTP servers,
// ABOUTME: and a bare-bones HTTP client for poking the proxy.

// Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use cutover::runtime::{InstanceRuntime, RuntimeError};
use cutover::types::Version;
use http_body_util::{BodyExt, Empty, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Runtime fake that records operations instead of spawning processes.
/// Tests pair it with real loopback HTTP servers so health probes pass.
#[derive(Default)]
pub struct FakeRuntime {
    pub running: Mutex<Vec<u16>>,
    pub ops: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl InstanceRuntime for FakeRuntime {
    async fn stage_artifact(
        &self,
        _artifact: &Path,
        version: &Version,
        port: u16,
    ) -> Result<(), RuntimeError> {
        // Real staging suspends on filesystem I/O.
        tokio::task::yield_now().await;
        self.ops.lock().push(format!("stage {port} {version}"));
        Ok(())
    }

    async fn start_instance(&self, port: u16, version: &Version) -> Result<(), RuntimeError> {
        self.ops.lock().push(format!("start {port} {version}"));
        self.running.lock().push(port);
        Ok(())
    }

    async fn stop_instance(
        &self,
        port: u16,
        _graceful_timeout: Duration,
    ) -> Result<(), RuntimeError> {
        self.ops.lock().push(format!("stop {port}"));
        self.running.lock().retain(|&p| p != port);
        Ok(())
    }

    async fn is_running(&self, port: u16) -> bool {
        self.running.lock().contains(&port)
    }
}

/// Spawn a loopback HTTP server answering every request with 200 and the
/// given body. Returns the bound port.
pub async fn serve_ok(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req| async move {
                    Ok::<_, Infallible>(
                        hyper::Response::builder()
                            .status(200)
                            .body(Full::new(bytes::Bytes::from_static(body.as_bytes())))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

/// Like [`serve_ok`] but waits `delay` before answering, so a request can
/// be observed in flight.
pub async fn serve_slow(body: &'static str, delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req| async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, Infallible>(
                        hyper::Response::builder()
                            .status(200)
                            .body(Full::new(bytes::Bytes::from_static(body.as_bytes())))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    port
}

/// One-shot GET against `addr`, returning status code and body.
pub async fn http_get(addr: &str, path: &str) -> (u16, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(path)
        .header(http::header::HOST, addr)
        .body(Empty::<bytes::Bytes>::new())
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}
