//! Minimal container-engine REST client.
//!
//! Speaks the engine's HTTP API at a pinned version over a Unix socket or
//! TCP. One connection per request: the call volume here is a handful per
//! container lifetime, and per-request handshakes keep the client free of
//! pool state.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::path::PathBuf;

use crate::error::{Result, SandboxError};

/// Pinned engine API version.
pub const API_VERSION: &str = "v1.41";

/// How to reach the engine.
#[derive(Debug, Clone)]
pub enum EngineTransport {
    /// Unix domain socket (the default `/var/run/docker.sock`).
    Unix(PathBuf),
    /// TCP host:port.
    Tcp(String),
}

impl Default for EngineTransport {
    fn default() -> Self {
        EngineTransport::Unix(PathBuf::from("/var/run/docker.sock"))
    }
}

/// The engine client.
#[derive(Debug, Clone)]
pub struct EngineClient {
    transport: EngineTransport,
}

impl EngineClient {
    /// Build a client for the given transport.
    pub fn new(transport: EngineTransport) -> Self {
        Self { transport }
    }

    /// Create a container. Returns the engine-assigned id.
    pub async fn create_container(&self, name: &str, config: Value) -> Result<String> {
        let path = format!("/{API_VERSION}/containers/create?name={name}");
        let (status, body) = self.request(Method::POST, &path, Some(config)).await?;
        if status != StatusCode::CREATED {
            return Err(engine_error("create", status, &body));
        }
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| SandboxError::Engine(format!("create response: {e}")))?;
        parsed["Id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| SandboxError::Engine("create response missing Id".into()))
    }

    /// Start a created container.
    pub async fn start_container(&self, id: &str) -> Result<()> {
        let path = format!("/{API_VERSION}/containers/{id}/start");
        let (status, body) = self.request(Method::POST, &path, None).await?;
        if status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED {
            return Err(engine_error("start", status, &body));
        }
        Ok(())
    }

    /// Stop with a grace period in seconds.
    pub async fn stop_container(&self, id: &str, grace_secs: u32) -> Result<()> {
        let path = format!("/{API_VERSION}/containers/{id}/stop?t={grace_secs}");
        let (status, body) = self.request(Method::POST, &path, None).await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(engine_error("stop", status, &body)),
        }
    }

    /// Force-remove a container.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let path = format!("/{API_VERSION}/containers/{id}?force=true");
        let (status, body) = self.request(Method::DELETE, &path, None).await?;
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(engine_error("remove", status, &body)),
        }
    }

    /// Inspect a container; returns the engine's full JSON.
    pub async fn inspect_container(&self, id: &str) -> Result<Value> {
        let path = format!("/{API_VERSION}/containers/{id}/json");
        let (status, body) = self.request(Method::GET, &path, None).await?;
        if status != StatusCode::OK {
            return Err(engine_error("inspect", status, &body));
        }
        serde_json::from_slice(&body)
            .map_err(|e| SandboxError::Engine(format!("inspect response: {e}")))
    }

    /// Whether the container is currently running.
    pub async fn is_running(&self, id: &str) -> Result<bool> {
        let inspect = self.inspect_container(id).await?;
        Ok(inspect["State"]["Running"].as_bool().unwrap_or(false))
    }

    /// Fetch the multiplexed log stream (raw bytes, frames intact).
    pub async fn container_logs(&self, id: &str, tail: usize) -> Result<Bytes> {
        let path =
            format!("/{API_VERSION}/containers/{id}/logs?stdout=true&stderr=true&tail={tail}");
        let (status, body) = self.request(Method::GET, &path, None).await?;
        if status != StatusCode::OK {
            return Err(engine_error("logs", status, &body));
        }
        Ok(body)
    }

    /// One HTTP exchange with the engine.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Bytes)> {
        let payload = match &body {
            Some(value) => Bytes::from(serde_json::to_vec(value).map_err(|e| {
                SandboxError::Engine(format!("request serialize: {e}"))
            })?),
            None => Bytes::new(),
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "docker")
            .header(hyper::header::CONTENT_LENGTH, payload.len());
        if body.is_some() {
            builder = builder.header(hyper::header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(payload))
            .map_err(|e| SandboxError::Engine(format!("bad request: {e}")))?;

        match &self.transport {
            EngineTransport::Unix(socket) => {
                let stream = tokio::net::UnixStream::connect(socket)
                    .await
                    .map_err(|e| SandboxError::Engine(format!("engine socket: {e}")))?;
                self.exchange(stream, request).await
            }
            EngineTransport::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(|e| SandboxError::Engine(format!("engine tcp: {e}")))?;
                self.exchange(stream, request).await
            }
        }
    }

    async fn exchange<S>(
        &self,
        stream: S,
        request: Request<Full<Bytes>>,
    ) -> Result<(StatusCode, Bytes)>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| SandboxError::Engine(format!("handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::debug!(%err, "engine connection closed with error");
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| SandboxError::Engine(format!("request: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| SandboxError::Engine(format!("response body: {e}")))?
            .to_bytes();
        Ok((status, bytes))
    }
}

fn engine_error(op: &str, status: StatusCode, body: &[u8]) -> SandboxError {
    let detail = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    SandboxError::Engine(format!("{op}: {status}: {detail}"))
}
