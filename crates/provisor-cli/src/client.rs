//! Minimal HTTP/1 client for the provisor REST API.

use anyhow::Context;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tracing::debug;

/// Talks to one `provisord` at `host:port`.
#[derive(Debug, Clone)]
pub struct ApiClient {
    address: String,
}

/// A decoded API response envelope.
#[derive(Debug)]
pub struct ApiReply {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiReply {
    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.body["success"] == Value::Bool(true)
    }

    /// The `data` member, or the server's error as an `Err`.
    pub fn into_data(self) -> anyhow::Result<Value> {
        if self.is_success() {
            return Ok(self.body.get("data").cloned().unwrap_or(Value::Null));
        }
        let message = self.body["error"].as_str().unwrap_or("no error message");
        match self.body["code"].as_str() {
            Some(code) => anyhow::bail!("{} ({code}): {message}", self.status),
            None => anyhow::bail!("{}: {message}", self.status),
        }
    }
}

impl ApiClient {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let address = address
            .strip_prefix("http://")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(address);
        Self { address }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<ApiReply> {
        self.request("GET", path, None).await
    }

    pub async fn post(&self, path: &str, body: Option<&Value>) -> anyhow::Result<ApiReply> {
        self.request("POST", path, body).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<ApiReply> {
        self.request("DELETE", path, None).await
    }

    async fn request(&self, method: &str, path: &str, body: Option<&Value>) -> anyhow::Result<ApiReply> {
        let uri = format!("http://{}/api/v1{path}", self.address);
        debug!(%method, %uri, "api request");

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("cannot reach provisord at {}", self.address))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut req = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", &self.address)
            .header("user-agent", concat!("provisorctl/", env!("CARGO_PKG_VERSION")));
        let payload = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Bytes::from(serde_json::to_vec(json)?)
            }
            None => Bytes::new(),
        };
        let resp = sender.send_request(req.body(Full::new(payload))?).await?;

        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        });
        Ok(ApiReply { status, body })
    }
}
