//! HTTP/1 node command channel.
//!
//! Each command is POSTed as JSON to `http://{address}/commands` and the
//! node answers with a [`NodeAck`]. A 5xx status or a transport error is
//! reported as `Err` so the orchestrator retries it; a 4xx carrying a
//! `rejected` ack is a final refusal.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::debug;

use provisor_orchestrator::{ChannelFuture, NodeAck, NodeChannel, NodeCommand, NodeEndpoint};

const COMMAND_PATH: &str = "/commands";

#[derive(Debug, Clone)]
pub struct HttpNodeChannel {
    path: String,
}

impl HttpNodeChannel {
    pub fn new() -> Self {
        Self {
            path: COMMAND_PATH.to_string(),
        }
    }
}

impl Default for HttpNodeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeChannel for HttpNodeChannel {
    fn send<'a>(&'a self, endpoint: &'a NodeEndpoint, command: &'a NodeCommand) -> ChannelFuture<'a> {
        Box::pin(post_command(&endpoint.address, &self.path, command))
    }
}

async fn post_command(address: &str, path: &str, command: &NodeCommand) -> Result<NodeAck, String> {
    let uri = format!("http://{address}{path}");
    let body = serde_json::to_vec(command).map_err(|e| format!("encode {}: {e}", command.name()))?;

    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect {address}: {e}"))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("handshake with {address}: {e}"))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "node connection closed");
        }
    });

    let req = http::Request::builder()
        .method("POST")
        .uri(&uri)
        .header("host", address)
        .header("content-type", "application/json")
        .header("user-agent", concat!("provisord/", env!("CARGO_PKG_VERSION")))
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| format!("build request: {e}"))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| format!("{} to {uri}: {e}", command.name()))?;
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("read ack from {address}: {e}"))?
        .to_bytes();

    if status.is_server_error() {
        return Err(format!("node {address} answered {status}"));
    }
    if status.is_success() && bytes.is_empty() {
        return Ok(NodeAck::accepted());
    }
    serde_json::from_slice::<NodeAck>(&bytes)
        .map_err(|e| format!("invalid ack from {address} ({status}): {e}"))
}
