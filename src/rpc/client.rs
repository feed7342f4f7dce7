//! Outbound side of the wire protocol: one JSON request per TCP connection.
//!
//! The client writes the serialized request, half-closes its write side and
//! reads the response until EOF. Liveness probes are plain TCP connects.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::consts::DEFAULT_PROBE_TIMEOUT_MS;
use crate::consts::DEFAULT_RPC_TIMEOUT_MS;
use crate::error::Error;
use crate::error::Result;
use crate::rpc::Request;

/// Send `request` to `addr:port` and return the decoded response envelope
/// body. Fails with [`Error::Timeout`] once `deadline` elapses and with
/// [`Error::Remote`] when the peer answers `SUCCESS: false`.
pub async fn send_request_with_deadline(
    addr: &str,
    port: u16,
    request: &Request,
    deadline: Duration,
) -> Result<serde_json::Value> {
    let fut = exchange(addr, port, request);
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout),
    }
}

/// [`send_request_with_deadline`] with the default deadline.
pub async fn send_request(addr: &str, port: u16, request: &Request) -> Result<serde_json::Value> {
    send_request_with_deadline(
        addr,
        port,
        request,
        Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
    )
    .await
}

/// Typed variant of [`send_request`].
pub async fn call<T: DeserializeOwned>(addr: &str, port: u16, request: &Request) -> Result<T> {
    let body = send_request(addr, port, request).await?;
    serde_json::from_value(body).map_err(Error::Deserialize)
}

/// Can a TCP connection be established to the peer?
pub async fn is_alive(addr: &str, port: u16) -> bool {
    let probe = TcpStream::connect((addr, port));
    matches!(
        tokio::time::timeout(Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS), probe).await,
        Ok(Ok(_))
    )
}

async fn exchange(addr: &str, port: u16, request: &Request) -> Result<serde_json::Value> {
    let mut stream = TcpStream::connect((addr, port))
        .await
        .map_err(|_| Error::PeerDown)?;

    let payload = serde_json::to_vec(request).map_err(Error::Serialize)?;
    stream.write_all(&payload).await?;
    // Half-close so the server sees EOF and knows the request is complete.
    stream.shutdown().await?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;

    let envelope: serde_json::Value =
        serde_json::from_slice(&reply).map_err(Error::Deserialize)?;

    match envelope.get("SUCCESS").and_then(|v| v.as_bool()) {
        Some(true) => Ok(envelope),
        _ => {
            let errors = envelope
                .get("ERRORS")
                .and_then(|v| v.as_str())
                .unwrap_or("malformed response envelope");
            Err(Error::Remote(errors.to_string()))
        }
    }
}
