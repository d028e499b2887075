//! Drives a running daemon through its control API.

use hyper::{body, Client, StatusCode, Uri};
use serde_json::Value;
use thiserror::Error;

use crate::common::{control_address, DaemonProcedure};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("cannot reach the daemon: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid control URI: {0}")]
    Uri(#[from] hyper::http::uri::InvalidUri),

    #[error("daemon answered with invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon answered {status}: {body}")]
    Failed { status: StatusCode, body: Value },
}

async fn send_procedure(port: u16, daemon_procedure: DaemonProcedure) -> Result<Value, RemoteError> {
    let uri: Uri = format!("http://{}{}", control_address(port), daemon_procedure).parse()?;
    let response = Client::new().get(uri).await?;
    let status = response.status();
    let content = body::to_bytes(response.into_body()).await?;
    let body: Value = serde_json::from_slice(&content)?;
    if !status.is_success() {
        return Err(RemoteError::Failed { status, body });
    }
    Ok(body)
}

pub async fn ping(port: u16) -> Result<Value, RemoteError> {
    send_procedure(port, DaemonProcedure::Ping).await
}

pub async fn connect_peer(port: u16, peer_id: &str) -> Result<Value, RemoteError> {
    send_procedure(port, DaemonProcedure::Connect(peer_id.to_string())).await
}

pub async fn disconnect_peer(port: u16, peer_id: &str) -> Result<Value, RemoteError> {
    send_procedure(port, DaemonProcedure::Disconnect(peer_id.to_string())).await
}

pub async fn list_peers(port: u16) -> Result<Value, RemoteError> {
    send_procedure(port, DaemonProcedure::Peers).await
}

pub async fn get_config(port: u16) -> Result<Value, RemoteError> {
    send_procedure(port, DaemonProcedure::GetConfig).await
}
