//! Module for [DaemonController] actor.
//!
//! It serves the HTTP control API and turns each request into a
//! [DaemonProcedure].

use std::{
    convert::Infallible,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use libp2p::PeerId;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    common::DaemonProcedure,
    daemon::{config::NodeConfig, error::DaemonError, routes::RouteManager},
};

use super::{
    overlay::OverlayMessage, peer_collection::PeerCollectionMessage, tunnel::TunnelMessage, Addr,
};

/// The tunnel interface and gateway that all traffic is sent to after a
/// successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTunnel {
    pub interface: String,
    pub gateway: Ipv4Addr,
}

/// Everything a procedure may touch.
pub struct ControlContext {
    pub config_path: PathBuf,
    pub routes: RouteManager,
    pub overlay: Addr<OverlayMessage>,
    pub tunnel: Addr<TunnelMessage>,
    pub sessions: Addr<PeerCollectionMessage>,
    pub full_tunnel: Option<FullTunnel>,
}

pub struct DaemonController {
    listen: SocketAddr,
    context: Arc<ControlContext>,
}

impl DaemonController {
    pub fn new(port: u16, context: ControlContext) -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], port)),
            context: Arc::new(context),
        }
    }

    pub async fn run(self) -> Result<(), DaemonError> {
        let context = self.context;
        let make_service = make_service_fn(move |_connection| {
            let context = context.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    handle_request(context.clone(), request)
                }))
            }
        });
        let server = Server::try_bind(&self.listen)?.serve(make_service);
        info!(address = %self.listen, "control API listening");
        server.await?;
        Ok(())
    }
}

pub async fn handle_request(
    context: Arc<ControlContext>,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    if request.method() != Method::GET {
        return Ok(reply(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({ "error": "only GET is supported" }),
        ));
    }
    let procedure = match request.uri().path().parse::<DaemonProcedure>() {
        Ok(procedure) => procedure,
        Err(error) => {
            debug!(%error, "unknown control request");
            return Ok(reply(StatusCode::NOT_FOUND, json!({ "error": error.to_string() })));
        }
    };
    debug!(%procedure, "executing daemon procedure");
    Ok(match execute_procedure(&context, procedure).await {
        Ok(body) => reply(StatusCode::OK, body),
        Err(error) => {
            warn!(%error, "daemon procedure failed");
            reply(status_of(&error), json!({ "error": error.to_string() }))
        }
    })
}

async fn execute_procedure(
    context: &ControlContext,
    procedure: DaemonProcedure,
) -> Result<Value, DaemonError> {
    match procedure {
        DaemonProcedure::Health => Ok(json!({ "message": "OK" })),
        DaemonProcedure::Ping => Ok(json!({ "message": "pong" })),
        DaemonProcedure::GetConfig => {
            let config = NodeConfig::load(&context.config_path)?;
            Ok(serde_json::to_value(config.redacted())?)
        }
        DaemonProcedure::Connect(peer_id) => {
            let peer: PeerId = peer_id.parse()?;
            let mut routes = context.routes.add_endpoint_route(peer).await?;
            context
                .tunnel
                .request(|reply| TunnelMessage::Open(peer, reply))
                .await??;
            if let Some(full_tunnel) = &context.full_tunnel {
                routes.extend(
                    context
                        .routes
                        .add_default_route(&full_tunnel.interface, &full_tunnel.gateway.to_string())
                        .await?,
                );
            }
            let routes: Vec<String> = routes
                .iter()
                .map(|route| route.destination.to_string())
                .collect();
            Ok(json!({ "peer": peer.to_string(), "routes": routes }))
        }
        DaemonProcedure::Disconnect(peer_id) => {
            let peer: PeerId = peer_id.parse()?;
            let sessions = context
                .sessions
                .request(|reply| PeerCollectionMessage::RemovePeer(peer, reply))
                .await?;
            let connected = context
                .overlay
                .request(|reply| OverlayMessage::Disconnect(peer, reply))
                .await?;
            Ok(json!({
                "peer": peer.to_string(),
                "sessions": sessions,
                "connected": connected,
            }))
        }
        DaemonProcedure::Peers => {
            let peers = context.sessions.request(PeerCollectionMessage::Peers).await?;
            let peers: Vec<Value> = peers
                .into_iter()
                .map(|(peer, sessions)| json!({ "peer": peer.to_string(), "sessions": sessions }))
                .collect();
            Ok(Value::Array(peers))
        }
    }
}

fn status_of(error: &DaemonError) -> StatusCode {
    match error {
        DaemonError::PeerIdParsing(_) => StatusCode::BAD_REQUEST,
        DaemonError::Io(_) | DaemonError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn reply(status: StatusCode, body: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::sync::mpsc;

    use crate::daemon::{
        actors::{peer_collection::PeerCollection, Actor},
        routes::IpRouteTable,
    };

    use super::*;

    /// Actor addresses whose actors are gone, except for the session
    /// registry which really runs.
    fn context(config_path: &Path) -> Arc<ControlContext> {
        let overlay = Addr::new(mpsc::channel(1).0);
        let sessions = PeerCollection::new();
        let sessions_address = sessions.get_addr();
        tokio::spawn(sessions.run());
        Arc::new(ControlContext {
            config_path: config_path.to_path_buf(),
            routes: RouteManager::new(Arc::new(IpRouteTable), Arc::new(overlay.clone())),
            overlay,
            tunnel: Addr::new(mpsc::channel(1).0),
            sessions: sessions_address,
            full_tunnel: None,
        })
    }

    async fn call(context: &Arc<ControlContext>, method: Method, path: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = handle_request(context.clone(), request).await.unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn liveness_and_ping() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(&dir.path().join("config.json"));
        assert_eq!(
            call(&context, Method::GET, "/").await,
            (StatusCode::OK, json!({ "message": "OK" }))
        );
        assert_eq!(
            call(&context, Method::GET, "/api/v0/").await,
            (StatusCode::OK, json!({ "message": "OK" }))
        );
        assert_eq!(
            call(&context, Method::GET, "/api/v0/ping").await,
            (StatusCode::OK, json!({ "message": "pong" }))
        );
    }

    #[tokio::test]
    async fn get_config_rereads_and_redacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let context = context(&path);

        let (status, _) = call(&context, Method::GET, "/api/v0/getConfig").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        NodeConfig {
            debug: false,
            private_key: "c2VjcmV0".to_string(),
            advertise_private_addresses: true,
        }
        .save(&path)
        .unwrap();
        let (status, body) = call(&context, Method::GET, "/api/v0/getConfig").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["debug"], json!(false));
        assert_eq!(body["advertisePrivateAddresses"], json!(true));
        assert_ne!(body["privateKey"], json!("c2VjcmV0"));
    }

    #[tokio::test]
    async fn rejects_unknown_paths_and_methods() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(&dir.path().join("config.json"));
        assert_eq!(call(&context, Method::GET, "/api/v0/nope").await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            call(&context, Method::POST, "/api/v0/ping").await.0,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn connect_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(&dir.path().join("config.json"));
        assert_eq!(
            call(&context, Method::GET, "/api/v0/connect/not-a-peer").await.0,
            StatusCode::BAD_REQUEST
        );
        let path = format!("/api/v0/connect/{}", PeerId::random());
        let (status, body) = call(&context, Method::GET, &path).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn peers_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let context = context(&dir.path().join("config.json"));
        assert_eq!(
            call(&context, Method::GET, "/api/v0/peers").await,
            (StatusCode::OK, json!([]))
        );
    }
}
