//! Admin surface (§6): REST CRUD + lifecycle control over every
//! configured resource, served by the same `axum` stack the gateway
//! itself uses for its data-plane listeners.

mod auth;
pub mod common;
mod instances;
mod registry;
mod routing;
mod tunnel;

pub use auth::auth_middleware;
pub use common::{Envelope, PageQueryData};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, routing::get, Json, Router};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::instance::InstanceManager;
use crate::registry::Registry;
use crate::tunnel::{ControlServer, TunnelClient};
use crate::{Result, VERSION};

/// State shared by every admin handler: the mutable config, the live
/// instance/registry/tunnel managers that CRUD and lifecycle endpoints
/// act on, and the bearer secret gating everything but `/gateway/hello`.
#[derive(Clone)]
pub struct AppState {
    pub secret: String,
    pub config: Arc<RwLock<Config>>,
    pub instances: Arc<InstanceManager>,
    pub registry: Arc<Registry>,
    pub gateway: Arc<crate::Gateway>,
    pub tunnel_servers: Arc<DashMap<String, Arc<ControlServer>>>,
    pub tunnel_clients: Arc<DashMap<String, Arc<TunnelClient>>>,
}

impl AppState {
    pub fn new(secret: String, gateway: Arc<crate::Gateway>) -> Self {
        AppState {
            secret,
            config: gateway.config.clone(),
            instances: gateway.instances.clone(),
            registry: gateway.registry.clone(),
            gateway,
            tunnel_servers: Arc::new(DashMap::new()),
            tunnel_clients: Arc::new(DashMap::new()),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/gateway/hello", get(hello))
        .route("/gateway/version", get(version))
        .merge(instances::router())
        .merge(routing::router())
        .merge(registry::router())
        .merge(tunnel::router())
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let router = create_router(state);
    info!(%addr, "starting admin API server");
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(crate::Error::Io)?;
    axum::serve(listener, router).await.map_err(crate::Error::Io)?;
    Ok(())
}

async fn hello() -> Json<Value> {
    Json(json!({ "hello": "gateway-core" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": VERSION }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn state() -> AppState {
        let gateway = Arc::new(crate::Gateway::new(Config::default()).await.unwrap());
        AppState::new(String::new(), gateway)
    }

    #[tokio::test]
    async fn hello_reports_service_name() {
        let response = hello().await;
        assert_eq!(response.0["hello"], "gateway-core");
    }

    #[tokio::test]
    async fn empty_config_yields_empty_instance_list() {
        let state = state().await;
        let cfg = state.config.read().await;
        assert!(cfg.gateway_instances.is_empty());
    }
}
