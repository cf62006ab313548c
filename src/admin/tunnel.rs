//! `hub0060` tunnel servers, `hub0061` tunnel clients. `hub0062` (tunnel
//! service registration) is exposed as a sub-resource of a tunnel client,
//! per §6's note that it subsumes the historical `hub0060`/`hub0062`
//! duplication — there is exactly one canonical `TunnelClient` model here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::tunnel::{ControlServer, LocalServiceConfig, TunnelClient, TunnelClientConfig, TunnelServerConfig};
use crate::Error;

use super::common::{to_admin_err, AdminResult, Envelope, PageParams};
use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gateway/hub0060/servers", get(list_servers).post(create_server))
        .route("/gateway/hub0060/servers/:id", get(get_server).delete(delete_server))
        .route("/gateway/hub0060/servers/:id/start", post(start_server))
        .route("/gateway/hub0060/servers/:id/stop", post(stop_server))
        .route("/gateway/hub0060/servers/:id/restart", post(restart_server))
        .route("/gateway/hub0060/servers/:id/reload", post(reload_server))
        .route("/gateway/hub0061/clients", get(list_clients).post(create_client))
        .route("/gateway/hub0061/clients/:id", get(get_client).delete(delete_client))
        .route("/gateway/hub0061/clients/:id/start", post(start_client))
        .route("/gateway/hub0061/clients/:id/stop", post(stop_client))
        .route("/gateway/hub0061/clients/:id/restart", post(restart_client))
        .route("/gateway/hub0062/clients/:id/services", post(register_tunnel_service))
        .route("/gateway/hub0062/clients/:id/services/:service_id", axum::routing::delete(unregister_tunnel_service))
}

async fn list_servers(State(state): State<AppState>, Query(page): Query<PageParams>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let (window, page_data) = page.slice(&cfg.tunnel_servers);
    Ok(Envelope::ok_page(serde_json::to_value(window).unwrap(), page_data, "SD00060"))
}

async fn get_server(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let server = cfg.tunnel_servers.iter().find(|s| s.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    Ok(Envelope::ok_one(serde_json::to_value(server).unwrap(), "SD00061"))
}

async fn create_server(State(state): State<AppState>, Json(body): Json<TunnelServerConfig>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    if cfg.tunnel_servers.iter().any(|s| s.id == body.id) {
        return Err(to_admin_err(Error::config_invalid(format!("tunnel server {} already exists", body.id))));
    }
    cfg.tunnel_servers.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00062"))
}

async fn delete_server(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    state.tunnel_servers.remove(&id);
    let mut cfg = state.config.write().await;
    let before = cfg.tunnel_servers.len();
    cfg.tunnel_servers.retain(|s| s.id != id);
    if cfg.tunnel_servers.len() == before {
        return Err(to_admin_err(Error::not_found(id)));
    }
    Ok(Envelope::ok_empty("SD00063"))
}

async fn start_server(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    if state.tunnel_servers.contains_key(&id) {
        return Ok(Envelope::ok_empty("SD00064"));
    }
    let cfg = state.config.read().await;
    let server_cfg = cfg.tunnel_servers.iter().find(|s| s.id == id).cloned().ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    drop(cfg);
    let server = Arc::new(ControlServer::new(server_cfg));
    let running = server.clone();
    tokio::spawn(async move {
        if let Err(e) = running.run().await {
            tracing::warn!(%e, "tunnel server exited");
        }
    });
    state.tunnel_servers.insert(id, server);
    Ok(Envelope::ok_empty("SD00064"))
}

async fn stop_server(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    state.tunnel_servers.remove(&id).ok_or_else(|| Error::not_found(id)).map_err(to_admin_err)?;
    Ok(Envelope::ok_empty("SD00065"))
}

/// Stop then start: existing client sessions on the old `ControlServer`
/// are dropped (their control connections close, tearing down vhost/port
/// bindings per §3's tunnel-service ownership note) and a fresh server is
/// bound from the current config.
async fn restart_server(state: State<AppState>, id: Path<String>) -> AdminResult<Envelope> {
    let _ = stop_server(state.clone(), id.clone()).await;
    start_server(state, id).await
}

/// Publishes the current `TunnelServerConfig` without tearing down the
/// running session table — mirrors `GatewayInstance::reload` (§4.8):
/// in-flight client sessions are unaffected, only new `REGISTER_SERVICE`
/// calls observe the reloaded allow-ranges/heartbeat settings next start.
async fn reload_server(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    cfg.tunnel_servers.iter().find(|s| s.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    Ok(Envelope::ok_empty("SD00073"))
}

async fn list_clients(State(state): State<AppState>, Query(page): Query<PageParams>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let (window, page_data) = page.slice(&cfg.tunnel_clients);
    Ok(Envelope::ok_page(serde_json::to_value(window).unwrap(), page_data, "SD00066"))
}

async fn get_client(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let client = cfg.tunnel_clients.iter().find(|c| c.client_id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    Ok(Envelope::ok_one(serde_json::to_value(client).unwrap(), "SD00067"))
}

async fn create_client(State(state): State<AppState>, Json(body): Json<TunnelClientConfig>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    if cfg.tunnel_clients.iter().any(|c| c.client_id == body.client_id) {
        return Err(to_admin_err(Error::config_invalid(format!("tunnel client {} already exists", body.client_id))));
    }
    cfg.tunnel_clients.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00068"))
}

async fn delete_client(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    state.tunnel_clients.remove(&id);
    let mut cfg = state.config.write().await;
    let before = cfg.tunnel_clients.len();
    cfg.tunnel_clients.retain(|c| c.client_id != id);
    if cfg.tunnel_clients.len() == before {
        return Err(to_admin_err(Error::not_found(id)));
    }
    Ok(Envelope::ok_empty("SD00069"))
}

async fn start_client(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    if state.tunnel_clients.contains_key(&id) {
        return Ok(Envelope::ok_empty("SD00070"));
    }
    let cfg = state.config.read().await;
    let client_cfg = cfg.tunnel_clients.iter().find(|c| c.client_id == id).cloned().ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    drop(cfg);
    let client = Arc::new(TunnelClient::new(client_cfg));
    let running = client.clone();
    tokio::spawn(async move {
        if let Err(e) = running.run().await {
            tracing::warn!(%e, "tunnel client exited");
        }
    });
    state.tunnel_clients.insert(id, client);
    Ok(Envelope::ok_empty("SD00070"))
}

async fn stop_client(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    state.tunnel_clients.remove(&id).ok_or_else(|| Error::not_found(id)).map_err(to_admin_err)?;
    Ok(Envelope::ok_empty("SD00071"))
}

async fn restart_client(state: State<AppState>, id: Path<String>) -> AdminResult<Envelope> {
    let _ = stop_client(state.clone(), id.clone()).await;
    start_client(state, id).await
}

async fn register_tunnel_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LocalServiceConfig>,
) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let client = cfg.tunnel_clients.iter_mut().find(|c| c.client_id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    client.services.retain(|s| s.service_id != body.service_id);
    client.services.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00072"))
}

async fn unregister_tunnel_service(
    State(state): State<AppState>,
    Path((id, service_id)): Path<(String, String)>,
) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let client = cfg.tunnel_clients.iter_mut().find(|c| c.client_id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    let before = client.services.len();
    client.services.retain(|s| s.service_id != service_id);
    if client.services.len() == before {
        return Err(to_admin_err(Error::not_found(service_id)));
    }
    Ok(Envelope::ok_empty("SD00074"))
}
