//! `hub0010`: gateway-instance CRUD + start/stop/reload.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::{Json, Router};
use axum::routing::{delete, get, post, put};

use crate::instance::{GatewayInstance, InstanceConfig};
use crate::route::RouteSnapshot;
use crate::Error;

use super::common::{to_admin_err, AdminResult, Envelope, PageParams};
use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gateway/hub0010/instances", get(list).post(create))
        .route("/gateway/hub0010/instances/:id", get(get_one).put(update).delete(remove))
        .route("/gateway/hub0010/instances/:id/start", post(start))
        .route("/gateway/hub0010/instances/:id/stop", post(stop))
        .route("/gateway/hub0010/instances/:id/reload", post(reload))
}

async fn list(State(state): State<AppState>, Query(page): Query<PageParams>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let (window, page_data) = page.slice(&cfg.gateway_instances);
    Ok(Envelope::ok_page(serde_json::to_value(window).unwrap(), page_data, "SD00010"))
}

async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let found = cfg.gateway_instances.iter().find(|i| i.id == id).ok_or_else(|| Error::not_found(id.clone()));
    let found = found.map_err(|e| to_admin_err(e))?;
    Ok(Envelope::ok_one(serde_json::to_value(found).unwrap(), "SD00011"))
}

async fn create(State(state): State<AppState>, Json(body): Json<InstanceConfig>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    if cfg.gateway_instances.iter().any(|i| i.id == body.id) {
        return Err(to_admin_err(Error::config_invalid(format!("instance {} already exists", body.id))));
    }
    cfg.gateway_instances.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00012"))
}

async fn update(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<InstanceConfig>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let slot = cfg.gateway_instances.iter_mut().find(|i| i.id == id).ok_or_else(|| Error::not_found(id.clone()));
    let slot = slot.map_err(to_admin_err)?;
    *slot = body.clone();
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00013"))
}

async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let before = cfg.gateway_instances.len();
    cfg.gateway_instances.retain(|i| i.id != id);
    if cfg.gateway_instances.len() == before {
        return Err(to_admin_err(Error::not_found(id)));
    }
    Ok(Envelope::ok_empty("SD00014"))
}

async fn start(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let existing = state.instances.get(&id).await;
    let inst = if let Some(inst) = existing {
        inst
    } else {
        let cfg = state.config.read().await;
        let instance_cfg = cfg.gateway_instances.iter().find(|i| i.id == id).cloned().ok_or_else(|| Error::not_found(id.clone()));
        let instance_cfg = instance_cfg.map_err(to_admin_err)?;
        drop(cfg);
        let route_table = Arc::new(crate::route::RouteTable::new(RouteSnapshot::new(vec![])));
        let inst = Arc::new(GatewayInstance::new(instance_cfg, route_table));
        state.instances.add(inst.clone()).await;
        inst
    };
    inst.start(state.gateway.connection_handler()).await.map_err(to_admin_err)?;
    Ok(Envelope::ok_empty("SD00015"))
}

async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let inst = state.instances.get(&id).await.ok_or_else(|| Error::not_found(id.clone()));
    let inst = inst.map_err(to_admin_err)?;
    inst.stop(async {}).await.map_err(to_admin_err)?;
    Ok(Envelope::ok_empty("SD00016"))
}

async fn reload(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let inst = state.instances.get(&id).await.ok_or_else(|| Error::not_found(id.clone()));
    let inst = inst.map_err(to_admin_err)?;
    let cfg = state.config.read().await;
    let routes: Vec<_> = cfg.routes.clone();
    drop(cfg);
    inst.reload_routes(RouteSnapshot::new(routes));
    Ok(Envelope::ok_empty("SD00017"))
}
