//! `hub0050`: namespace/service/instance CRUD + heartbeat, backed by the
//! live [`crate::registry::Registry`] rather than static config — these
//! resources are runtime state, not a reload-on-restart definition.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::registry::{InstanceFilter, ServiceInstance, ServiceKey, ServiceRecord};
use crate::Error;

use super::common::{to_admin_err, AdminResult, Envelope, PageParams};
use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gateway/hub0050/services", get(list_services).post(register_service))
        .route(
            "/gateway/hub0050/services/:tenant/:namespace/:group/:service",
            get(get_service).delete(delete_service),
        )
        .route(
            "/gateway/hub0050/services/:tenant/:namespace/:group/:service/instances",
            get(list_instances).post(register_instance),
        )
        .route(
            "/gateway/hub0050/services/:tenant/:namespace/:group/:service/instances/:instance_id",
            axum::routing::delete(deregister_instance),
        )
        .route(
            "/gateway/hub0050/services/:tenant/:namespace/:group/:service/instances/:instance_id/heartbeat",
            post(heartbeat),
        )
}

fn key_from_path((tenant, namespace, group, service): (String, String, String, String)) -> ServiceKey {
    ServiceKey { tenant, namespace, group, service }
}

async fn list_services(State(state): State<AppState>, Query(page): Query<PageParams>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let (window, page_data) = page.slice(&cfg.services);
    Ok(Envelope::ok_page(serde_json::to_value(window).unwrap(), page_data, "SD00050"))
}

async fn get_service(State(state): State<AppState>, Path(key): Path<(String, String, String, String)>) -> AdminResult<Envelope> {
    let key = key_from_path(key);
    let cfg = state.config.read().await;
    let record = cfg
        .services
        .iter()
        .find(|r| r.key.tenant == key.tenant && r.key.namespace == key.namespace && r.key.group == key.group && r.key.service == key.service)
        .ok_or_else(|| Error::not_found(key.service.clone()))
        .map_err(to_admin_err)?;
    Ok(Envelope::ok_one(serde_json::to_value(record).unwrap(), "SD00051"))
}

async fn register_service(State(state): State<AppState>, Json(body): Json<ServiceRecord>) -> AdminResult<Envelope> {
    state.registry.register_service(body.clone());
    let mut cfg = state.config.write().await;
    cfg.services.retain(|r| {
        !(r.key.tenant == body.key.tenant && r.key.namespace == body.key.namespace && r.key.group == body.key.group && r.key.service == body.key.service)
    });
    cfg.services.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00052"))
}

async fn delete_service(State(state): State<AppState>, Path(key): Path<(String, String, String, String)>) -> AdminResult<Envelope> {
    let key = key_from_path(key);
    state.registry.delete_service(&key);
    let mut cfg = state.config.write().await;
    cfg.services
        .retain(|r| !(r.key.tenant == key.tenant && r.key.namespace == key.namespace && r.key.group == key.group && r.key.service == key.service));
    Ok(Envelope::ok_empty("SD00053"))
}

async fn list_instances(State(state): State<AppState>, Path(key): Path<(String, String, String, String)>) -> AdminResult<Envelope> {
    let key = key_from_path(key);
    let instances = state.registry.list_instances(&key, &InstanceFilter { healthy_only: false });
    Ok(Envelope::ok_one(serde_json::to_value(instances).unwrap(), "SD00054"))
}

async fn register_instance(
    State(state): State<AppState>,
    Path(key): Path<(String, String, String, String)>,
    Json(body): Json<ServiceInstance>,
) -> AdminResult<Envelope> {
    let key = key_from_path(key);
    state.registry.register_instance(&key, body.clone()).map_err(to_admin_err)?;
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00055"))
}

#[derive(Deserialize)]
struct InstancePathKey {
    tenant: String,
    namespace: String,
    group: String,
    service: String,
    instance_id: String,
}

async fn deregister_instance(State(state): State<AppState>, Path(p): Path<InstancePathKey>) -> AdminResult<Envelope> {
    let key = ServiceKey { tenant: p.tenant, namespace: p.namespace, group: p.group, service: p.service };
    let (host, port) = p
        .instance_id
        .rsplit_once(':')
        .ok_or_else(|| Error::client_malformed("instance id must be host:port"))
        .map_err(to_admin_err)?;
    let port: u16 = port.parse().map_err(|_| to_admin_err(Error::client_malformed("invalid port in instance id")))?;
    state.registry.deregister_instance(&key, host, port).map_err(to_admin_err)?;
    Ok(Envelope::ok_empty("SD00056"))
}

async fn heartbeat(State(state): State<AppState>, Path(p): Path<InstancePathKey>) -> AdminResult<Envelope> {
    let key = ServiceKey { tenant: p.tenant, namespace: p.namespace, group: p.group, service: p.service };
    state.registry.heartbeat(&key, &p.instance_id, chrono::Utc::now()).map_err(to_admin_err)?;
    Ok(Envelope::ok_empty("SD00057"))
}
