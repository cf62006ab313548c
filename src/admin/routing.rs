//! `hub0020` routes, `hub0030` filter chains, `hub0040` security configs.
//! All three are static config CRUD over `Config`'s vectors, so they
//! share one handler shape.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::filter::Filter;
use crate::route::Route;
use crate::security::SecurityConfig;
use crate::Error;

use super::common::{to_admin_err, AdminResult, Envelope, PageParams};
use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gateway/hub0020/routes", get(list_routes).post(create_route))
        .route("/gateway/hub0020/routes/:id", get(get_route).put(update_route).delete(delete_route))
        .route("/gateway/hub0030/filters", get(list_filters).post(create_filter))
        .route("/gateway/hub0030/filters/:id", get(get_filter).put(update_filter).delete(delete_filter))
        .route("/gateway/hub0040/security-configs", get(list_security).post(create_security))
        .route("/gateway/hub0040/security-configs/:id", get(get_security).put(update_security).delete(delete_security))
}

async fn list_routes(State(state): State<AppState>, Query(page): Query<PageParams>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let (window, page_data) = page.slice(&cfg.routes);
    Ok(Envelope::ok_page(serde_json::to_value(window).unwrap(), page_data, "SD00020"))
}

async fn get_route(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let route = cfg.routes.iter().find(|r| r.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    Ok(Envelope::ok_one(serde_json::to_value(route).unwrap(), "SD00021"))
}

async fn create_route(State(state): State<AppState>, Json(body): Json<Route>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    if cfg.routes.iter().any(|r| r.id == body.id) {
        return Err(to_admin_err(Error::config_invalid(format!("route {} already exists", body.id))));
    }
    cfg.routes.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00022"))
}

async fn update_route(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<Route>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let slot = cfg.routes.iter_mut().find(|r| r.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    *slot = body.clone();
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00023"))
}

async fn delete_route(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let before = cfg.routes.len();
    cfg.routes.retain(|r| r.id != id);
    if cfg.routes.len() == before {
        return Err(to_admin_err(Error::not_found(id)));
    }
    Ok(Envelope::ok_empty("SD00024"))
}

async fn list_filters(State(state): State<AppState>, Query(page): Query<PageParams>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let (window, page_data) = page.slice(&cfg.filters);
    Ok(Envelope::ok_page(serde_json::to_value(window).unwrap(), page_data, "SD00030"))
}

async fn get_filter(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let filter = cfg.filters.iter().find(|f| f.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    Ok(Envelope::ok_one(serde_json::to_value(filter).unwrap(), "SD00031"))
}

async fn create_filter(State(state): State<AppState>, Json(body): Json<Filter>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    if cfg.filters.iter().any(|f| f.id == body.id) {
        return Err(to_admin_err(Error::config_invalid(format!("filter {} already exists", body.id))));
    }
    cfg.filters.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00032"))
}

async fn update_filter(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<Filter>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let slot = cfg.filters.iter_mut().find(|f| f.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    *slot = body.clone();
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00033"))
}

async fn delete_filter(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let before = cfg.filters.len();
    cfg.filters.retain(|f| f.id != id);
    if cfg.filters.len() == before {
        return Err(to_admin_err(Error::not_found(id)));
    }
    Ok(Envelope::ok_empty("SD00034"))
}

async fn list_security(State(state): State<AppState>, Query(page): Query<PageParams>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let (window, page_data) = page.slice(&cfg.security_configs);
    Ok(Envelope::ok_page(serde_json::to_value(window).unwrap(), page_data, "SD00040"))
}

async fn get_security(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let cfg = state.config.read().await;
    let sec = cfg.security_configs.iter().find(|s| s.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    Ok(Envelope::ok_one(serde_json::to_value(sec).unwrap(), "SD00041"))
}

async fn create_security(State(state): State<AppState>, Json(body): Json<SecurityConfig>) -> AdminResult<Envelope> {
    body.validate().map_err(to_admin_err)?;
    let mut cfg = state.config.write().await;
    if cfg.security_configs.iter().any(|s| s.id == body.id) {
        return Err(to_admin_err(Error::config_invalid(format!("security config {} already exists", body.id))));
    }
    cfg.security_configs.push(body.clone());
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00042"))
}

async fn update_security(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<SecurityConfig>) -> AdminResult<Envelope> {
    body.validate().map_err(to_admin_err)?;
    let mut cfg = state.config.write().await;
    let slot = cfg.security_configs.iter_mut().find(|s| s.id == id).ok_or_else(|| Error::not_found(id.clone())).map_err(to_admin_err)?;
    *slot = body.clone();
    Ok(Envelope::ok_one(serde_json::to_value(body).unwrap(), "SD00043"))
}

async fn delete_security(State(state): State<AppState>, Path(id): Path<String>) -> AdminResult<Envelope> {
    let mut cfg = state.config.write().await;
    let before = cfg.security_configs.len();
    cfg.security_configs.retain(|s| s.id != id);
    if cfg.security_configs.len() == before {
        return Err(to_admin_err(Error::not_found(id)));
    }
    Ok(Envelope::ok_empty("SD00044"))
}
