//! Bearer-token authentication for the admin surface, mirroring the
//! teacher's REST-API auth middleware: constant-time comparison, a
//! public-path skip-list, and a no-op when no secret is configured.

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::AppState;

const PUBLIC_PATHS: &[&str] = &["/gateway/hello", "/gateway/version"];

pub async fn auth_middleware(State(state): State<AppState>, req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    if state.secret.is_empty() {
        return Ok(next.run(req).await);
    }

    if PUBLIC_PATHS.iter().any(|p| *p == req.uri().path()) {
        return Ok(next.run(req).await);
    }

    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                if token.as_bytes().ct_eq(state.secret.as_bytes()).into() {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    debug!("admin auth failed - missing or invalid bearer token");
    Err(StatusCode::UNAUTHORIZED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_paths_do_not_include_resource_endpoints() {
        assert!(PUBLIC_PATHS.contains(&"/gateway/hello"));
        assert!(!PUBLIC_PATHS.contains(&"/gateway/hub0010/instances"));
    }
}
