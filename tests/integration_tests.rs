//! End-to-end scenarios spanning multiple components, exercised through
//! their public API rather than a single module's unit tests. Mirrors
//! the scenarios in SPEC_FULL.md §8.

use std::sync::Arc;

use gateway_core::context::{Context, MiddlewareStack};
use gateway_core::security::cors::{CorsConfig, CorsStrategy};
use gateway_core::security::{auth, SecurityMiddleware};
use gateway_core::Config;
use http::{HeaderMap, Method};

fn ctx(method: Method, path: &str, headers: HeaderMap) -> Context {
    Context::new("203.0.113.7:5555".parse().unwrap(), method, "gateway.example.com".into(), path.into(), String::new(), headers)
}

/// Scenario 1 (§8): a strict-CORS preflight short-circuits with 200 and
/// the exact header set the spec calls out, driven through the full
/// `SecurityMiddleware` stage rather than `cors::evaluate` directly.
#[tokio::test]
async fn scenario_1_strict_cors_preflight_through_security_middleware() {
    let cors = CorsConfig {
        strategy: CorsStrategy::Strict,
        allow_origins: vec!["https://a.example.com".into()],
        allow_methods: vec![],
        allow_headers: vec![],
        expose_headers: vec![],
        allow_credentials: false,
        max_age_secs: 3600,
    };

    let middleware = SecurityMiddleware {
        cors: Some(cors),
        auth: None,
        rate_limiter: None,
        acl: None,
        introspection: Arc::new(auth::IntrospectionCache::default()),
    };
    let mut stack = MiddlewareStack::new();
    stack.push(Arc::new(middleware));

    let mut headers = HeaderMap::new();
    headers.insert(http::header::ORIGIN, "https://a.example.com".parse().unwrap());
    headers.insert("access-control-request-method", "POST".parse().unwrap());
    let mut request = ctx(Method::OPTIONS, "/api", headers);

    let outcome = stack.run(&mut request).await;
    let (status, _) = outcome.expect("preflight must short-circuit");
    assert_eq!(status, http::StatusCode::OK);

    let all_headers: Vec<(String, String)> = request.response_modifications.iter().flat_map(|m| m.add_headers.clone()).collect();
    let as_map: std::collections::HashMap<_, _> = all_headers.into_iter().collect();
    assert_eq!(as_map["access-control-allow-origin"], "https://a.example.com");
    assert!(as_map["access-control-allow-methods"].contains("POST"));
    assert_eq!(as_map["access-control-max-age"], "3600");
    assert!(!as_map.contains_key("access-control-allow-credentials"));
}

/// Scenario 3 (§8): a `REQUIRED` API-key auth config with `/health` exempt
/// lets the request through the security stage with no credential check.
#[tokio::test]
async fn scenario_3_required_auth_with_exempt_path_skips_auth() {
    let auth_cfg = auth::AuthConfig {
        auth_type: auth::AuthType::ApiKey,
        strategy: auth::AuthStrategy::Required,
        exempt_paths: vec!["/health".into()],
        exempt_headers: vec![],
        failure_status: 401,
        failure_message: "unauthorized".into(),
        priority: 0,
        jwt_secret: None,
        jwt_algorithm: None,
        jwt_issuer: None,
        jwt_refresh_window_secs: None,
        api_key_location: Some(auth::ApiKeyLocation::Header),
        api_key_name: Some("X-API-Key".into()),
        valid_keys: vec!["secret123".into()],
        oauth2_introspect_url: None,
        oauth2_client_id: None,
        oauth2_client_secret: None,
        basic_users: Default::default(),
    };

    let middleware = SecurityMiddleware {
        cors: None,
        auth: Some(auth_cfg),
        rate_limiter: None,
        acl: None,
        introspection: Arc::new(auth::IntrospectionCache::default()),
    };
    let mut stack = MiddlewareStack::new();
    stack.push(Arc::new(middleware));

    let mut request = ctx(Method::GET, "/health", HeaderMap::new());
    let outcome = stack.run(&mut request).await;
    assert!(outcome.is_none(), "exempt path must never reach the 401 path");
}

/// A missing API key on a non-exempt `REQUIRED` path is rejected with the
/// configured failure status before any upstream dispatch would occur.
#[tokio::test]
async fn required_auth_without_credentials_is_rejected() {
    let auth_cfg = auth::AuthConfig {
        auth_type: auth::AuthType::ApiKey,
        strategy: auth::AuthStrategy::Required,
        exempt_paths: vec![],
        exempt_headers: vec![],
        failure_status: 401,
        failure_message: "missing credentials".into(),
        priority: 0,
        jwt_secret: None,
        jwt_algorithm: None,
        jwt_issuer: None,
        jwt_refresh_window_secs: None,
        api_key_location: Some(auth::ApiKeyLocation::Header),
        api_key_name: Some("X-API-Key".into()),
        valid_keys: vec!["secret123".into()],
        oauth2_introspect_url: None,
        oauth2_client_id: None,
        oauth2_client_secret: None,
        basic_users: Default::default(),
    };

    let middleware = SecurityMiddleware {
        cors: None,
        auth: Some(auth_cfg),
        rate_limiter: None,
        acl: None,
        introspection: Arc::new(auth::IntrospectionCache::default()),
    };
    let mut stack = MiddlewareStack::new();
    stack.push(Arc::new(middleware));

    let mut request = ctx(Method::GET, "/v1/orders", HeaderMap::new());
    let outcome = stack.run(&mut request).await;
    let (status, _) = outcome.expect("must abort without credentials");
    assert_eq!(status.as_u16(), 401);
}

/// Reload with an invalid CORS config (the `*`+credentials combination
/// forbidden per §9d) is rejected and the running config is left untouched.
#[tokio::test]
async fn reload_rejects_invalid_config_keeps_old_snapshot() {
    let gateway = gateway_core::Gateway::new(Config::default()).await.unwrap();
    let before = gateway.config_snapshot().await;

    let mut bad = Config::default();
    bad.security_configs.push(gateway_core::security::SecurityConfig {
        id: "sec1".into(),
        cors: Some(CorsConfig {
            strategy: CorsStrategy::Permissive,
            allow_origins: vec!["*".into()],
            allow_methods: vec![],
            allow_headers: vec![],
            expose_headers: vec![],
            allow_credentials: true,
            max_age_secs: 600,
        }),
        auth: None,
        rate_limit: None,
        acl: None,
    });

    assert!(gateway.reload(bad).await.is_err());
    let after = gateway.config_snapshot().await;
    assert_eq!(before.security_configs.len(), after.security_configs.len());
}

/// Admin pagination (§6): `pageSize` is clamped to the documented [1, 100]
/// range and the envelope carries `mainKey` alongside the window.
#[test]
fn pagination_clamps_page_size_to_documented_bounds() {
    use gateway_core::admin::common::PageParams;

    let params = PageParams { page_index: 0, page_size: 500 };
    let items: Vec<i32> = (0..10).collect();
    let (window, page) = params.slice(&items);
    assert_eq!(page.page_index, 1);
    assert_eq!(page.page_size, 100);
    assert_eq!(page.main_key, "id");
    assert_eq!(window, &items[..]);
}

/// Tunnel wire protocol (§6): a `HELLO` frame round-trips through the
/// length-prefixed codec with the advertised `PROTOCOL_VERSION`.
#[tokio::test]
async fn tunnel_hello_frame_round_trips_over_the_wire_codec() {
    use gateway_core::tunnel::protocol::{self, Hello, Kind};

    let hello = Hello { client_id: "client-42".into(), version: protocol::PROTOCOL_VERSION, os: "linux".into(), declared_ip: "10.0.0.5".into(), mac: None };

    let mut buf = Vec::new();
    protocol::write_json_frame(&mut buf, Kind::Hello, &hello).await.unwrap();

    let mut cursor = std::io::Cursor::new(buf);
    let frame = protocol::read_frame(&mut cursor).await.unwrap();
    assert_eq!(frame.kind, Kind::Hello);
    let decoded: Hello = protocol::decode_json(&frame.body).unwrap();
    assert_eq!(decoded.client_id, "client-42");
    assert_eq!(decoded.version, protocol::PROTOCOL_VERSION);
}
