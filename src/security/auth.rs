//! Request authentication (§4.4 Auth).
//!
//! JWT/OAUTH2/API_KEY/BASIC share one constant-time-comparison discipline,
//! mirroring the bearer-token check the teacher's external-controller auth
//! middleware used for its own secret check.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use base64::Engine;
use globset::{Glob, GlobSet, GlobSetBuilder};
use http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthType {
    Jwt,
    ApiKey,
    Oauth2,
    Basic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthStrategy {
    Required,
    Optional,
    Disabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    Header,
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub auth_type: AuthType,
    pub strategy: AuthStrategy,
    #[serde(default)]
    pub exempt_paths: Vec<String>,
    #[serde(default)]
    pub exempt_headers: Vec<String>,
    #[serde(default = "default_failure_status")]
    pub failure_status: u16,
    #[serde(default = "default_failure_message")]
    pub failure_message: String,
    pub priority: i32,

    // JWT
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub jwt_algorithm: Option<String>,
    #[serde(default)]
    pub jwt_issuer: Option<String>,
    #[serde(default)]
    pub jwt_refresh_window_secs: Option<u64>,

    // API_KEY
    #[serde(default)]
    pub api_key_location: Option<ApiKeyLocation>,
    #[serde(default)]
    pub api_key_name: Option<String>,
    #[serde(default)]
    pub valid_keys: Vec<String>,

    // OAUTH2
    #[serde(default)]
    pub oauth2_introspect_url: Option<String>,
    #[serde(default)]
    pub oauth2_client_id: Option<String>,
    #[serde(default)]
    pub oauth2_client_secret: Option<String>,

    // BASIC
    #[serde(default)]
    pub basic_users: HashMap<String, String>,
}

fn default_failure_status() -> u16 {
    401
}
fn default_failure_message() -> String {
    "unauthorized".to_string()
}

pub enum AuthOutcome {
    /// `refreshed_token` carries a re-signed JWT with a pushed-out `exp`
    /// when the presented token fell inside `jwt_refresh_window_secs` of
    /// expiring; callers should surface it back to the client so it can
    /// swap credentials before the original token lapses.
    Pass { subject: Option<String>, refreshed_token: Option<String> },
    Reject { status: u16, message: String },
}

/// In-memory OAUTH2 introspection cache, keyed by raw token, expiring with
/// the token's remaining validity as reported by the introspection endpoint.
#[derive(Default)]
pub struct IntrospectionCache {
    entries: RwLock<HashMap<String, (bool, Instant)>>,
}

impl IntrospectionCache {
    pub fn get(&self, token: &str) -> Option<bool> {
        let entries = self.entries.read().unwrap();
        entries.get(token).and_then(|(active, expiry)| if Instant::now() < *expiry { Some(*active) } else { None })
    }

    pub fn put(&self, token: String, active: bool, ttl: Duration) {
        self.entries.write().unwrap().insert(token, (active, Instant::now() + ttl));
    }
}

fn build_exempt_set(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        if let Ok(g) = Glob::new(p) {
            builder.add(g);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
}

pub fn is_exempt(cfg: &AuthConfig, path: &str, headers: &HeaderMap) -> bool {
    if cfg.exempt_headers.iter().any(|h| headers.contains_key(h.as_str())) {
        return true;
    }
    build_exempt_set(&cfg.exempt_paths).is_match(path)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Evaluates one request against the configured auth type/strategy.
/// `introspection` is consulted only for OAUTH2.
pub async fn evaluate(
    cfg: &AuthConfig,
    path: &str,
    headers: &HeaderMap,
    query: &str,
    introspection: &IntrospectionCache,
) -> Result<AuthOutcome> {
    if cfg.strategy == AuthStrategy::Disabled {
        return Ok(AuthOutcome::Pass { subject: None, refreshed_token: None });
    }
    if is_exempt(cfg, path, headers) {
        return Ok(AuthOutcome::Pass { subject: None, refreshed_token: None });
    }

    let result: Result<(Option<String>, Option<String>)> = match cfg.auth_type {
        AuthType::Jwt => check_jwt(cfg, headers),
        AuthType::ApiKey => check_api_key(cfg, headers, query).map(|subject| (subject, None)),
        AuthType::Basic => check_basic(cfg, headers).map(|subject| (subject, None)),
        AuthType::Oauth2 => check_oauth2(cfg, headers, introspection).await.map(|subject| (subject, None)),
    };

    match result {
        Ok((subject, refreshed_token)) => Ok(AuthOutcome::Pass { subject, refreshed_token }),
        Err(_) if cfg.strategy == AuthStrategy::Optional => Ok(AuthOutcome::Pass { subject: None, refreshed_token: None }),
        Err(_) => Ok(AuthOutcome::Reject { status: cfg.failure_status, message: cfg.failure_message.clone() }),
    }
}

/// Validates the bearer JWT and, when `jwt_refresh_window_secs` is set and
/// the token's `exp` falls inside that window, re-signs it with a pushed
/// out expiry so the caller can hand the client a fresh token.
fn check_jwt(cfg: &AuthConfig, headers: &HeaderMap) -> Result<(Option<String>, Option<String>)> {
    let token = extract_bearer(headers).ok_or_else(|| crate::Error::auth_failed("missing bearer token"))?;
    let secret = cfg.jwt_secret.as_deref().ok_or_else(|| crate::Error::config_invalid("jwt_secret not configured"))?;
    let algorithm = match cfg.jwt_algorithm.as_deref() {
        Some("HS384") => Algorithm::HS384,
        Some("HS512") => Algorithm::HS512,
        Some("RS256") => Algorithm::RS256,
        _ => Algorithm::HS256,
    };
    let mut validation = Validation::new(algorithm);
    if let Some(iss) = &cfg.jwt_issuer {
        validation.set_issuer(&[iss.as_str()]);
    }
    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<HashMap<String, serde_json::Value>>(&token, &key, &validation)?;
    let subject = data.claims.get("sub").and_then(|v| v.as_str()).map(|s| s.to_string());

    let refreshed_token = cfg.jwt_refresh_window_secs.and_then(|window| {
        let exp = data.claims.get("exp").and_then(|v| v.as_u64())?;
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if exp > now && exp - now <= window {
            refresh_jwt(secret, algorithm, &data.claims, now + window).ok()
        } else {
            None
        }
    });

    Ok((subject, refreshed_token))
}

/// Re-signs `claims` with `new_exp`, keeping every other claim untouched.
fn refresh_jwt(secret: &str, algorithm: Algorithm, claims: &HashMap<String, serde_json::Value>, new_exp: u64) -> Result<String> {
    let mut claims = claims.clone();
    claims.insert("exp".to_string(), serde_json::Value::from(new_exp));
    encode(&Header::new(algorithm), &claims, &EncodingKey::from_secret(secret.as_bytes())).map_err(crate::Error::from)
}

fn check_api_key(cfg: &AuthConfig, headers: &HeaderMap, query: &str) -> Result<Option<String>> {
    let name = cfg.api_key_name.as_deref().unwrap_or("X-API-Key");
    let presented = match cfg.api_key_location.unwrap_or(ApiKeyLocation::Header) {
        ApiKeyLocation::Header => headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string()),
        ApiKeyLocation::Query => query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string()),
    }
    .ok_or_else(|| crate::Error::auth_failed("missing api key"))?;

    if cfg.valid_keys.iter().any(|k| constant_time_eq(k, &presented)) {
        Ok(Some(presented))
    } else {
        Err(crate::Error::auth_failed("invalid api key"))
    }
}

fn check_basic(cfg: &AuthConfig, headers: &HeaderMap) -> Result<Option<String>> {
    let raw = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or_else(|| crate::Error::auth_failed("missing basic credentials"))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| crate::Error::auth_failed("malformed basic credentials"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| crate::Error::auth_failed("malformed basic credentials"))?;
    let (user, pass) = decoded.split_once(':').ok_or_else(|| crate::Error::auth_failed("malformed basic credentials"))?;

    match cfg.basic_users.get(user) {
        Some(expected) if constant_time_eq(expected, pass) => Ok(Some(user.to_string())),
        _ => Err(crate::Error::auth_failed("invalid basic credentials")),
    }
}

async fn check_oauth2(cfg: &AuthConfig, headers: &HeaderMap, cache: &IntrospectionCache) -> Result<Option<String>> {
    let token = extract_bearer(headers).ok_or_else(|| crate::Error::auth_failed("missing bearer token"))?;
    if let Some(active) = cache.get(&token) {
        return if active { Ok(Some(token)) } else { Err(crate::Error::auth_failed("token inactive")) };
    }
    let url = cfg.oauth2_introspect_url.as_deref().ok_or_else(|| crate::Error::config_invalid("oauth2_introspect_url not configured"))?;
    let client = reqwest::Client::new();
    let resp = client
        .post(url)
        .basic_auth(cfg.oauth2_client_id.as_deref().unwrap_or(""), cfg.oauth2_client_secret.as_deref())
        .form(&[("token", token.as_str())])
        .send()
        .await
        .map_err(|e| crate::Error::upstream_unavailable(e.to_string()))?;
    let body: serde_json::Value = resp.json().await.map_err(|e| crate::Error::upstream_bad_gateway(e.to_string()))?;
    let active = body.get("active").and_then(|v| v.as_bool()).unwrap_or(false);
    let ttl = body.get("exp").and_then(|v| v.as_u64()).map(Duration::from_secs).unwrap_or(Duration::from_secs(60));
    cache.put(token.clone(), active, ttl);
    if active {
        Ok(Some(token))
    } else {
        Err(crate::Error::auth_failed("token inactive"))
    }
}
