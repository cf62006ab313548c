//! CORS enforcement (§4.4).

use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CorsStrategy {
    Default,
    Strict,
    Permissive,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub strategy: CorsStrategy,
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_max_age() -> u64 {
    600
}

/// Validates a CORS config at load/reload time, never at request time
/// (§9d): the forbidden `*` + credentials combination must never reach
/// the runtime path.
impl CorsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.strategy == CorsStrategy::Custom && self.allow_origins.is_empty() {
            return Err(crate::Error::config_invalid("custom CORS strategy requires non-empty allow_origins"));
        }
        if self.allow_origins.iter().any(|o| o == "*") && self.allow_credentials {
            return Err(crate::Error::config_invalid(
                "AllowOrigins=[\"*\"] with AllowCredentials=true is forbidden by the CORS specification",
            ));
        }
        if self.strategy == CorsStrategy::Strict && self.max_age_secs > 3600 {
            return Err(crate::Error::config_invalid("strict CORS caps max-age at 3600"));
        }
        Ok(())
    }
}

pub enum CorsOutcome {
    /// Not a CORS-relevant request (no Origin header); continue unmodified.
    PassThrough,
    /// Preflight or accepted actual request; headers to attach, and whether
    /// to short-circuit with 200 (preflight) or let the request continue.
    Allow { headers: Vec<(&'static str, String)>, short_circuit: bool },
    /// Origin not permitted under the configured strategy.
    Deny,
}

fn origin_allowed(allow_list: &[String], origin_host: &str) -> bool {
    allow_list.iter().any(|pattern| {
        if pattern == "*" {
            true
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            origin_host
                .strip_prefix("https://")
                .or_else(|| origin_host.strip_prefix("http://"))
                .map(|h| h.ends_with(suffix) && h.len() > suffix.len())
                .unwrap_or(false)
        } else {
            pattern == origin_host
        }
    })
}

pub fn evaluate(cfg: &CorsConfig, method: &Method, headers: &HeaderMap) -> CorsOutcome {
    let origin = match headers.get(http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(o) => o.to_string(),
        None => return CorsOutcome::PassThrough,
    };

    let is_preflight = method == Method::OPTIONS && headers.contains_key("access-control-request-method");

    let (allow_origin_value, allow_methods, allow_headers, expose_headers, allow_credentials, max_age, vary) = match cfg.strategy {
        CorsStrategy::Strict => {
            if cfg.allow_origins.is_empty() || !origin_allowed(&cfg.allow_origins, &origin) {
                return CorsOutcome::Deny;
            }
            let restricted = ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS"];
            (origin.clone(), restricted.join(","), cfg.allow_headers.join(","), cfg.expose_headers.join(","), false, cfg.max_age_secs.min(3600), true)
        }
        CorsStrategy::Permissive => ("*".to_string(), "*".to_string(), "*".to_string(), "*".to_string(), true, cfg.max_age_secs, false),
        CorsStrategy::Default | CorsStrategy::Custom => {
            if !origin_allowed(&cfg.allow_origins, &origin) {
                return CorsOutcome::Deny;
            }
            (
                origin.clone(),
                cfg.allow_methods.join(","),
                cfg.allow_headers.join(","),
                cfg.expose_headers.join(","),
                cfg.allow_credentials,
                cfg.max_age_secs,
                true,
            )
        }
    };

    let mut out = Vec::new();
    out.push(("access-control-allow-origin", allow_origin_value.clone()));
    if vary || allow_origin_value != "*" {
        out.push(("vary", "Origin".to_string()));
    }
    if is_preflight {
        out.push(("access-control-allow-methods", allow_methods));
        out.push(("access-control-allow-headers", allow_headers));
        out.push(("access-control-max-age", max_age.to_string()));
    } else if !expose_headers.is_empty() {
        out.push(("access-control-expose-headers", expose_headers));
    }
    if allow_credentials {
        out.push(("access-control-allow-credentials", "true".to_string()));
    }

    CorsOutcome::Allow { headers: out, short_circuit: is_preflight }
}

pub fn deny_status() -> StatusCode {
    StatusCode::FORBIDDEN
}

#[allow(dead_code)]
fn header_value(s: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_origin(origin: &str, preflight: bool) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::ORIGIN, origin.parse().unwrap());
        if preflight {
            h.insert("access-control-request-method", "POST".parse().unwrap());
        }
        h
    }

    #[test]
    fn scenario_1_strict_preflight() {
        let cfg = CorsConfig {
            strategy: CorsStrategy::Strict,
            allow_origins: vec!["https://a.example.com".into()],
            allow_methods: vec![],
            allow_headers: vec![],
            expose_headers: vec![],
            allow_credentials: false,
            max_age_secs: 3600,
        };
        let headers = headers_with_origin("https://a.example.com", true);
        match evaluate(&cfg, &Method::OPTIONS, &headers) {
            CorsOutcome::Allow { headers, short_circuit } => {
                assert!(short_circuit);
                let map: std::collections::HashMap<_, _> = headers.into_iter().collect();
                assert_eq!(map["access-control-allow-origin"], "https://a.example.com");
                assert!(map["access-control-allow-methods"].contains("POST"));
                assert_eq!(map["access-control-max-age"], "3600");
                assert!(!map.contains_key("access-control-allow-credentials"));
            }
            _ => panic!("expected allow"),
        }
    }

    #[test]
    fn scenario_2_wildcard_subdomain_reject() {
        let cfg = CorsConfig {
            strategy: CorsStrategy::Default,
            allow_origins: vec!["*.x.io".into()],
            allow_methods: vec![],
            allow_headers: vec![],
            expose_headers: vec![],
            allow_credentials: false,
            max_age_secs: 600,
        };
        let headers = headers_with_origin("https://y.io", false);
        assert!(matches!(evaluate(&cfg, &Method::GET, &headers), CorsOutcome::Deny));
    }

    #[test]
    fn permissive_star_with_credentials_rejected_at_validation() {
        let cfg = CorsConfig {
            strategy: CorsStrategy::Permissive,
            allow_origins: vec!["*".into()],
            allow_methods: vec![],
            allow_headers: vec![],
            expose_headers: vec![],
            allow_credentials: true,
            max_age_secs: 600,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn no_origin_passes_through() {
        let cfg = CorsConfig {
            strategy: CorsStrategy::Strict,
            allow_origins: vec!["https://a.io".into()],
            allow_methods: vec![],
            allow_headers: vec![],
            expose_headers: vec![],
            allow_credentials: false,
            max_age_secs: 600,
        };
        assert!(matches!(evaluate(&cfg, &Method::GET, &HeaderMap::new()), CorsOutcome::PassThrough));
    }
}
