//! Security Suite: CORS, Auth, Rate-limit, ACL (C4).

pub mod acl;
pub mod auth;
pub mod cors;
pub mod ratelimit;

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::{Context, Middleware, Outcome};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    pub id: String,
    pub cors: Option<cors::CorsConfig>,
    pub auth: Option<auth::AuthConfig>,
    pub rate_limit: Option<ratelimit::RateLimitConfig>,
    pub acl: Option<acl::AclConfig>,
}

impl SecurityConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(cors) = &self.cors {
            cors.validate()?;
        }
        Ok(())
    }
}

/// Applies CORS, auth, rate-limit and ACL, in that order, as one C1
/// middleware stage. Each sub-check can independently abort the chain.
pub struct SecurityMiddleware {
    pub cors: Option<cors::CorsConfig>,
    pub auth: Option<auth::AuthConfig>,
    pub rate_limiter: Option<Arc<ratelimit::RateLimiter>>,
    pub acl: Option<acl::AclConfig>,
    pub introspection: Arc<auth::IntrospectionCache>,
}

#[async_trait::async_trait]
impl Middleware for SecurityMiddleware {
    async fn handle(&self, ctx: &mut Context) -> Outcome {
        if let Some(cors_cfg) = &self.cors {
            match cors::evaluate(cors_cfg, &ctx.method, &ctx.headers) {
                cors::CorsOutcome::PassThrough => {}
                cors::CorsOutcome::Deny => {
                    return Outcome::Abort(cors::deny_status(), serde_json::json!({"error": "CORS not allowed"}));
                }
                cors::CorsOutcome::Allow { headers, short_circuit } => {
                    for (name, value) in &headers {
                        ctx.response_modifications.push(crate::context::ResponseModification {
                            set_status: None,
                            add_headers: vec![(name.to_string(), value.clone())],
                            remove_headers: vec![],
                            body_transform: None,
                        });
                    }
                    if short_circuit {
                        return Outcome::Abort(http::StatusCode::OK, serde_json::json!({}));
                    }
                }
            }
        }

        if let Some(auth_cfg) = &self.auth {
            match auth::evaluate(auth_cfg, &ctx.path, &ctx.headers, &ctx.query, &self.introspection).await {
                Ok(auth::AuthOutcome::Pass { subject, refreshed_token }) => {
                    if let Some(subject) = subject {
                        ctx.set_scratch("auth.subject", serde_json::Value::String(subject));
                    }
                    if let Some(refreshed) = refreshed_token {
                        ctx.response_modifications.push(crate::context::ResponseModification {
                            set_status: None,
                            add_headers: vec![("x-refreshed-token".to_string(), refreshed)],
                            remove_headers: vec![],
                            body_transform: None,
                        });
                    }
                }
                Ok(auth::AuthOutcome::Reject { status, message }) => {
                    let status = http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::UNAUTHORIZED);
                    return Outcome::Abort(status, serde_json::json!({"error": message}));
                }
                Err(e) => return Outcome::Abort(http::StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({"error": e.to_string()})),
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            let client_ip = ctx.peer_addr.ip().to_string();
            let subject = ctx.get_scratch("auth.subject").and_then(|v| v.as_str()).map(|s| s.to_string());
            let key = limiter.key_for(&client_ip, subject.as_deref(), &ctx.path);
            match limiter.check(&key) {
                ratelimit::Decision::Allow => {}
                ratelimit::Decision::Deny { retry_after_secs } => {
                    ctx.response_modifications.push(crate::context::ResponseModification {
                        set_status: None,
                        add_headers: vec![("retry-after".to_string(), retry_after_secs.to_string())],
                        remove_headers: vec![],
                        body_transform: None,
                    });
                    return Outcome::Abort(http::StatusCode::TOO_MANY_REQUESTS, serde_json::json!({"error": "rate limited"}));
                }
            }
        }

        if let Some(acl_cfg) = &self.acl {
            let ua = ctx.headers.get(http::header::USER_AGENT).and_then(|v| v.to_str().ok()).unwrap_or("");
            let ip: IpAddr = ctx.peer_addr.ip();
            let req = acl::AclRequest { client_ip: ip, user_agent: ua, api_path: &ctx.path, domain: &ctx.host };
            if !acl::evaluate(acl_cfg, &req) {
                return Outcome::Abort(http::StatusCode::FORBIDDEN, serde_json::json!({"error": "access denied"}));
            }
        }

        Outcome::Continue
    }
}
