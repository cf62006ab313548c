//! Per-request state, cancellation, and the middleware chain (C1).
//!
//! One [`Context`] is created per inbound request. It threads the route
//! match, a scratch map for inter-middleware communication, and a
//! [`CancellationToken`] shared with any sibling task spawned for the
//! upstream leg, through the pipeline described in SPEC_FULL.md §4.1.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::route::Route;

/// Outcome of a single middleware step.
pub enum Outcome {
    /// Proceed to the next stage of the pipeline.
    Continue,
    /// Unwind the chain and synthesize this response immediately.
    Abort(StatusCode, Value),
}

/// Per-stage timing recorded for the log pipeline (§4.9).
#[derive(Debug, Default, Clone)]
pub struct Timings {
    pub accept: Option<Instant>,
    pub filter_start: Option<Instant>,
    pub upstream_connect: Option<Instant>,
    pub upstream_ttfb: Option<Instant>,
    pub total_start: Option<Instant>,
}

impl Timings {
    pub fn elapsed_total_ms(&self) -> Option<u64> {
        self.total_start.map(|s| s.elapsed().as_millis() as u64)
    }
}

/// A request-scoped context shared by the whole pipeline.
///
/// `scratch` lets filters and security middleware pass derived values
/// (e.g. an authenticated subject, or a rewritten path) to later stages
/// without re-deriving them.
pub struct Context {
    pub peer_addr: SocketAddr,
    pub method: Method,
    pub host: String,
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
    pub route: Option<Route>,
    pub scratch: HashMap<String, Value>,
    pub cancellation: CancellationToken,
    pub timings: Timings,
    /// Response header/status/body overrides recorded by pre-filters,
    /// applied by post-filters (§4.3 "response_modification").
    pub response_modifications: Vec<ResponseModification>,
}

#[derive(Debug, Clone)]
pub struct ResponseModification {
    pub set_status: Option<StatusCode>,
    pub add_headers: Vec<(String, String)>,
    pub remove_headers: Vec<String>,
    pub body_transform: Option<crate::filter::Transform>,
}

impl Context {
    pub fn new(peer_addr: SocketAddr, method: Method, host: String, path: String, query: String, headers: HeaderMap) -> Self {
        let mut timings = Timings::default();
        let now = Instant::now();
        timings.accept = Some(now);
        timings.total_start = Some(now);
        Context {
            peer_addr,
            method,
            host,
            path,
            query,
            headers,
            route: None,
            scratch: HashMap::new(),
            cancellation: CancellationToken::new(),
            timings,
            response_modifications: Vec::new(),
        }
    }

    /// A cancellation token for a sibling task (the upstream leg). Cancelling
    /// either the parent or the child propagates to both — the child holds
    /// a cloned, non-owning handle.
    pub fn child_cancellation(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn set_scratch(&mut self, key: impl Into<String>, value: Value) {
        self.scratch.insert(key.into(), value);
    }

    pub fn get_scratch(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }
}

/// A middleware stage in the ordered stack C1 drives (route → security →
/// filters → dispatch). Each stage sees and can mutate the shared context.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut Context) -> Outcome;
}

/// Runs an ordered stack of middleware, unwinding on the first `Abort`.
///
/// Cancellation is checked between stages so a context cancelled mid-chain
/// (client disconnect) stops doing useful work promptly rather than
/// running the full remaining stack.
pub struct MiddlewareStack {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        MiddlewareStack { stages: Vec::new() }
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Runs the stack, returning `Some(outcome)` if a stage aborted or the
    /// context was cancelled, `None` if every stage returned `Continue`.
    pub async fn run(&self, ctx: &mut Context) -> Option<(StatusCode, Value)> {
        for stage in &self.stages {
            if ctx.is_cancelled() {
                return Some((
                    StatusCode::REQUEST_TIMEOUT,
                    serde_json::json!({"error": "cancelled"}),
                ));
            }
            match stage.handle(ctx).await {
                Outcome::Continue => continue,
                Outcome::Abort(status, body) => return Some((status, body)),
            }
        }
        None
    }
}

impl Default for MiddlewareStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn test_ctx() -> Context {
        Context::new(
            "127.0.0.1:1234".parse().unwrap(),
            Method::GET,
            "example.com".into(),
            "/api".into(),
            String::new(),
            HeaderMap::new(),
        )
    }

    struct AlwaysContinue;
    #[async_trait::async_trait]
    impl Middleware for AlwaysContinue {
        async fn handle(&self, _ctx: &mut Context) -> Outcome {
            Outcome::Continue
        }
    }

    struct AlwaysAbort;
    #[async_trait::async_trait]
    impl Middleware for AlwaysAbort {
        async fn handle(&self, _ctx: &mut Context) -> Outcome {
            Outcome::Abort(StatusCode::FORBIDDEN, serde_json::json!({"error": "denied"}))
        }
    }

    #[tokio::test]
    async fn continue_chain_runs_to_completion() {
        let mut stack = MiddlewareStack::new();
        stack.push(Arc::new(AlwaysContinue)).push(Arc::new(AlwaysContinue));
        let mut ctx = test_ctx();
        assert!(stack.run(&mut ctx).await.is_none());
    }

    #[tokio::test]
    async fn abort_short_circuits() {
        let mut stack = MiddlewareStack::new();
        stack
            .push(Arc::new(AlwaysContinue))
            .push(Arc::new(AlwaysAbort))
            .push(Arc::new(AlwaysContinue));
        let mut ctx = test_ctx();
        let outcome = stack.run(&mut ctx).await;
        assert_eq!(outcome.unwrap().0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let stack = MiddlewareStack::new();
        let mut ctx = test_ctx();
        ctx.cancellation.cancel();
        let outcome = stack.run(&mut ctx).await;
        assert!(outcome.is_none(), "empty stack still runs to completion even if cancelled before first stage check");
    }
}
