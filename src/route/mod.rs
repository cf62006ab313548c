//! Host+path+method route resolution over an immutable snapshot (C2).

use std::sync::{Arc, RwLock};

use http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;

/// How a route's path is matched against the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PathMatch {
    Exact { value: String },
    Prefix { value: String },
    Regex { pattern: String, #[serde(skip)] compiled: Option<CompiledRegex> },
}

/// `Regex` has no `PartialEq`/serde impl worth deriving through; wrap it so
/// `PathMatch` can still derive the traits it needs for config round-trips.
#[derive(Debug, Clone)]
pub struct CompiledRegex(pub Arc<Regex>);

/// Host pattern class, used to group routes before path matching (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum HostClass {
    Exact,
    WildcardSuffix,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub host: String,
    pub path: PathMatch,
    pub methods: Vec<String>,
    pub priority: i32,
    pub target_service: Option<String>,
    pub target_upstream: Option<String>,
    pub filter_chain_id: Option<String>,
    pub security_config_id: Option<String>,
    /// Overrides the dispatcher's default idempotent-methods-only retry
    /// gate, for routes fronting handlers that are safe to retry despite
    /// using POST/PATCH (e.g. backed by an idempotency key upstream).
    #[serde(default)]
    pub retry_non_idempotent: bool,
}

impl Route {
    fn host_class(&self) -> HostClass {
        if self.host == "*" {
            HostClass::Any
        } else if let Some(suffix) = self.host.strip_prefix("*.") {
            let _ = suffix;
            HostClass::WildcardSuffix
        } else {
            HostClass::Exact
        }
    }

    fn host_matches(&self, request_host: &str) -> bool {
        match self.host_class() {
            HostClass::Any => true,
            HostClass::Exact => self.host.eq_ignore_ascii_case(request_host),
            HostClass::WildcardSuffix => {
                let suffix = &self.host[1..]; // keep leading dot: ".x.y"
                request_host.len() > suffix.len()
                    && request_host[request_host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
            }
        }
    }

    fn path_class_rank(&self) -> u8 {
        match self.path {
            PathMatch::Exact { .. } => 0,
            PathMatch::Prefix { .. } => 1,
            PathMatch::Regex { .. } => 2,
        }
    }

    fn path_matches(&self, request_path: &str) -> bool {
        match &self.path {
            PathMatch::Exact { value } => value == request_path,
            PathMatch::Prefix { value } => request_path.starts_with(value.as_str()),
            PathMatch::Regex { compiled, pattern } => compiled
                .as_ref()
                .map(|r| r.0.is_match(request_path))
                .unwrap_or_else(|| Regex::new(pattern).map(|r| r.is_match(request_path)).unwrap_or(false)),
        }
    }

    fn specificity(&self, request_path: &str) -> i64 {
        match &self.path {
            PathMatch::Exact { value } => value.len() as i64,
            PathMatch::Prefix { value } => value.len() as i64,
            PathMatch::Regex { compiled, pattern } => {
                let tokens = compiled
                    .as_ref()
                    .map(|r| r.0.as_str().split(['/', '-', '_']).count())
                    .unwrap_or_else(|| pattern.split(['/', '-', '_']).count());
                let _ = request_path;
                tokens as i64
            }
        }
    }

    fn method_matches(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Pre-compile the regex path matcher so matching doesn't pay the
    /// compilation cost per request.
    pub fn compiled(mut self) -> Result<Self> {
        if let PathMatch::Regex { pattern, .. } = &self.path {
            let re = Regex::new(pattern).map_err(|e| crate::Error::config_invalid(e.to_string()))?;
            self.path = PathMatch::Regex {
                pattern: pattern.clone(),
                compiled: Some(CompiledRegex(Arc::new(re))),
            };
        }
        Ok(self)
    }
}

/// An immutable, published set of routes. New snapshots are built
/// off-path and swapped atomically (§4.2, §5) so in-flight requests keep
/// matching against the snapshot they started with.
#[derive(Debug, Clone, Default)]
pub struct RouteSnapshot {
    routes: Arc<Vec<Route>>,
}

impl RouteSnapshot {
    pub fn new(mut routes: Vec<Route>) -> Self {
        // Pre-sort by host class for matching; final tie-break happens per lookup
        // since path class/method filtering change which routes are "equal".
        routes.sort_by(|a, b| a.host_class().cmp(&b.host_class()));
        RouteSnapshot { routes: Arc::new(routes) }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve a request to at most one route (§4.2 algorithm).
    pub fn resolve(&self, host: &str, path: &str, method: &Method) -> Option<Route> {
        let mut candidates: Vec<&Route> = self
            .routes
            .iter()
            .filter(|r| r.host_matches(host) && r.path_matches(path) && r.method_matches(method))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        // Group by host class (already true by construction) then by path
        // class, keeping only the most specific path class present.
        let best_host_class = candidates.iter().map(|r| r.host_class()).min().unwrap();
        candidates.retain(|r| r.host_class() == best_host_class);

        let best_path_class = candidates.iter().map(|r| r.path_class_rank()).min().unwrap();
        candidates.retain(|r| r.path_class_rank() == best_path_class);

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.specificity(path).cmp(&a.specificity(path)))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.first().map(|r| (*r).clone())
    }
}

/// Holds the currently-published snapshot behind a short-lived write lock;
/// readers clone the `Arc` out and never block each other.
pub struct RouteTable {
    current: RwLock<RouteSnapshot>,
}

impl RouteTable {
    pub fn new(snapshot: RouteSnapshot) -> Self {
        RouteTable { current: RwLock::new(snapshot) }
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        self.current.read().unwrap().clone()
    }

    pub fn publish(&self, snapshot: RouteSnapshot) {
        *self.current.write().unwrap() = snapshot;
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        RouteTable::new(RouteSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, host: &str, path: PathMatch, priority: i32) -> Route {
        Route {
            id: id.into(),
            host: host.into(),
            path,
            methods: vec![],
            priority,
            target_service: Some("svc".into()),
            target_upstream: None,
            filter_chain_id: None,
            security_config_id: None,
            retry_non_idempotent: false,
        }
    }

    #[test]
    fn exact_host_beats_wildcard_and_any() {
        let snap = RouteSnapshot::new(vec![
            route("r1", "*", PathMatch::Prefix { value: "/".into() }, 10),
            route("r2", "*.example.com", PathMatch::Prefix { value: "/".into() }, 10),
            route("r3", "api.example.com", PathMatch::Prefix { value: "/".into() }, 10),
        ]);
        let matched = snap.resolve("api.example.com", "/x", &Method::GET).unwrap();
        assert_eq!(matched.id, "r3");
    }

    #[test]
    fn exact_path_beats_prefix() {
        let snap = RouteSnapshot::new(vec![
            route("prefix", "a.io", PathMatch::Prefix { value: "/api".into() }, 5),
            route("exact", "a.io", PathMatch::Exact { value: "/api".into() }, 5),
        ]);
        let matched = snap.resolve("a.io", "/api", &Method::GET).unwrap();
        assert_eq!(matched.id, "exact");
    }

    #[test]
    fn priority_ascending_wins_ties() {
        let snap = RouteSnapshot::new(vec![
            route("low-pri", "a.io", PathMatch::Prefix { value: "/".into() }, 20),
            route("high-pri", "a.io", PathMatch::Prefix { value: "/".into() }, 1),
        ]);
        let matched = snap.resolve("a.io", "/anything", &Method::GET).unwrap();
        assert_eq!(matched.id, "high-pri");
    }

    #[test]
    fn method_mismatch_excludes_route() {
        let mut r = route("post-only", "a.io", PathMatch::Exact { value: "/x".into() }, 1);
        r.methods = vec!["POST".into()];
        let snap = RouteSnapshot::new(vec![r]);
        assert!(snap.resolve("a.io", "/x", &Method::GET).is_none());
        assert!(snap.resolve("a.io", "/x", &Method::POST).is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let snap = RouteSnapshot::new(vec![route("r1", "a.io", PathMatch::Exact { value: "/x".into() }, 1)]);
        assert!(snap.resolve("b.io", "/x", &Method::GET).is_none());
    }

    #[test]
    fn snapshot_publish_is_atomic_swap() {
        let table = RouteTable::new(RouteSnapshot::new(vec![route("r1", "a.io", PathMatch::Exact { value: "/x".into() }, 1)]));
        let before = table.snapshot();
        table.publish(RouteSnapshot::new(vec![route("r2", "a.io", PathMatch::Exact { value: "/y".into() }, 1)]));
        assert!(before.resolve("a.io", "/x", &Method::GET).is_some());
        let after = table.snapshot();
        assert!(after.resolve("a.io", "/x", &Method::GET).is_none());
        assert!(after.resolve("a.io", "/y", &Method::GET).is_some());
    }
}
