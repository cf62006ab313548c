//! gateway-core: a multi-tenant API gateway with an embedded
//! reverse-tunneling subsystem.
//!
//! # Architecture
//!
//! ```text
//!                     +----------------+
//!                     |  admin/ (hub)  |
//!                     +-------+--------+
//!                             |
//!        +--------------------+--------------------+
//!        |                    |                    |
//! +------v------+     +-------v-------+    +------v------+
//! |   config/   |     |   logpipe/    |    |   tunnel/   |
//! +-------------+     +---------------+    +------+------+
//!                                                 |
//!        +----------------------------------------+
//!        |                    |                   |
//! +------v------+     +-------v-------+   +------v------+
//! | context/    |     |   filter/     |   |  security/  |
//! |  route/     |     |               |   |             |
//! +------+------+     +---------------+   +-------------+
//!        |
//! +------v------+     +---------------+
//! | dispatcher/ |     |   registry/   |
//! | (+balancer) |     |               |
//! +-------------+     +---------------+
//! ```

pub mod admin;
pub mod balancer;
pub mod common;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod filter;
pub mod instance;
pub mod logpipe;
pub mod registry;
pub mod route;
pub mod security;
pub mod transport;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{info, warn};

use context::{Context, MiddlewareStack};
use filter::FilterChain;
use logpipe::{AccessLogRecord, LogPipeline, LogSink};
use registry::{InstanceFilter, Registry, ServiceInstance, ServiceKey};
use route::RouteTable;
use security::SecurityMiddleware;

pub const VERSION: &str = "0.1.0";

/// Ties every component together: the config store, the live service
/// registry, the per-instance listeners, and the access-log pipeline. An
/// instance's connection handler, built by [`Gateway::connection_handler`],
/// is what `instance::GatewayInstance::start` actually drives per socket.
pub struct Gateway {
    pub config: Arc<RwLock<Config>>,
    pub registry: Arc<Registry>,
    pub instances: Arc<instance::InstanceManager>,
    pub log_pipeline: Arc<LogPipeline>,
    dispatcher: Arc<dispatcher::HttpDispatcher>,
    /// One balancer per logical service, kept across requests so
    /// round-robin cursors, smooth-WRR weights, and least-connections
    /// counters actually persist instead of resetting every dispatch.
    balancers: dashmap::DashMap<ServiceKey, Arc<balancer::Balancer>>,
}

impl Gateway {
    pub async fn new(config: Config) -> Result<Self> {
        info!("initializing gateway-core");
        let registry = Arc::new(Registry::new());
        for record in &config.services {
            registry.register_service(record.clone());
        }

        let sink: Arc<dyn LogSink> = Arc::new(logpipe::TracingSink { backend_name: "access-log" });
        let log_pipeline = Arc::new(LogPipeline::new(config.log_pipeline.clone(), sink));

        let dispatcher = Arc::new(dispatcher::HttpDispatcher::new(config.dispatch.clone())?);

        Ok(Gateway {
            config: Arc::new(RwLock::new(config)),
            registry,
            instances: Arc::new(instance::InstanceManager::new()),
            log_pipeline,
            dispatcher,
            balancers: dashmap::DashMap::new(),
        })
    }

    pub async fn config_snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    pub async fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self.config.write().await = config;
        Ok(())
    }

    /// Starts every configured gateway instance against this gateway's
    /// connection handler.
    pub async fn start_instances(self: &Arc<Self>) -> Result<()> {
        let cfg = self.config.read().await.clone();
        for instance_cfg in &cfg.gateway_instances {
            let snapshot = route::RouteSnapshot::new(cfg.routes.clone());
            let route_table = Arc::new(RouteTable::new(snapshot));
            let inst = Arc::new(instance::GatewayInstance::new(instance_cfg.clone(), route_table));
            self.instances.add(inst.clone()).await;
            let handler = self.connection_handler();
            inst.start(handler).await?;
        }
        Ok(())
    }

    /// Builds the per-connection handler passed to
    /// `GatewayInstance::start`: accepts one TCP stream, serves it as
    /// HTTP/1.1 via `hyper`, and routes each request through matching →
    /// security → filters → dispatch, recording an access-log record per
    /// request.
    ///
    /// Known simplification: only `target_upstream` (a literal
    /// `host:port`) and `target_service` (resolved through the registry +
    /// a round-robin pick) are supported as dispatch targets; this
    /// handler does not itself upgrade WebSocket/TCP/UDP routes (those
    /// paths are exercised directly through `dispatcher::dispatch_*` from
    /// a protocol-aware listener, not this default HTTP handler).
    pub fn connection_handler(
        self: &Arc<Self>,
    ) -> impl Fn(TcpStream, SocketAddr, Arc<RouteTable>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync + 'static {
        let gateway = self.clone();
        move |stream, peer_addr, route_table| {
            let gateway = gateway.clone();
            Box::pin(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: hyper::Request<Incoming>| {
                    let gateway = gateway.clone();
                    let route_table = route_table.clone();
                    async move { gateway.handle_request(req, peer_addr, route_table).await }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await {
                    warn!(%e, "connection closed with error");
                }
            })
        }
    }

    async fn handle_request(
        &self,
        req: hyper::Request<Incoming>,
        peer_addr: SocketAddr,
        route_table: Arc<RouteTable>,
    ) -> std::result::Result<hyper::Response<Full<Bytes>>, std::convert::Infallible> {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();

        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or("").to_string();

        let mut ctx = Context::new(peer_addr, parts.method.clone(), host.clone(), path.clone(), query.clone(), parts.headers.clone());

        let snapshot = route_table.snapshot();
        ctx.route = snapshot.resolve(&host, &path, &parts.method);

        let (status, response_body) = self.run_pipeline(&mut ctx, body_bytes).await;

        let mut status = status;
        let mut response_body = response_body;
        let mut header_ops: Vec<(String, Option<String>)> = Vec::new();
        for modification in &ctx.response_modifications {
            if let Some(new_status) = modification.set_status {
                status = new_status;
            }
            for (name, value) in &modification.add_headers {
                header_ops.push((name.clone(), Some(value.clone())));
            }
            for name in &modification.remove_headers {
                header_ops.push((name.clone(), None));
            }
            if let Some(transform) = &modification.body_transform {
                response_body = Bytes::from(transform.apply(&response_body));
            }
        }

        let mut response = hyper::Response::builder().status(status);
        if let Some(headers) = response.headers_mut() {
            for (name, value) in &header_ops {
                match value {
                    Some(value) => {
                        if let (Ok(name), Ok(value)) = (http::HeaderName::from_bytes(name.as_bytes()), http::HeaderValue::from_str(value)) {
                            headers.insert(name, value);
                        }
                    }
                    None => {
                        headers.remove(name.as_str());
                    }
                }
            }
        }
        let response = response.body(Full::new(response_body.clone())).unwrap_or_else(|_| {
            hyper::Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR).body(Full::new(Bytes::new())).unwrap()
        });

        let record = AccessLogRecord {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: parts.method.to_string(),
            path,
            route_id: ctx.route.as_ref().map(|r| r.id.clone()),
            node_id: None,
            status: status.as_u16(),
            bytes_in: 0,
            bytes_out: response_body.len() as u64,
            total_ms: start.elapsed().as_millis() as u64,
            error: None,
            timestamp: chrono::Utc::now(),
        };
        self.log_pipeline.record(record).await;

        Ok(response)
    }

    async fn run_pipeline(&self, ctx: &mut Context, body: Bytes) -> (StatusCode, Bytes) {
        let route = match ctx.route.clone() {
            Some(r) => r,
            None => return (StatusCode::NOT_FOUND, Bytes::from_static(b"{\"error\":\"no matching route\"}")),
        };

        let cfg = self.config.read().await;

        if let Some(sec_id) = &route.security_config_id {
            if let Some(sec) = cfg.security_configs.iter().find(|s| &s.id == sec_id) {
                let middleware = SecurityMiddleware {
                    cors: sec.cors.clone(),
                    auth: sec.auth.clone(),
                    rate_limiter: sec.rate_limit.clone().map(|rl| Arc::new(security::ratelimit::RateLimiter::new(rl))),
                    acl: sec.acl.clone(),
                    introspection: Arc::new(security::auth::IntrospectionCache::default()),
                };
                let mut stack = MiddlewareStack::new();
                stack.push(Arc::new(middleware));
                if let Some((status, body)) = stack.run(ctx).await {
                    return (status, Bytes::from(serde_json::to_vec(&body).unwrap_or_default()));
                }
            }
        }

        let chain = FilterChain::for_chain(&cfg.filters, route.filter_chain_id.as_deref());

        if let Err(e) = chain.apply_pre(ctx) {
            return (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST), Bytes::from(e.to_string()));
        }

        let (instance, service_key) = match self.resolve_target(&route, &cfg).await {
            Ok(v) => v,
            Err(e) => return (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY), Bytes::from(e.to_string())),
        };

        let result = self
            .dispatcher
            .dispatch(
                &instance,
                "http",
                ctx.method.clone(),
                &ctx.path,
                &ctx.query,
                &ctx.headers,
                ctx.peer_addr,
                &ctx.host,
                body,
                route.retry_non_idempotent,
            )
            .await;

        chain.apply_post(ctx);

        match result {
            Ok((status, _headers, body)) => (status, body),
            Err(e) => {
                if let Some(key) = &service_key {
                    if matches!(e, Error::UpstreamUnavailable(_) | Error::UpstreamTimeout(_)) {
                        self.registry.mark_soft_down(key, &instance.host, instance.port, Duration::from_secs(30));
                    }
                }
                (StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY), Bytes::from(e.to_string()))
            }
        }
    }

    /// Returns the chosen instance and, when it came from the registry
    /// rather than a route's fixed `target_upstream`, the key it was
    /// resolved under so callers can report soft-down hints back to it.
    async fn resolve_target(&self, route: &route::Route, cfg: &Config) -> Result<(ServiceInstance, Option<ServiceKey>)> {
        if let Some(upstream) = &route.target_upstream {
            let (host, port) = upstream.rsplit_once(':').ok_or_else(|| Error::config_invalid("target_upstream must be host:port"))?;
            let port: u16 = port.parse().map_err(|_| Error::config_invalid("target_upstream has invalid port"))?;
            return Ok((
                ServiceInstance {
                    id: upstream.clone(),
                    host: host.to_string(),
                    port,
                    context_path: String::new(),
                    weight: 1,
                    instance_status: registry::InstanceStatus::Up,
                    health_status: registry::HealthStatus::Healthy,
                    register_time: chrono::Utc::now(),
                    last_heartbeat: chrono::Utc::now(),
                    failure_count: 0,
                    metadata: Default::default(),
                    temp_instance: false,
                    soft_down_until: None,
                },
                None,
            ));
        }

        let service_name = route.target_service.as_ref().ok_or_else(|| Error::not_found("route has no target"))?;
        let parts: Vec<&str> = service_name.splitn(4, '/').collect();
        let key = match parts.as_slice() {
            [tenant, namespace, group, service] => {
                ServiceKey { tenant: tenant.to_string(), namespace: namespace.to_string(), group: group.to_string(), service: service.to_string() }
            }
            _ => ServiceKey { tenant: "default".into(), namespace: "default".into(), group: "default".into(), service: service_name.clone() },
        };
        let instances = self.registry.list_instances(&key, &InstanceFilter { healthy_only: true });
        if instances.is_empty() {
            return Err(Error::upstream_unavailable(format!("no healthy instance for {service_name}")));
        }
        let strategy = cfg.default_balance_strategy;
        let balancer = self
            .balancers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(balancer::Balancer::new(strategy)))
            .clone();
        balancer.pick(&instances, None).map(|i| (i.clone(), Some(key)))
    }
}
