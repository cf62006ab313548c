//! Upstream dispatch: HTTP/HTTPS, WebSocket, and raw TCP/UDP (§4.5, C5).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::common::buffer::greedy_copy_bidirectional;
use crate::registry::ServiceInstance;
use crate::transport::websocket::WebSocketStream;
use crate::{Error, Result};

/// Hop-by-hop headers per RFC 7230 §6.1, stripped before forwarding in
/// either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub send_ms: u64,
    pub read_ms: u64,
    pub total_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig { connect_ms: 2_000, send_ms: 5_000, read_ms: 30_000, total_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub retry_count: u32,
    pub retry_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig { retry_count: 0, retry_timeout_ms: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsDispatchConfig {
    pub insecure_skip_verify: bool,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub sni_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_idle_conns: usize,
    pub idle_conn_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig { max_idle_conns: 100, idle_conn_timeout_ms: 90_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub preserve_host: bool,
    pub inject_forwarded_headers: bool,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub tls: Option<TlsDispatchConfig>,
    pub pool: PoolConfig,
    pub max_buffered_body_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            preserve_host: false,
            inject_forwarded_headers: true,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            tls: None,
            pool: PoolConfig::default(),
            max_buffered_body_bytes: 10 * 1024 * 1024,
        }
    }
}

fn idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS)
}

/// Number of dispatch attempts for `method` given `retry_count` retries
/// past the first. `force_retry` is the filter/route-level override of
/// the idempotent-methods-only gate (§4.5 scenario: POST behind an
/// idempotency key).
fn retry_attempts(force_retry: bool, method: &Method, retry_count: u32) -> u32 {
    if force_retry || idempotent(method) {
        retry_count + 1
    } else {
        1
    }
}

/// HTTP/HTTPS upstream leg built once per gateway instance and reused
/// across requests; `reqwest` owns the connection pool so `max_idle_conns`
/// / `idle_conn_timeout_ms` become pool builder knobs.
pub struct HttpDispatcher {
    client: reqwest::Client,
    cfg: DispatchConfig,
}

impl HttpDispatcher {
    pub fn new(cfg: DispatchConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.timeouts.connect_ms))
            .timeout(Duration::from_millis(cfg.timeouts.total_ms))
            .pool_max_idle_per_host(cfg.pool.max_idle_conns)
            .pool_idle_timeout(Duration::from_millis(cfg.pool.idle_conn_timeout_ms));
        if let Some(tls) = &cfg.tls {
            if tls.insecure_skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        let client = builder.build().map_err(|e| Error::internal(format!("dispatcher client build: {e}")))?;
        Ok(HttpDispatcher { client, cfg })
    }

    fn build_url(&self, instance: &ServiceInstance, scheme: &str, path: &str, query: &str) -> String {
        let base = format!("{scheme}://{}:{}", instance.host, instance.port);
        let context_path = instance.context_path.trim_end_matches('/');
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
        let path = format!("{context_path}{path}");
        if query.is_empty() {
            format!("{base}{path}")
        } else {
            format!("{base}{path}?{query}")
        }
    }

    fn forward_headers(&self, incoming: &HeaderMap, client_addr: SocketAddr, original_host: &str) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in incoming.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
        if self.cfg.inject_forwarded_headers {
            if let Ok(v) = client_addr.ip().to_string().parse() {
                out.append(HeaderName::from_static("x-forwarded-for"), v);
            }
            if let Ok(v) = original_host.parse() {
                out.append(HeaderName::from_static("x-real-ip"), v);
            }
            out.append(HeaderName::from_static("x-forwarded-proto"), "http".parse().unwrap());
        }
        out
    }

    pub async fn dispatch(
        &self,
        instance: &ServiceInstance,
        scheme: &str,
        method: Method,
        path: &str,
        query: &str,
        headers: &HeaderMap,
        client_addr: SocketAddr,
        original_host: &str,
        body: Bytes,
        force_retry: bool,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let url = self.build_url(instance, scheme, path, query);
        let fwd_headers = self.forward_headers(headers, client_addr, original_host);

        let attempts = retry_attempts(force_retry, &method, self.cfg.retry.retry_count);
        let mut last_err: Option<Error> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(self.cfg.retry.retry_timeout_ms)).await;
                debug!(%url, attempt, "retrying upstream connect");
            }
            let mut req = self.client.request(method.clone(), &url).headers(fwd_headers.clone());
            if self.cfg.preserve_host {
                req = req.header(http::header::HOST, original_host);
            }
            if !body.is_empty() {
                req = req.body(body.clone());
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let headers = resp.headers().clone();
                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| Error::upstream_unavailable(format!("reading upstream body: {e}")))?;
                    return Ok((status, headers, bytes));
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_err = Some(if e.is_timeout() {
                        Error::upstream_timeout(e.to_string())
                    } else {
                        Error::upstream_unavailable(e.to_string())
                    });
                    continue;
                }
                Err(e) => return Err(Error::upstream_bad_gateway(e.to_string())),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::upstream_unavailable("dispatch failed")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsDispatchConfig {
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub max_message_bytes: usize,
}

impl Default for WsDispatchConfig {
    fn default() -> Self {
        WsDispatchConfig { ping_interval_ms: 30_000, pong_timeout_ms: 10_000, max_message_bytes: 16 * 1024 * 1024 }
    }
}

/// Upgrades to the upstream and relays bytes bidirectionally; per-message
/// framing and ping/pong liveness belong to the already-upgraded
/// `WebSocketStream`, so this is just a cancellable raw copy.
pub async fn dispatch_websocket(
    instance: &ServiceInstance,
    path: &str,
    host_header: &str,
    connect_timeout: Duration,
    client_stream: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
) -> Result<(u64, u64)> {
    let addr = format!("{}:{}", instance.host, instance.port);
    let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::upstream_timeout(format!("connect to {addr}")))?
        .map_err(|e| Error::upstream_unavailable(format!("connect to {addr}: {e}")))?;
    crate::common::net::configure_tcp_stream(&tcp);
    let mut upstream = WebSocketStream::new(tcp);
    crate::transport::websocket::handshake(&mut upstream, host_header, path, &[])
        .await
        .map_err(|e| Error::upstream_bad_gateway(format!("ws handshake: {e}")))?;
    let mut client = client_stream;
    let (down, up) = greedy_copy_bidirectional(&mut client, &mut upstream)
        .await
        .map_err(|e| Error::upstream_unavailable(e.to_string()))?;
    Ok((down, up))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpDispatchConfig {
    pub connect_timeout_ms: u64,
    pub keepalive: bool,
    pub buffer_bytes: usize,
}

impl Default for TcpDispatchConfig {
    fn default() -> Self {
        TcpDispatchConfig { connect_timeout_ms: 2_000, keepalive: true, buffer_bytes: 32 * 1024 }
    }
}

/// Raw TCP relay to a resolved service instance; used by routes whose
/// target is a TCP service rather than an HTTP one.
pub async fn dispatch_tcp(
    instance: &ServiceInstance,
    cfg: &TcpDispatchConfig,
    mut client_stream: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
) -> Result<(u64, u64)> {
    let addr = format!("{}:{}", instance.host, instance.port);
    let mut upstream = tokio::time::timeout(Duration::from_millis(cfg.connect_timeout_ms), TcpStream::connect(&addr))
        .await
        .map_err(|_| Error::upstream_timeout(format!("connect to {addr}")))?
        .map_err(|e| Error::upstream_unavailable(format!("connect to {addr}: {e}")))?;
    if cfg.keepalive {
        crate::common::net::configure_tcp_stream(&upstream);
    }
    greedy_copy_bidirectional(&mut client_stream, &mut upstream)
        .await
        .map_err(|e| Error::upstream_unavailable(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpDispatchConfig {
    pub connect_timeout_ms: u64,
    pub flow_idle_timeout_ms: u64,
    pub buffer_bytes: usize,
}

impl Default for UdpDispatchConfig {
    fn default() -> Self {
        UdpDispatchConfig { connect_timeout_ms: 2_000, flow_idle_timeout_ms: 60_000, buffer_bytes: 64 * 1024 }
    }
}

/// Per-flow UDP relay: binds an ephemeral local socket, connects it to the
/// upstream instance, and pumps datagrams until `flow_idle_timeout_ms`
/// passes without traffic in either direction.
pub async fn dispatch_udp(
    instance: &ServiceInstance,
    cfg: &UdpDispatchConfig,
    client: Arc<UdpSocket>,
    client_addr: SocketAddr,
) -> Result<()> {
    let addr = format!("{}:{}", instance.host, instance.port);
    let upstream = UdpSocket::bind("0.0.0.0:0").await.map_err(Error::Io)?;
    tokio::time::timeout(Duration::from_millis(cfg.connect_timeout_ms), upstream.connect(&addr))
        .await
        .map_err(|_| Error::upstream_timeout(format!("connect to {addr}")))?
        .map_err(|e| Error::upstream_unavailable(format!("connect to {addr}: {e}")))?;

    let mut buf = vec![0u8; cfg.buffer_bytes];
    let idle = Duration::from_millis(cfg.flow_idle_timeout_ms);
    loop {
        tokio::select! {
            res = tokio::time::timeout(idle, client.recv_from(&mut buf)) => {
                let (n, from) = match res {
                    Ok(Ok(v)) => v,
                    Ok(Err(e)) => return Err(Error::Io(e)),
                    Err(_) => { debug!(%addr, "udp flow idle timeout"); return Ok(()); }
                };
                if from != client_addr {
                    continue;
                }
                if let Err(e) = upstream.send(&buf[..n]).await {
                    warn!(%addr, %e, "udp send to upstream failed");
                    return Err(Error::upstream_unavailable(e.to_string()));
                }
            }
            res = tokio::time::timeout(idle, upstream.recv(&mut buf)) => {
                let n = match res {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(Error::Io(e)),
                    Err(_) => { debug!(%addr, "udp flow idle timeout"); return Ok(()); }
                };
                if let Err(e) = client.send_to(&buf[..n], client_addr).await {
                    warn!(%e, "udp send to client failed");
                    return Err(Error::upstream_unavailable(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use chrono::Utc;

    fn instance() -> ServiceInstance {
        ServiceInstance {
            id: "i1".into(),
            host: "127.0.0.1".into(),
            port: 9999,
            context_path: "/".into(),
            weight: 1,
            instance_status: crate::registry::InstanceStatus::Up,
            health_status: crate::registry::HealthStatus::Healthy,
            register_time: Utc::now(),
            last_heartbeat: Utc::now(),
            failure_count: 0,
            metadata: HashMap::new(),
            temp_instance: false,
            soft_down_until: None,
        }
    }

    #[test]
    fn idempotent_methods_allow_retry() {
        assert!(idempotent(&Method::GET));
        assert!(idempotent(&Method::PUT));
        assert!(!idempotent(&Method::POST));
        assert!(!idempotent(&Method::PATCH));
    }

    #[test]
    fn retry_override_forces_retry_on_non_idempotent_method() {
        assert_eq!(retry_attempts(false, &Method::POST, 3), 1);
        assert_eq!(retry_attempts(true, &Method::POST, 3), 4);
        assert_eq!(retry_attempts(false, &Method::GET, 3), 4);
    }

    #[test]
    fn url_composition_includes_query() {
        let d = HttpDispatcher::new(DispatchConfig::default()).unwrap();
        let url = d.build_url(&instance(), "http", "/v1/things", "a=1");
        assert_eq!(url, "http://127.0.0.1:9999/v1/things?a=1");
    }

    #[test]
    fn url_composition_without_query() {
        let d = HttpDispatcher::new(DispatchConfig::default()).unwrap();
        let url = d.build_url(&instance(), "https", "things", "");
        assert_eq!(url, "https://127.0.0.1:9999/things");
    }

    #[test]
    fn url_composition_prefixes_instance_context_path() {
        let d = HttpDispatcher::new(DispatchConfig::default()).unwrap();
        let mut i = instance();
        i.context_path = "/v2".into();
        let url = d.build_url(&i, "http", "/things", "a=1");
        assert_eq!(url, "http://127.0.0.1:9999/v2/things?a=1");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let d = HttpDispatcher::new(DispatchConfig::default()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(http::header::ACCEPT, "application/json".parse().unwrap());
        let out = d.forward_headers(&headers, "127.0.0.1:1234".parse().unwrap(), "example.com");
        assert!(!out.contains_key(http::header::CONNECTION));
        assert!(out.contains_key(http::header::ACCEPT));
        assert!(out.contains_key("x-forwarded-for"));
    }
}
