//! Tunnel Control Plane: accepts tunnel clients, multiplexes their
//! registered services onto public ports/vhosts (§4.10, C10).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, broadcast, Mutex};
use tracing::{debug, info, warn};

use super::protocol::*;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelServerConfig {
    pub id: String,
    pub control_bind: SocketAddr,
    pub dashboard_port: Option<u16>,
    pub vhost_http_port: Option<u16>,
    pub vhost_https_port: Option<u16>,
    pub max_clients: usize,
    pub token_auth: bool,
    pub auth_token: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_ports_per_client: usize,
    pub allow_port_range: RangeInclusive<u16>,
    pub server_domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listen,
    Handshake,
    Authed,
    Ready,
    Streaming,
    Rejected,
    Closed,
}

pub enum ControlEvent {
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String, reason: &'static str },
    ServiceRegistered { client_id: String, service_id: String, remote_port: Option<u16>, vhost: Option<String> },
    ServiceRejected { client_id: String, service_id: String, reason: String },
}

struct PortAllocator {
    range: RangeInclusive<u16>,
    taken: Mutex<std::collections::HashSet<u16>>,
}

impl PortAllocator {
    fn new(range: RangeInclusive<u16>) -> Self {
        PortAllocator { range, taken: Mutex::new(Default::default()) }
    }

    async fn allocate(&self, requested: Option<u16>) -> Option<u16> {
        let mut taken = self.taken.lock().await;
        if let Some(p) = requested {
            if self.range.contains(&p) && !taken.contains(&p) {
                taken.insert(p);
                return Some(p);
            }
            return None;
        }
        for p in self.range.clone() {
            if !taken.contains(&p) {
                taken.insert(p);
                return Some(p);
            }
        }
        None
    }

    async fn release(&self, port: u16) {
        self.taken.lock().await.remove(&port);
    }
}

struct RegisteredService {
    kind: ServiceKind,
    remote_port: Option<u16>,
    vhost: Option<String>,
    local_port: u16,
}

struct ClientSession {
    client_id: String,
    state: Mutex<SessionState>,
    services: DashMap<String, RegisteredService>,
    outgoing: mpsc::Sender<Vec<u8>>,
    last_heartbeat: Mutex<std::time::Instant>,
    /// Per-stream channel back to the public connection's write half, so
    /// `read_loop`'s `Kind::Data` arm can route inbound bytes without
    /// owning the socket itself.
    open_streams: DashMap<u64, mpsc::Sender<Vec<u8>>>,
}

/// Accepts tunnel clients on `control_bind`, validates the auth token,
/// allocates public ports/vhosts per `REGISTER_SERVICE`, and relays bytes
/// between a public connection and the client's `OPEN_STREAM`/`DATA`
/// frames. One `ControlServer` per configured tunnel server.
pub struct ControlServer {
    cfg: TunnelServerConfig,
    sessions: DashMap<String, Arc<ClientSession>>,
    vhosts: DashMap<String, String>,
    ports: Arc<PortAllocator>,
    stream_seq: AtomicU64,
    events_tx: broadcast::Sender<ControlEvent>,
}

impl ControlServer {
    pub fn new(cfg: TunnelServerConfig) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        let ports = Arc::new(PortAllocator::new(cfg.allow_port_range.clone()));
        ControlServer { cfg, sessions: DashMap::new(), vhosts: DashMap::new(), ports, stream_seq: AtomicU64::new(1), events_tx: tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events_tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.cfg.control_bind).await.map_err(Error::Io)?;
        info!(addr = %self.cfg.control_bind, "tunnel control plane listening");
        loop {
            let (socket, peer) = listener.accept().await.map_err(Error::Io)?;
            if self.sessions.len() >= self.cfg.max_clients {
                warn!(%peer, "rejecting tunnel client: max_clients reached");
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(socket, peer).await {
                    debug!(%peer, %e, "tunnel control connection ended");
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: SocketAddr) -> Result<()> {
        crate::common::net::configure_tcp_stream(&socket);
        let (mut reader, mut writer) = socket.into_split();

        let frame = read_frame(&mut reader).await?;
        if frame.kind != Kind::Hello {
            write_json_frame(&mut writer, Kind::ErrorFrame, &ErrorFrame { code: "ED00012".into(), msg: "expected HELLO".into() }).await?;
            return Ok(());
        }
        let hello: Hello = decode_json(&frame.body)?;
        if hello.version != PROTOCOL_VERSION {
            write_json_frame(&mut writer, Kind::HelloAck, &HelloAck { server_version: PROTOCOL_VERSION, accepted: false }).await?;
            return Ok(());
        }
        write_json_frame(&mut writer, Kind::HelloAck, &HelloAck { server_version: PROTOCOL_VERSION, accepted: true }).await?;

        if self.cfg.token_auth {
            let frame = read_frame(&mut reader).await?;
            if frame.kind != Kind::Auth {
                return Ok(());
            }
            let auth: Auth = decode_json(&frame.body)?;
            let ok: bool = auth.token.as_bytes().ct_eq(self.cfg.auth_token.as_bytes()).into();
            write_json_frame(&mut writer, Kind::AuthAck, &AuthAck { ok, reason: if ok { None } else { Some("invalid token".into()) } }).await?;
            if !ok {
                return Ok(());
            }
        }

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
        let session = Arc::new(ClientSession {
            client_id: hello.client_id.clone(),
            state: Mutex::new(SessionState::Ready),
            services: DashMap::new(),
            outgoing: tx,
            last_heartbeat: Mutex::new(std::time::Instant::now()),
            open_streams: DashMap::new(),
        });
        self.sessions.insert(hello.client_id.clone(), session.clone());
        let _ = self.events_tx.send(ControlEvent::ClientConnected { client_id: hello.client_id.clone() });

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(bytes) = rx.recv().await {
                use tokio::io::AsyncWriteExt;
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let heartbeat_timeout = self.cfg.heartbeat_timeout;
        let hb_session = session.clone();
        let hb_self = self.clone();
        let hb_client_id = hello.client_id.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_timeout / 2);
            loop {
                ticker.tick().await;
                let last = *hb_session.last_heartbeat.lock().await;
                if last.elapsed() > heartbeat_timeout {
                    warn!(client_id = %hb_client_id, "heartbeat timeout, tearing down session");
                    hb_self.teardown(&hb_client_id, "heartbeat_timeout").await;
                    break;
                }
            }
        });

        let result = self.clone().read_loop(session.clone(), &mut reader).await;
        sweeper.abort();
        self.teardown(&hello.client_id, "connection_closed").await;
        writer_task.abort();
        result
    }

    async fn read_loop(self: Arc<Self>, session: Arc<ClientSession>, reader: &mut (impl AsyncRead + Unpin)) -> Result<()> {
        loop {
            let frame = read_frame(reader).await?;
            match frame.kind {
                Kind::Heartbeat => {
                    let hb: Heartbeat = decode_json(&frame.body)?;
                    *session.last_heartbeat.lock().await = std::time::Instant::now();
                    let ack = encode_frame(Kind::HeartbeatAck, &HeartbeatAck { ts: hb.ts })?;
                    let _ = session.outgoing.send(ack).await;
                }
                Kind::RegisterService => {
                    let req: RegisterService = decode_json(&frame.body)?;
                    self.register_service(&session, req).await?;
                }
                Kind::UnregisterService => {
                    let req: UnregisterService = decode_json(&frame.body)?;
                    self.unregister_service(&session, &req.service_id).await;
                }
                Kind::CloseStream => {
                    let req: CloseStream = decode_json(&frame.body)?;
                    session.open_streams.remove(&req.stream_id);
                    debug!(stream_id = req.stream_id, reason = ?req.reason, "client closed stream");
                }
                Kind::Data => {
                    let (stream_id, chunk) = decode_data_frame(&frame.body)?;
                    if let Some(sender) = session.open_streams.get(&stream_id) {
                        let _ = sender.send(chunk.to_vec()).await;
                    }
                }
                other => {
                    debug!(?other, "unhandled frame kind on control channel");
                }
            }
        }
    }

    async fn register_service(&self, session: &Arc<ClientSession>, req: RegisterService) -> Result<()> {
        if session.services.len() >= self.cfg.max_ports_per_client {
            let ack = encode_frame(Kind::RegisterServiceAck, &RegisterServiceAck {
                service_id: req.service_id.clone(), ok: false, remote_port: None, vhost: None,
                error: Some("maxPortsPerClient exceeded".into()),
            })?;
            let _ = session.outgoing.send(ack).await;
            let _ = self.events_tx.send(ControlEvent::ServiceRejected { client_id: session.client_id.clone(), service_id: req.service_id, reason: "maxPortsPerClient".into() });
            return Ok(());
        }

        match req.kind {
            ServiceKind::Tcp | ServiceKind::Udp => {
                let Some(port) = self.ports.allocate(req.remote_port).await else {
                    let ack = encode_frame(Kind::RegisterServiceAck, &RegisterServiceAck {
                        service_id: req.service_id.clone(), ok: false, remote_port: None, vhost: None,
                        error: Some("no free port in allow range".into()),
                    })?;
                    let _ = session.outgoing.send(ack).await;
                    let _ = self.events_tx.send(ControlEvent::ServiceRejected { client_id: session.client_id.clone(), service_id: req.service_id, reason: "port_range_exhausted".into() });
                    return Ok(());
                };
                session.services.insert(req.service_id.clone(), RegisteredService {
                    kind: req.kind, remote_port: Some(port), vhost: None, local_port: req.local_port,
                });
                let ack = encode_frame(Kind::RegisterServiceAck, &RegisterServiceAck {
                    service_id: req.service_id.clone(), ok: true, remote_port: Some(port), vhost: None, error: None,
                })?;
                let _ = session.outgoing.send(ack).await;
                let _ = self.events_tx.send(ControlEvent::ServiceRegistered {
                    client_id: session.client_id.clone(), service_id: req.service_id.clone(), remote_port: Some(port), vhost: None,
                });
                self.spawn_public_listener(session.clone(), req.service_id, port).await?;
            }
            ServiceKind::Http | ServiceKind::Https => {
                let vhost = req.custom_domain.clone().unwrap_or_else(|| {
                    format!("{}.{}", req.subdomain.clone().unwrap_or_else(|| req.service_id.clone()), self.cfg.server_domain)
                });
                if self.vhosts.contains_key(&vhost) {
                    let ack = encode_frame(Kind::RegisterServiceAck, &RegisterServiceAck {
                        service_id: req.service_id.clone(), ok: false, remote_port: None, vhost: Some(vhost.clone()),
                        error: Some("vhost collision".into()),
                    })?;
                    let _ = session.outgoing.send(ack).await;
                    let _ = self.events_tx.send(ControlEvent::ServiceRejected { client_id: session.client_id.clone(), service_id: req.service_id, reason: "vhost_collision".into() });
                    return Ok(());
                }
                self.vhosts.insert(vhost.clone(), session.client_id.clone());
                session.services.insert(req.service_id.clone(), RegisteredService {
                    kind: req.kind, remote_port: None, vhost: Some(vhost.clone()), local_port: req.local_port,
                });
                let ack = encode_frame(Kind::RegisterServiceAck, &RegisterServiceAck {
                    service_id: req.service_id.clone(), ok: true, remote_port: None, vhost: Some(vhost.clone()), error: None,
                })?;
                let _ = session.outgoing.send(ack).await;
                let _ = self.events_tx.send(ControlEvent::ServiceRegistered {
                    client_id: session.client_id.clone(), service_id: req.service_id.clone(), remote_port: None, vhost: Some(vhost),
                });
            }
            ServiceKind::Stcp | ServiceKind::Sudp | ServiceKind::Xtcp => {
                // Peer-rendezvous services don't allocate a public listener;
                // the server only records them for peer lookup by secret key.
                session.services.insert(req.service_id.clone(), RegisteredService {
                    kind: req.kind, remote_port: None, vhost: None, local_port: req.local_port,
                });
                let ack = encode_frame(Kind::RegisterServiceAck, &RegisterServiceAck {
                    service_id: req.service_id.clone(), ok: true, remote_port: None, vhost: None, error: None,
                })?;
                let _ = session.outgoing.send(ack).await;
            }
        }
        Ok(())
    }

    async fn unregister_service(&self, session: &Arc<ClientSession>, service_id: &str) {
        if let Some((_, svc)) = session.services.remove(service_id) {
            if let Some(port) = svc.remote_port {
                self.ports.release(port).await;
            }
            if let Some(vhost) = svc.vhost {
                self.vhosts.remove(&vhost);
            }
        }
    }

    /// Binds the public TCP listener for a registered `tcp`/`udp` service
    /// and, for each accepted connection, opens a stream to the client and
    /// relays bytes until either side closes.
    async fn spawn_public_listener(self: &Arc<Self>, session: Arc<ClientSession>, service_id: String, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(Error::Io)?;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let (public_conn, addr) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => { warn!(%e, "public listener accept failed"); break; }
                };
                let stream_id = this.stream_seq.fetch_add(1, Ordering::SeqCst);
                let open = match encode_frame(Kind::OpenStream, &OpenStream { stream_id, service_id: service_id.clone(), remote_addr: addr.to_string() }) {
                    Ok(f) => f,
                    Err(_) => continue,
                };
                if session.outgoing.send(open).await.is_err() {
                    break;
                }
                let this = this.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    this.relay_public_connection(session, stream_id, public_conn).await;
                });
            }
        });
        Ok(())
    }

    /// Bridges one public TCP connection and the client-side `DATA`
    /// stream it was opened for. Splits the connection so `read_loop`'s
    /// `Kind::Data` arm can forward inbound bytes to the write half
    /// through `open_streams` while this task drives the other
    /// direction, encoding everything it reads into `DATA` frames.
    async fn relay_public_connection(&self, session: Arc<ClientSession>, stream_id: u64, public_conn: impl AsyncRead + AsyncWrite + Unpin + Send + 'static) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut read_half, mut write_half) = tokio::io::split(public_conn);
        let (down_tx, mut down_rx) = mpsc::channel::<Vec<u8>>(64);
        session.open_streams.insert(stream_id, down_tx);

        let writer_task = tokio::spawn(async move {
            while let Some(chunk) = down_rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(frame) = encode_data_frame(stream_id, &buf[..n]) {
                        if session.outgoing.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        session.open_streams.remove(&stream_id);
        writer_task.abort();
        if let Ok(close) = encode_frame(Kind::CloseStream, &CloseStream { stream_id, reason: CloseReason::Eof }) {
            let _ = session.outgoing.send(close).await;
        }
    }

    async fn teardown(&self, client_id: &str, reason: &'static str) {
        if let Some((_, session)) = self.sessions.remove(client_id) {
            for entry in session.services.iter() {
                if let Some(port) = entry.value().remote_port {
                    self.ports.release(port).await;
                }
                if let Some(vhost) = &entry.value().vhost {
                    self.vhosts.remove(vhost);
                }
            }
            let _ = self.events_tx.send(ControlEvent::ClientDisconnected { client_id: client_id.to_string(), reason });
        }
    }
}

fn encode_frame<P: Serialize>(kind: Kind, payload: &P) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let len = (body.len() + 1) as u32;
    let mut out = Vec::with_capacity(5 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_data_frame(stream_id: u64, chunk: &[u8]) -> Result<Vec<u8>> {
    let len = (8 + chunk.len() + 1) as u32;
    let mut out = Vec::with_capacity(5 + 8 + chunk.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(Kind::Data as u8);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(chunk);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg(bind: SocketAddr) -> TunnelServerConfig {
        TunnelServerConfig {
            id: "srv1".into(),
            control_bind: bind,
            dashboard_port: None,
            vhost_http_port: None,
            vhost_https_port: None,
            max_clients: 10,
            token_auth: true,
            auth_token: "secret-token".into(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            max_ports_per_client: 5,
            allow_port_range: 9000..=9100,
            server_domain: "tunnels.example.com".into(),
        }
    }

    #[test]
    fn port_allocator_respects_range() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let alloc = PortAllocator::new(9000..=9001);
            let a = alloc.allocate(None).await.unwrap();
            let b = alloc.allocate(None).await.unwrap();
            assert!(alloc.allocate(None).await.is_none());
            assert_ne!(a, b);
            alloc.release(a).await;
            assert_eq!(alloc.allocate(None).await, Some(a));
        });
    }

    #[test]
    fn requested_port_outside_range_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let alloc = PortAllocator::new(9000..=9100);
            assert!(alloc.allocate(Some(12345)).await.is_none());
            assert_eq!(alloc.allocate(Some(9050)).await, Some(9050));
        });
    }

    #[tokio::test]
    async fn scenario_6_tcp_service_gets_port_from_range_and_pings_back() {
        use crate::tunnel::client::{LocalServiceConfig, TunnelClient, TunnelClientConfig};

        let control_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(control_addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);

        let cfg = test_cfg(bound);
        let server = Arc::new(ControlServer::new(cfg.clone()));
        let mut events = server.subscribe();
        let server_run = server.clone();
        tokio::spawn(async move {
            let _ = server_run.run().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Local echo service: answers "PING\n" with "PONG\n" on the same connection.
        let local_echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_echo.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = local_echo.accept().await {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 64];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if &buf[..n] == b"PING\n" && sock.write_all(b"PONG\n").await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        let client_cfg = TunnelClientConfig {
            client_id: "client-1".into(),
            server_addr: bound,
            auth_token: Some(cfg.auth_token.clone()),
            services: vec![LocalServiceConfig {
                service_id: "svc-tcp".into(),
                kind: ServiceKind::Tcp,
                local_addr,
                remote_port: Some(9001),
                subdomain: None,
                custom_domain: None,
            }],
            heartbeat_interval: Duration::from_secs(5),
            auto_reconnect: false,
            max_retries: 0,
            retry_interval: Duration::from_millis(10),
        };
        let client = TunnelClient::new(client_cfg);
        tokio::spawn(async move {
            let _ = client.run().await;
        });

        assert!(matches!(events.recv().await.unwrap(), ControlEvent::ClientConnected { .. }));
        match events.recv().await.unwrap() {
            ControlEvent::ServiceRegistered { remote_port, .. } => assert_eq!(remote_port, Some(9001)),
            _ => panic!("expected ServiceRegistered event"),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut public_conn = TcpStream::connect(("127.0.0.1", 9001)).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        public_conn.write_all(b"PING\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), public_conn.read(&mut buf))
            .await
            .expect("timed out waiting for PONG through the tunnel")
            .unwrap();
        assert_eq!(&buf[..n], b"PONG\n");
    }
}
