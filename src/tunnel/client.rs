//! Tunnel client: connects to a tunnel server, registers local services,
//! and serves `OPEN_STREAM` requests by dialing the local endpoint (§4.11, C11).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::*;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Registering,
    Serving,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalServiceConfig {
    pub service_id: String,
    pub kind: ServiceKind,
    pub local_addr: SocketAddr,
    pub remote_port: Option<u16>,
    pub subdomain: Option<String>,
    pub custom_domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelClientConfig {
    pub client_id: String,
    pub server_addr: SocketAddr,
    pub auth_token: Option<String>,
    pub services: Vec<LocalServiceConfig>,
    pub heartbeat_interval: Duration,
    pub auto_reconnect: bool,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

pub struct TunnelClient {
    cfg: TunnelClientConfig,
}

impl TunnelClient {
    pub fn new(cfg: TunnelClientConfig) -> Self {
        TunnelClient { cfg }
    }

    /// Drives the full reciprocal state machine; on disconnect, retries
    /// up to `max_retries` with a fixed backoff when `auto_reconnect` is
    /// set, otherwise returns the terminal error.
    pub async fn run(&self) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.connect_and_serve().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !self.cfg.auto_reconnect || attempt >= self.cfg.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(attempt, max = self.cfg.max_retries, %e, "tunnel client disconnected, reconnecting");
                    tokio::time::sleep(self.cfg.retry_interval).await;
                }
            }
        }
    }

    async fn connect_and_serve(&self) -> Result<()> {
        let mut state = ClientState::Connecting;
        let socket = TcpStream::connect(self.cfg.server_addr).await.map_err(Error::Io)?;
        crate::common::net::configure_tcp_stream(&socket);
        let (mut reader, mut writer) = socket.into_split();

        write_json_frame(&mut writer, Kind::Hello, &Hello {
            client_id: self.cfg.client_id.clone(),
            version: PROTOCOL_VERSION,
            os: std::env::consts::OS.to_string(),
            declared_ip: self.cfg.server_addr.ip().to_string(),
            mac: None,
        }).await?;
        let ack_frame = read_frame(&mut reader).await?;
        let ack: HelloAck = decode_json(&ack_frame.body)?;
        if !ack.accepted {
            return Err(Error::protocol("server rejected protocol version"));
        }

        state = ClientState::Authenticating;
        if let Some(token) = &self.cfg.auth_token {
            write_json_frame(&mut writer, Kind::Auth, &Auth { token: token.clone() }).await?;
            let auth_ack_frame = read_frame(&mut reader).await?;
            let auth_ack: AuthAck = decode_json(&auth_ack_frame.body)?;
            if !auth_ack.ok {
                return Err(Error::auth_failed(auth_ack.reason.unwrap_or_else(|| "rejected".into())));
            }
        }
        state = ClientState::Connected;

        state = ClientState::Registering;
        for svc in &self.cfg.services {
            write_json_frame(&mut writer, Kind::RegisterService, &RegisterService {
                service_id: svc.service_id.clone(),
                kind: svc.kind,
                local_port: svc.local_addr.port(),
                remote_port: svc.remote_port,
                subdomain: svc.subdomain.clone(),
                custom_domain: svc.custom_domain.clone(),
            }).await?;
            let reg_ack_frame = read_frame(&mut reader).await?;
            let reg_ack: RegisterServiceAck = decode_json(&reg_ack_frame.body)?;
            if !reg_ack.ok {
                warn!(service_id = %svc.service_id, error = ?reg_ack.error, "service registration rejected");
            } else {
                info!(service_id = %svc.service_id, remote_port = ?reg_ack.remote_port, vhost = ?reg_ack.vhost, "service registered");
            }
        }
        state = ClientState::Serving;
        debug!(?state, "tunnel client entering serving state");

        let heartbeat_interval = self.cfg.heartbeat_interval;
        // `out_tx` carries both heartbeats and outbound DATA frames; only
        // this loop owns `writer`, so every other task hands it frames
        // through this channel instead of writing directly.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let streams: Arc<DashMap<u64, mpsc::Sender<Vec<u8>>>> = Arc::new(DashMap::new());

        let hb_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                let ts = chrono::Utc::now().timestamp();
                if let Ok(frame) = encode_json_frame(Kind::Heartbeat, &Heartbeat { ts }) {
                    if hb_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        });

        let services = self.cfg.services.clone();
        loop {
            tokio::select! {
                frame = read_frame(&mut reader) => {
                    let frame = frame?;
                    match frame.kind {
                        Kind::OpenStream => {
                            let req: OpenStream = decode_json(&frame.body)?;
                            if let Some(svc) = services.iter().find(|s| s.service_id == req.service_id) {
                                self.spawn_stream_worker(svc.local_addr, req.stream_id, out_tx.clone(), streams.clone());
                            } else {
                                warn!(service_id = %req.service_id, "OPEN_STREAM for unknown local service");
                            }
                        }
                        Kind::Data => {
                            let (stream_id, chunk) = decode_data_frame(&frame.body)?;
                            if let Some(sender) = streams.get(&stream_id) {
                                let _ = sender.send(chunk.to_vec()).await;
                            }
                        }
                        Kind::CloseStream => {
                            let req: CloseStream = decode_json(&frame.body)?;
                            streams.remove(&req.stream_id);
                        }
                        Kind::HeartbeatAck => {}
                        Kind::ErrorFrame => {
                            let err: ErrorFrame = decode_json(&frame.body)?;
                            return Err(Error::protocol(format!("server error {}: {}", err.code, err.msg)));
                        }
                        other => debug!(?other, "unhandled frame on tunnel client"),
                    }
                }
                Some(bytes) = out_rx.recv() => {
                    if writer.write_all(&bytes).await.is_err() {
                        return Err(Error::protocol("control connection write failed"));
                    }
                }
            }
        }
    }

    /// Dials the local service for one `OPEN_STREAM`, relaying bytes read
    /// from it upstream as `DATA` frames via `out_tx`, and writing bytes
    /// addressed to this `stream_id` (demuxed by the caller) back to the
    /// local connection until either side hits EOF.
    fn spawn_stream_worker(
        &self,
        local_addr: SocketAddr,
        stream_id: u64,
        out_tx: mpsc::Sender<Vec<u8>>,
        streams: Arc<DashMap<u64, mpsc::Sender<Vec<u8>>>>,
    ) {
        tokio::spawn(async move {
            let local = match TcpStream::connect(local_addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(stream_id, %e, "failed to dial local service");
                    return;
                }
            };
            let (mut read_half, mut write_half) = local.into_split();
            let (down_tx, mut down_rx) = mpsc::channel::<Vec<u8>>(64);
            streams.insert(stream_id, down_tx);

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
                        let frame = encode_data_frame(stream_id, &buf[..n]);
                        if out_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            streams.remove(&stream_id);
            writer_task.abort();
            if let Ok(close) = encode_json_frame(Kind::CloseStream, &CloseStream { stream_id, reason: CloseReason::Eof }) {
                let _ = out_tx.send(close).await;
            }
            debug!(stream_id, "local service stream closed");
        });
    }
}

fn encode_json_frame<P: Serialize>(kind: Kind, payload: &P) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let len = (body.len() + 1) as u32;
    let mut out = Vec::with_capacity(5 + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

fn encode_data_frame(stream_id: u64, chunk: &[u8]) -> Vec<u8> {
    let len = (8 + chunk.len() + 1) as u32;
    let mut out = Vec::with_capacity(5 + 8 + chunk.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(Kind::Data as u8);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(chunk);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_starts_idle_conceptually() {
        // ClientState::Idle is the pre-`run()` state; `run()` immediately
        // moves to Connecting, matching the reciprocal state machine.
        let s = ClientState::Idle;
        assert_eq!(s, ClientState::Idle);
    }

    #[tokio::test]
    async fn connect_fails_fast_when_server_absent() {
        let cfg = TunnelClientConfig {
            client_id: "c1".into(),
            server_addr: "127.0.0.1:1".parse().unwrap(),
            auth_token: None,
            services: vec![],
            heartbeat_interval: Duration::from_secs(10),
            auto_reconnect: false,
            max_retries: 0,
            retry_interval: Duration::from_millis(10),
        };
        let client = TunnelClient::new(cfg);
        assert!(client.run().await.is_err());
    }
}
