//! Gateway Instance Manager: multi-instance lifecycle, listener
//! composition, TLS contexts, and graceful shutdown (§4.8, C8).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::route::RouteTable;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRunState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub cert_path: String,
    pub key_path: String,
    pub min_version_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub listen: SocketAddr,
    pub tls: Option<TlsMaterial>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_connections: usize,
    pub graceful_shutdown_timeout: Duration,
}

/// One gateway listener plus its routing snapshot and lifecycle state.
/// `route_table` is swapped atomically on reload without dropping
/// in-flight connections, matching the route snapshot's own publish
/// semantics.
pub struct GatewayInstance {
    pub cfg: RwLock<InstanceConfig>,
    pub route_table: Arc<RouteTable>,
    state: RwLock<InstanceRunState>,
    shutdown_tx: RwLock<Option<broadcast::Sender<()>>>,
}

impl GatewayInstance {
    pub fn new(cfg: InstanceConfig, route_table: Arc<RouteTable>) -> Self {
        GatewayInstance {
            cfg: RwLock::new(cfg),
            route_table,
            state: RwLock::new(InstanceRunState::Stopped),
            shutdown_tx: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> InstanceRunState {
        *self.state.read().await
    }

    fn build_tls_acceptor(tls: &TlsMaterial) -> Result<TlsAcceptor> {
        let certs = load_certs(&tls.cert_path)?;
        let key = load_key(&tls.key_path)?;
        let mut min_versions: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12, &rustls::version::TLS13];
        if tls.min_version_only {
            min_versions = &[&rustls::version::TLS13];
        }
        let config = rustls::ServerConfig::builder_with_protocol_versions(min_versions)
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::tls(e.to_string()))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Starts accepting connections. Returns once the listener is bound;
    /// the accept loop itself runs in a spawned task so `start` composes
    /// with a manager driving several instances concurrently.
    pub async fn start<F, Fut>(&self, handle_conn: F) -> Result<()>
    where
        F: Fn(tokio::net::TcpStream, SocketAddr, Arc<RouteTable>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.state.write().await;
            if *state == InstanceRunState::Running || *state == InstanceRunState::Starting {
                return Ok(());
            }
            *state = InstanceRunState::Starting;
        }

        let cfg = self.cfg.read().await.clone();
        let listener = TcpListener::bind(cfg.listen).await.map_err(Error::Io)?;
        let tls_acceptor = match &cfg.tls {
            Some(tls) => Some(Self::build_tls_acceptor(tls)?),
            None => None,
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx.clone());
        *self.state.write().await = InstanceRunState::Running;
        info!(id = %cfg.id, addr = %cfg.listen, tls = tls_acceptor.is_some(), "gateway instance started");

        let route_table = self.route_table.clone();
        let handle_conn = Arc::new(handle_conn);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, addr) = match accepted {
                            Ok(v) => v,
                            Err(e) => { warn!(%e, "accept failed"); continue; }
                        };
                        crate::common::net::configure_tcp_stream(&stream);
                        let route_table = route_table.clone();
                        let handle_conn = handle_conn.clone();
                        tokio::spawn(async move {
                            handle_conn(stream, addr, route_table).await;
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("gateway instance stop-accepting");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Stops accepting new connections, waits up to
    /// `graceful_shutdown_timeout` for in-flight work to drain (tracked by
    /// the caller's own connection-count hook), then reports stopped
    /// regardless so a hung client can never block shutdown forever.
    pub async fn stop(&self, in_flight: impl std::future::Future<Output = ()>) -> Result<()> {
        *self.state.write().await = InstanceRunState::Stopping;
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
        let timeout = self.cfg.read().await.graceful_shutdown_timeout;
        if tokio::time::timeout(timeout, in_flight).await.is_err() {
            warn!("graceful shutdown deadline exceeded, forcing close");
        }
        *self.state.write().await = InstanceRunState::Stopped;
        Ok(())
    }

    /// Publishes a new route snapshot without restarting the listener.
    pub fn reload_routes(&self, snapshot: crate::route::RouteSnapshot) {
        self.route_table.publish(snapshot);
    }
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(Error::Io)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("reading cert {path}: {e}")))
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(Error::Io)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::tls(format!("reading key {path}: {e}")))?
        .ok_or_else(|| Error::tls(format!("no private key found in {path}")))
}

/// Owns every configured gateway instance keyed by id.
pub struct InstanceManager {
    instances: RwLock<HashMap<String, Arc<GatewayInstance>>>,
}

impl InstanceManager {
    pub fn new() -> Self {
        InstanceManager { instances: RwLock::new(HashMap::new()) }
    }

    pub async fn add(&self, instance: Arc<GatewayInstance>) {
        let id = instance.cfg.read().await.id.clone();
        self.instances.write().await.insert(id, instance);
    }

    pub async fn get(&self, id: &str) -> Option<Arc<GatewayInstance>> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<GatewayInstance>> {
        self.instances.write().await.remove(id)
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }
}

impl Default for InstanceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteSnapshot;

    fn cfg() -> InstanceConfig {
        InstanceConfig {
            id: "gw1".into(),
            listen: "127.0.0.1:0".parse().unwrap(),
            tls: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_connections: 1000,
            graceful_shutdown_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn starts_stopped_and_transitions_to_running() {
        let inst = Arc::new(GatewayInstance::new(cfg(), Arc::new(RouteTable::default())));
        assert_eq!(inst.state().await, InstanceRunState::Stopped);
        inst.start(|_s, _a, _r| async {}).await.unwrap();
        assert_eq!(inst.state().await, InstanceRunState::Running);
        inst.stop(async {}).await.unwrap();
        assert_eq!(inst.state().await, InstanceRunState::Stopped);
    }

    #[tokio::test]
    async fn manager_tracks_instances_by_id() {
        let mgr = InstanceManager::new();
        let inst = Arc::new(GatewayInstance::new(cfg(), Arc::new(RouteTable::default())));
        mgr.add(inst.clone()).await;
        assert!(mgr.get("gw1").await.is_some());
        assert_eq!(mgr.list_ids().await, vec!["gw1".to_string()]);
        mgr.remove("gw1").await;
        assert!(mgr.get("gw1").await.is_none());
    }

    #[test]
    fn reload_routes_is_atomic_publish() {
        let inst = GatewayInstance::new(cfg(), Arc::new(RouteTable::default()));
        let snapshot = RouteSnapshot::new(vec![]);
        inst.reload_routes(snapshot);
    }
}
