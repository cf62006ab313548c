//! Namespace/group/service/instance model, heartbeats and health (C6).

pub mod adapter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub tenant: String,
    pub namespace: String,
    pub group: String,
    pub service: String,
}

impl ServiceKey {
    fn as_map_key(&self) -> String {
        format!("{}/{}/{}/{}", self.tenant, self.namespace, self.group, self.service)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub protocol: String,
    pub context_path: String,
    pub load_balance_strategy: String,
    pub heartbeat_timeout: Duration,
    pub purge_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub context_path: String,
    pub weight: u32,
    pub instance_status: InstanceStatus,
    pub health_status: HealthStatus,
    pub register_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub failure_count: u32,
    pub metadata: HashMap<String, String>,
    pub temp_instance: bool,
    /// Set by [`Registry::mark_soft_down`] after a dispatcher retry budget
    /// is exhausted against this instance. Distinct from `health_status`:
    /// it is a short-lived hint from the data path, not a heartbeat/health
    /// check verdict, and clears itself once the deadline passes.
    pub soft_down_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceEventKind {
    Registered,
    Deregistered,
    BecameHealthy,
    BecameUnhealthy,
    HeartbeatLost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub tenant: String,
    pub service: String,
    pub host_port: String,
    pub source: String,
    pub kind: ServiceEventKind,
    pub payload: Option<serde_json::Value>,
    pub event_time: DateTime<Utc>,
}

struct ServiceEntry {
    record: ServiceRecord,
    instances: DashMap<(String, u16), ServiceInstance>,
    /// Per-instance-id monotone sequence, enforcing invariant (3) of §4.6:
    /// events for a given instance are never delivered out of order.
    event_seq: DashMap<String, AtomicU64>,
}

pub struct InstanceFilter {
    pub healthy_only: bool,
}

/// Concurrent `(tenant, namespace, group, service)` → service mapping. The
/// mutable side (heartbeats, counters) uses per-service entries in a
/// `DashMap`, so unrelated services never contend on the same lock.
pub struct Registry {
    services: DashMap<String, Arc<ServiceEntry>>,
    events_tx: broadcast::Sender<ServiceEvent>,
}

impl Registry {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Registry { services: DashMap::new(), events_tx: tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn register_service(&self, record: ServiceRecord) {
        let key = record.key.as_map_key();
        self.services.entry(key).or_insert_with(|| {
            Arc::new(ServiceEntry { record, instances: DashMap::new(), event_seq: DashMap::new() })
        });
    }

    pub fn update_service(&self, record: ServiceRecord) {
        let key = record.key.as_map_key();
        if let Some(entry) = self.services.get(&key) {
            let new_entry = Arc::new(ServiceEntry {
                record,
                instances: entry.instances.clone(),
                event_seq: entry.event_seq.clone(),
            });
            self.services.insert(key, new_entry);
        } else {
            self.register_service(record);
        }
    }

    pub fn delete_service(&self, key: &ServiceKey) {
        self.services.remove(&key.as_map_key());
    }

    pub fn register_instance(&self, key: &ServiceKey, instance: ServiceInstance) -> Result<()> {
        let entry = self.services.get(&key.as_map_key()).ok_or_else(|| crate::Error::not_found("service"))?;
        entry.instances.insert((instance.host.clone(), instance.port), instance.clone());
        self.emit(ServiceEvent {
            tenant: key.tenant.clone(),
            service: key.service.clone(),
            host_port: format!("{}:{}", instance.host, instance.port),
            source: "internal".into(),
            kind: ServiceEventKind::Registered,
            payload: None,
            event_time: Utc::now(),
        });
        Ok(())
    }

    pub fn deregister_instance(&self, key: &ServiceKey, host: &str, port: u16) -> Result<()> {
        let entry = self.services.get(&key.as_map_key()).ok_or_else(|| crate::Error::not_found("service"))?;
        entry.instances.remove(&(host.to_string(), port));
        self.emit(ServiceEvent {
            tenant: key.tenant.clone(),
            service: key.service.clone(),
            host_port: format!("{host}:{port}"),
            source: "internal".into(),
            kind: ServiceEventKind::Deregistered,
            payload: None,
            event_time: Utc::now(),
        });
        Ok(())
    }

    fn next_seq(entry: &ServiceEntry, instance_id: &str) -> u64 {
        entry
            .event_seq
            .entry(instance_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
    }

    pub fn heartbeat(&self, key: &ServiceKey, instance_id: &str, ts: DateTime<Utc>) -> Result<()> {
        let entry = self.services.get(&key.as_map_key()).ok_or_else(|| crate::Error::not_found("service"))?;
        for mut inst in entry.instances.iter_mut() {
            if inst.id == instance_id {
                inst.last_heartbeat = ts;
                return Ok(());
            }
        }
        Err(crate::Error::not_found("instance"))
    }

    pub fn set_health(&self, key: &ServiceKey, instance_id: &str, status: HealthStatus, ts: DateTime<Utc>) -> Result<()> {
        let entry = self.services.get(&key.as_map_key()).ok_or_else(|| crate::Error::not_found("service"))?;
        let mut changed = None;
        for mut inst in entry.instances.iter_mut() {
            if inst.id == instance_id {
                if inst.health_status != status {
                    changed = Some(status);
                }
                inst.health_status = status;
                break;
            }
        }
        if let Some(new_status) = changed {
            let _ = Self::next_seq(&entry, instance_id);
            self.emit(ServiceEvent {
                tenant: key.tenant.clone(),
                service: key.service.clone(),
                host_port: instance_id.to_string(),
                source: "internal".into(),
                kind: if new_status == HealthStatus::Healthy { ServiceEventKind::BecameHealthy } else { ServiceEventKind::BecameUnhealthy },
                payload: None,
                event_time: ts,
            });
        }
        Ok(())
    }

    pub fn list_instances(&self, key: &ServiceKey, filter: &InstanceFilter) -> Vec<ServiceInstance> {
        let Some(entry) = self.services.get(&key.as_map_key()) else {
            return Vec::new();
        };
        let now = Utc::now();
        entry
            .instances
            .iter()
            .map(|r| r.value().clone())
            .filter(|i| i.soft_down_until.map(|until| until <= now).unwrap_or(true))
            .filter(|i| {
                if filter.healthy_only {
                    i.health_status == HealthStatus::Healthy && i.instance_status != InstanceStatus::Down && i.instance_status != InstanceStatus::OutOfService
                } else {
                    true
                }
            })
            .collect()
    }

    /// Hints that `host:port` should be skipped by the balancer for
    /// `ttl`, without touching `health_status` or emitting a health event.
    /// Called by the dispatcher after it exhausts its retry budget against
    /// an instance; self-heals once `ttl` elapses so a one-off outage
    /// doesn't require a heartbeat cycle to recover from.
    pub fn mark_soft_down(&self, key: &ServiceKey, host: &str, port: u16, ttl: Duration) {
        let Some(entry) = self.services.get(&key.as_map_key()) else {
            return;
        };
        if let Some(mut inst) = entry.instances.get_mut(&(host.to_string(), port)) {
            let until = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
            inst.soft_down_until = Some(until);
            debug!(%host, port, ?ttl, "instance marked soft-down after retry exhaustion");
        }
    }

    /// Background sweep: marks temp instances unhealthy past `heartbeat_timeout`,
    /// deregisters them past `purge_timeout` (§4.6, scenario 5).
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once(),
                _ = shutdown.recv() => {
                    info!("registry sweeper shutting down");
                    break;
                }
            }
        }
    }

    fn sweep_once(&self) {
        let now = Utc::now();
        for entry_ref in self.services.iter() {
            let entry = entry_ref.value();
            let mut to_purge = Vec::new();
            for mut inst in entry.instances.iter_mut() {
                if !inst.temp_instance {
                    continue;
                }
                let since_heartbeat = now.signed_duration_since(inst.last_heartbeat);
                let timeout_secs = entry.record.heartbeat_timeout.as_secs() as i64;
                let purge_secs = entry.record.purge_timeout.as_secs() as i64;
                if since_heartbeat.num_seconds() > purge_secs {
                    to_purge.push((inst.host.clone(), inst.port, inst.id.clone()));
                } else if since_heartbeat.num_seconds() > timeout_secs && inst.health_status != HealthStatus::Unhealthy {
                    inst.health_status = HealthStatus::Unhealthy;
                    let _ = Self::next_seq(entry, &inst.id);
                    self.emit(ServiceEvent {
                        tenant: entry.record.key.tenant.clone(),
                        service: entry.record.key.service.clone(),
                        host_port: format!("{}:{}", inst.host, inst.port),
                        source: "sweeper".into(),
                        kind: ServiceEventKind::HeartbeatLost,
                        payload: None,
                        event_time: now,
                    });
                    debug!(instance_id = %inst.id, "heartbeat lost");
                }
            }
            for (host, port, id) in to_purge {
                entry.instances.remove(&(host.clone(), port));
                self.emit(ServiceEvent {
                    tenant: entry.record.key.tenant.clone(),
                    service: entry.record.key.service.clone(),
                    host_port: format!("{host}:{port}"),
                    source: "sweeper".into(),
                    kind: ServiceEventKind::Deregistered,
                    payload: Some(serde_json::json!({"reason": "purge_timeout", "instance_id": id})),
                    event_time: now,
                });
                warn!(instance_id = %id, "purged temp instance past purge_timeout");
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn key() -> ServiceKey {
        ServiceKey { tenant: "t1".into(), namespace: "ns1".into(), group: "g1".into(), service: "svc1".into() }
    }

    fn record() -> ServiceRecord {
        ServiceRecord {
            key: key(),
            protocol: "http".into(),
            context_path: "/".into(),
            load_balance_strategy: "ROUND_ROBIN".into(),
            heartbeat_timeout: Duration::from_secs(10),
            purge_timeout: Duration::from_secs(3600),
        }
    }

    fn instance(id: &str, temp: bool) -> ServiceInstance {
        ServiceInstance {
            id: id.into(),
            host: "10.0.0.1".into(),
            port: 8080,
            context_path: "/".into(),
            weight: 1,
            instance_status: InstanceStatus::Up,
            health_status: HealthStatus::Healthy,
            register_time: Utc::now(),
            last_heartbeat: Utc::now(),
            failure_count: 0,
            metadata: HashMap::new(),
            temp_instance: temp,
            soft_down_until: None,
        }
    }

    #[test]
    fn register_then_deregister_restores_count() {
        let reg = Registry::new();
        reg.register_service(record());
        reg.register_instance(&key(), instance("i1", false)).unwrap();
        assert_eq!(reg.list_instances(&key(), &InstanceFilter { healthy_only: false }).len(), 1);
        reg.deregister_instance(&key(), "10.0.0.1", 8080).unwrap();
        assert_eq!(reg.list_instances(&key(), &InstanceFilter { healthy_only: false }).len(), 0);
    }

    #[test]
    fn unhealthy_excluded_from_healthy_filter() {
        let reg = Registry::new();
        reg.register_service(record());
        reg.register_instance(&key(), instance("i1", false)).unwrap();
        reg.set_health(&key(), "i1", HealthStatus::Unhealthy, Utc::now()).unwrap();
        assert!(reg.list_instances(&key(), &InstanceFilter { healthy_only: true }).is_empty());
    }

    #[test]
    fn scenario_5_heartbeat_sweep() {
        let reg = Registry::new();
        reg.register_service(record());
        let mut inst = instance("I1", true);
        let t0 = Utc::now() - ChronoDuration::seconds(11);
        inst.last_heartbeat = t0;
        reg.register_instance(&key(), inst).unwrap();

        let mut events = reg.subscribe();
        reg.sweep_once();

        let healthy = reg.list_instances(&key(), &InstanceFilter { healthy_only: true });
        assert!(healthy.is_empty());

        let mut saw_heartbeat_lost = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev.kind, ServiceEventKind::HeartbeatLost) {
                saw_heartbeat_lost = true;
            }
        }
        assert!(saw_heartbeat_lost);
    }

    #[test]
    fn soft_down_excludes_instance_until_ttl_elapses() {
        let reg = Registry::new();
        reg.register_service(record());
        reg.register_instance(&key(), instance("i1", false)).unwrap();
        reg.mark_soft_down(&key(), "10.0.0.1", 8080, Duration::from_secs(30));
        assert!(reg.list_instances(&key(), &InstanceFilter { healthy_only: false }).is_empty());

        reg.mark_soft_down(&key(), "10.0.0.1", 8080, Duration::from_secs(0));
        assert_eq!(reg.list_instances(&key(), &InstanceFilter { healthy_only: false }).len(), 1);
    }
}
