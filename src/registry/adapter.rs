//! External service-backend adapters (Nacos/Consul/Eureka/ETCD/ZooKeeper).
//!
//! Each backend is polled on its own interval and reconciled into the
//! in-process [`Registry`](super::Registry) as a set of `ServiceInstance`s
//! carrying `temp_instance = true`, so the heartbeat sweeper never purges
//! an instance the backend itself still reports, and a backend outage
//! degrades to "last known snapshot" rather than an immediate purge.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{HealthStatus, InstanceStatus, ServiceInstance, ServiceKey};
use crate::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Nacos,
    Consul,
    Eureka,
    Etcd,
    ZooKeeper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub endpoints: Vec<String>,
    pub namespace: Option<String>,
    pub poll_interval: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A pluggable read-through source of service instances. Implementations
/// translate the backend's native instance list into `ServiceInstance`s;
/// they never write back to the backend.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    async fn fetch_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>>;
}

/// HTTP-polling adapter shared by the simpler key/value-style backends
/// (Nacos's `/nacos/v1/ns/instance/list`, Consul's
/// `/v1/health/service/<name>`, Eureka's `/eureka/apps/<name>`). Each
/// backend's response shape differs, so `parse` is backend-specific while
/// the polling/HTTP plumbing is shared. ETCD/ZooKeeper have no plain-HTTP
/// instance-list endpoint (they're watch/tree clients), so they always
/// report an empty snapshot here.
pub struct HttpPollingAdapter {
    pub cfg: BackendConfig,
    client: reqwest::Client,
}

impl HttpPollingAdapter {
    pub fn new(cfg: BackendConfig) -> Self {
        HttpPollingAdapter { cfg, client: reqwest::Client::new() }
    }

    fn endpoint_for(&self, key: &ServiceKey) -> Option<String> {
        let base = self.cfg.endpoints.first()?;
        Some(match self.cfg.kind {
            BackendKind::Nacos => format!("{base}/nacos/v1/ns/instance/list?serviceName={}", key.service),
            BackendKind::Consul => format!("{base}/v1/health/service/{}", key.service),
            BackendKind::Eureka => format!("{base}/eureka/apps/{}", key.service),
            BackendKind::Etcd | BackendKind::ZooKeeper => return None,
        })
    }
}

#[async_trait]
impl RegistryAdapter for HttpPollingAdapter {
    async fn fetch_instances(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>> {
        let Some(url) = self.endpoint_for(key) else {
            // ETCD/ZooKeeper use a watch/tree client rather than plain HTTP
            // polling; not wired up yet, so report an empty snapshot.
            return Ok(Vec::new());
        };
        let mut req = self.client.get(&url).timeout(Duration::from_secs(5));
        if self.cfg.kind == BackendKind::Eureka {
            req = req.header(http::header::ACCEPT, "application/json");
        }
        let resp = req.send().await.map_err(|e| crate::Error::upstream_unavailable(format!("registry backend: {e}")))?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), %url, "registry backend returned non-success");
            return Ok(Vec::new());
        }
        let body = resp.text().await.map_err(|e| crate::Error::upstream_unavailable(format!("registry backend body: {e}")))?;
        let instances = match self.cfg.kind {
            BackendKind::Nacos => parse_nacos(&body)?,
            BackendKind::Consul => parse_consul(&body)?,
            BackendKind::Eureka => parse_eureka(&body)?,
            BackendKind::Etcd | BackendKind::ZooKeeper => Vec::new(),
        };
        Ok(instances)
    }
}

fn parse_err(kind: &str, e: serde_json::Error) -> crate::Error {
    crate::Error::upstream_bad_gateway(format!("{kind} response: {e}"))
}

fn new_instance(id: String, host: String, port: u16, healthy: bool, weight: u32, metadata: HashMap<String, String>) -> ServiceInstance {
    let now = Utc::now();
    ServiceInstance {
        id,
        host,
        port,
        context_path: String::new(),
        weight,
        instance_status: InstanceStatus::Up,
        health_status: if healthy { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
        register_time: now,
        last_heartbeat: now,
        failure_count: 0,
        metadata,
        temp_instance: true,
        soft_down_until: None,
    }
}

#[derive(Debug, Deserialize)]
struct NacosListResponse {
    #[serde(default)]
    hosts: Vec<NacosHost>,
}

#[derive(Debug, Deserialize)]
struct NacosHost {
    ip: String,
    port: u16,
    #[serde(default)]
    weight: f64,
    #[serde(default)]
    healthy: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn parse_nacos(body: &str) -> Result<Vec<ServiceInstance>> {
    let parsed: NacosListResponse = serde_json::from_str(body).map_err(|e| parse_err("nacos", e))?;
    Ok(parsed
        .hosts
        .into_iter()
        .map(|h| new_instance(format!("{}:{}", h.ip, h.port), h.ip.clone(), h.port, h.healthy, h.weight.max(0.0) as u32, h.metadata))
        .collect())
}

#[derive(Debug, Deserialize)]
struct ConsulEntry {
    #[serde(rename = "Service")]
    service: ConsulService,
    #[serde(rename = "Checks", default)]
    checks: Vec<ConsulCheck>,
}

#[derive(Debug, Deserialize)]
struct ConsulService {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Weights", default)]
    weights: Option<ConsulWeights>,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ConsulWeights {
    #[serde(rename = "Passing", default)]
    passing: u32,
}

#[derive(Debug, Deserialize)]
struct ConsulCheck {
    #[serde(rename = "Status")]
    status: String,
}

fn parse_consul(body: &str) -> Result<Vec<ServiceInstance>> {
    let parsed: Vec<ConsulEntry> = serde_json::from_str(body).map_err(|e| parse_err("consul", e))?;
    Ok(parsed
        .into_iter()
        .map(|e| {
            let healthy = e.checks.iter().all(|c| c.status == "passing");
            let weight = e.service.weights.as_ref().map(|w| w.passing).unwrap_or(1).max(1);
            new_instance(format!("{}:{}", e.service.address, e.service.port), e.service.address.clone(), e.service.port, healthy, weight, e.service.meta)
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct EurekaApplications {
    application: Option<EurekaApplication>,
}

#[derive(Debug, Deserialize)]
struct EurekaApplication {
    #[serde(default)]
    instance: Vec<EurekaInstance>,
}

#[derive(Debug, Deserialize)]
struct EurekaInstance {
    #[serde(rename = "instanceId", default)]
    instance_id: String,
    #[serde(rename = "ipAddr")]
    ip_addr: String,
    port: EurekaPort,
    status: String,
}

#[derive(Debug, Deserialize)]
struct EurekaPort {
    #[serde(rename = "$")]
    value: u16,
}

fn parse_eureka(body: &str) -> Result<Vec<ServiceInstance>> {
    let parsed: EurekaApplications = serde_json::from_str(body).map_err(|e| parse_err("eureka", e))?;
    let Some(app) = parsed.application else {
        return Ok(Vec::new());
    };
    Ok(app
        .instance
        .into_iter()
        .map(|i| {
            let healthy = i.status == "UP";
            let id = if i.instance_id.is_empty() { format!("{}:{}", i.ip_addr, i.port.value) } else { i.instance_id };
            new_instance(id, i.ip_addr.clone(), i.port.value, healthy, 1, HashMap::new())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nacos_endpoint_shape() {
        let cfg = BackendConfig {
            kind: BackendKind::Nacos,
            endpoints: vec!["http://127.0.0.1:8848".into()],
            namespace: None,
            poll_interval: Duration::from_secs(5),
            username: None,
            password: None,
        };
        let adapter = HttpPollingAdapter::new(cfg);
        let key = ServiceKey { tenant: "t".into(), namespace: "n".into(), group: "g".into(), service: "svc".into() };
        assert_eq!(adapter.endpoint_for(&key).unwrap(), "http://127.0.0.1:8848/nacos/v1/ns/instance/list?serviceName=svc");
    }

    #[test]
    fn etcd_has_no_http_endpoint() {
        let cfg = BackendConfig {
            kind: BackendKind::Etcd,
            endpoints: vec!["http://127.0.0.1:2379".into()],
            namespace: None,
            poll_interval: Duration::from_secs(5),
            username: None,
            password: None,
        };
        let adapter = HttpPollingAdapter::new(cfg);
        let key = ServiceKey { tenant: "t".into(), namespace: "n".into(), group: "g".into(), service: "svc".into() };
        assert!(adapter.endpoint_for(&key).is_none());
    }

    #[test]
    fn nacos_body_parses_into_instances() {
        let body = r#"{"hosts":[{"ip":"10.0.0.1","port":8080,"weight":2.0,"healthy":true,"metadata":{"zone":"a"}},
                                  {"ip":"10.0.0.2","port":8080,"weight":1.0,"healthy":false,"metadata":{}}]}"#;
        let instances = parse_nacos(body).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].host, "10.0.0.1");
        assert_eq!(instances[0].weight, 2);
        assert_eq!(instances[0].health_status, HealthStatus::Healthy);
        assert_eq!(instances[1].health_status, HealthStatus::Unhealthy);
        assert!(instances[0].temp_instance);
    }

    #[test]
    fn consul_body_marks_unhealthy_when_any_check_fails() {
        let body = r#"[{"Service":{"Address":"10.0.0.1","Port":9000,"Meta":{}},"Checks":[{"Status":"passing"},{"Status":"critical"}]}]"#;
        let instances = parse_consul(body).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].health_status, HealthStatus::Unhealthy);
    }

    #[test]
    fn eureka_body_parses_instances_by_status() {
        let body = r#"{"application":{"instance":[
            {"instanceId":"svc-1","ipAddr":"10.0.0.1","port":{"$":8080,"@enabled":"true"},"status":"UP"},
            {"instanceId":"svc-2","ipAddr":"10.0.0.2","port":{"$":8080,"@enabled":"true"},"status":"DOWN"}
        ]}}"#;
        let instances = parse_eureka(body).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].health_status, HealthStatus::Healthy);
        assert_eq!(instances[1].health_status, HealthStatus::Unhealthy);
    }

    #[test]
    fn eureka_body_with_no_application_yields_empty() {
        let instances = parse_eureka(r#"{"application":null}"#).unwrap();
        assert!(instances.is_empty());
    }
}
