//! Top-level configuration: gateway instances, routes, filters, security
//! configs, the namespace/service registry, and tunnel server/client
//! definitions. Loaded via the two-step parse described in SPEC_FULL.md's
//! ambient stack section: a generic tree first, then typed structs, with
//! unknown fields retained rather than rejected.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::balancer::Strategy as BalancerStrategy;
use crate::dispatcher::DispatchConfig;
use crate::filter::Filter;
use crate::instance::InstanceConfig;
use crate::logpipe::PipelineConfig;
use crate::registry::ServiceRecord;
use crate::route::Route;
use crate::security::SecurityConfig;
use crate::tunnel::{TunnelClientConfig, TunnelServerConfig};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway_instances: Vec<InstanceConfig>,
    pub routes: Vec<Route>,
    pub filters: Vec<Filter>,
    pub security_configs: Vec<SecurityConfig>,
    pub services: Vec<ServiceRecord>,
    pub default_balance_strategy: BalancerStrategy,
    pub dispatch: DispatchConfig,
    pub log_pipeline: PipelineConfig,
    pub tunnel_servers: Vec<TunnelServerConfig>,
    pub tunnel_clients: Vec<TunnelClientConfig>,
    pub log_level: String,
    pub admin_bind: Option<std::net::SocketAddr>,

    /// Unknown top-level keys, preserved rather than rejected so a config
    /// written for a newer build still loads here.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway_instances: Vec::new(),
            routes: Vec::new(),
            filters: Vec::new(),
            security_configs: Vec::new(),
            services: Vec::new(),
            default_balance_strategy: BalancerStrategy::RoundRobin,
            dispatch: DispatchConfig::default(),
            log_pipeline: PipelineConfig::default(),
            tunnel_servers: Vec::new(),
            tunnel_clients: Vec::new(),
            log_level: "info".into(),
            admin_bind: None,
            extra: HashMap::new(),
        }
    }
}

impl Config {
    /// Two-step parse: first into a generic tree so unrecognized keys can
    /// be logged instead of hard-failing, then into the typed `Config`.
    pub fn from_str(content: &str) -> Result<Self> {
        let generic: serde_yaml::Value = serde_yaml::from_str(content)?;
        if let serde_yaml::Value::Mapping(map) = &generic {
            for key in map.keys() {
                if let serde_yaml::Value::String(k) = key {
                    if !KNOWN_TOP_LEVEL_KEYS.contains(&k.as_str()) {
                        warn!(key = %k, "unknown top-level config key, retained in `extra`");
                    }
                }
            }
        }
        let config: Config = serde_yaml::from_value(generic)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(Error::Io)?;
        Self::from_str(&content)
    }

    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(Error::Io)?;
        Self::from_str(&content)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await.map_err(Error::Io)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for sec in &self.security_configs {
            sec.validate()?;
        }
        let mut seen_route_ids = std::collections::HashSet::new();
        for route in &self.routes {
            if !seen_route_ids.insert(&route.id) {
                return Err(Error::config_invalid(format!("duplicate route id {}", route.id)));
            }
        }
        let mut seen_instance_ids = std::collections::HashSet::new();
        for inst in &self.gateway_instances {
            if !seen_instance_ids.insert(&inst.id) {
                return Err(Error::config_invalid(format!("duplicate gateway instance id {}", inst.id)));
            }
        }
        Ok(())
    }
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "gateway_instances",
    "routes",
    "filters",
    "security_configs",
    "services",
    "default_balance_strategy",
    "dispatch",
    "log_pipeline",
    "tunnel_servers",
    "tunnel_clients",
    "log_level",
    "admin_bind",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_parses_to_defaults() {
        let cfg = Config::from_str("{}").unwrap();
        assert!(cfg.routes.is_empty());
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn unknown_top_level_key_is_retained_not_rejected() {
        let cfg = Config::from_str("log_level: debug\nfuture_feature_flag: true\n").unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert!(cfg.extra.contains_key("future_feature_flag"));
    }

    #[test]
    fn duplicate_route_ids_fail_validation() {
        let yaml = r#"
routes:
  - id: r1
    host: "a.com"
    path: { kind: exact, value: "/x" }
    methods: ["GET"]
    priority: 0
    target_service: null
    target_upstream: null
    filter_chain_id: null
    security_config_id: null
  - id: r1
    host: "b.com"
    path: { kind: exact, value: "/y" }
    methods: ["GET"]
    priority: 0
    target_service: null
    target_upstream: null
    filter_chain_id: null
    security_config_id: null
"#;
        assert!(Config::from_str(yaml).is_err());
    }
}
