//! IP/UA/API/domain access-control lists, evaluated in that order (§4.4).

use std::net::IpAddr;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AclMode {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AclConfig {
    pub ip: Option<AclList>,
    pub user_agent: Option<AclList>,
    pub api: Option<AclList>,
    pub domain: Option<AclList>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclList {
    pub mode: AclMode,
    pub entries: Vec<String>,
}

fn glob_set(patterns: &[String]) -> GlobSet {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        if let Ok(g) = Glob::new(p) {
            b.add(g);
        }
    }
    b.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
}

fn ip_matches(entries: &[String], ip: IpAddr) -> bool {
    entries.iter().any(|e| e.parse::<IpNet>().map(|net| net.contains(&ip)).unwrap_or_else(|_| e.parse::<IpAddr>() == Ok(ip)))
}

/// Returns `true` when the request is allowed through this one list.
fn list_permits(list: &AclList, matched: bool) -> bool {
    match list.mode {
        AclMode::Deny => !matched,
        AclMode::Allow => matched,
    }
}

pub struct AclRequest<'a> {
    pub client_ip: IpAddr,
    pub user_agent: &'a str,
    pub api_path: &'a str,
    pub domain: &'a str,
}

/// Evaluates IP → UA → API → domain in order; the first list that denies
/// short-circuits. An allow-mode list with no match also short-circuits.
pub fn evaluate(cfg: &AclConfig, req: &AclRequest) -> bool {
    if let Some(ip_list) = &cfg.ip {
        if !list_permits(ip_list, ip_matches(&ip_list.entries, req.client_ip)) {
            return false;
        }
    }
    if let Some(ua_list) = &cfg.user_agent {
        if !list_permits(ua_list, glob_set(&ua_list.entries).is_match(req.user_agent)) {
            return false;
        }
    }
    if let Some(api_list) = &cfg.api {
        if !list_permits(api_list, glob_set(&api_list.entries).is_match(req.api_path)) {
            return false;
        }
    }
    if let Some(domain_list) = &cfg.domain {
        if !list_permits(domain_list, glob_set(&domain_list.entries).is_match(req.domain)) {
            return false;
        }
    }
    true
}
