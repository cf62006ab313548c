//! Load-balancing strategies over a healthy-instance snapshot (§4.7, C7).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::registry::ServiceInstance;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastConnections,
    ConsistentHash,
}

struct WrrState {
    current_weight: i64,
}

/// Per-service balancer state. One instance is kept per logical service so
/// round-robin cursors and connection counters don't leak across services.
pub struct Balancer {
    strategy: Strategy,
    rr_cursor: AtomicUsize,
    wrr_state: DashMap<String, WrrState>,
    conn_counts: DashMap<String, AtomicU64>,
    /// Ring is rebuilt whenever the membership hash (set of instance ids)
    /// changes, so instances added/removed between dispatches are picked
    /// up without requiring a fresh `Balancer` per call.
    ring: RwLock<Option<(u64, Vec<(u64, String)>)>>,
}

const VIRTUAL_NODES_PER_INSTANCE: usize = 160;

impl Balancer {
    pub fn new(strategy: Strategy) -> Self {
        Balancer {
            strategy,
            rr_cursor: AtomicUsize::new(0),
            wrr_state: DashMap::new(),
            conn_counts: DashMap::new(),
            ring: RwLock::new(None),
        }
    }

    pub fn release(&self, instance_id: &str) {
        if let Some(counter) = self.conn_counts.get(instance_id) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn pick<'a>(&self, instances: &'a [ServiceInstance], hash_key: Option<&str>) -> Result<&'a ServiceInstance> {
        if instances.is_empty() {
            return Err(Error::upstream_unavailable("no healthy upstream instances"));
        }
        let idx = match self.strategy {
            Strategy::RoundRobin => self.rr_cursor.fetch_add(1, Ordering::SeqCst) % instances.len(),
            Strategy::WeightedRoundRobin => self.weighted_round_robin(instances),
            Strategy::Random => rand::thread_rng().gen_range(0..instances.len()),
            Strategy::LeastConnections => self.least_connections(instances),
            Strategy::ConsistentHash => self.consistent_hash(instances, hash_key.unwrap_or("")),
        };
        let chosen = &instances[idx];
        self.conn_counts.entry(chosen.id.clone()).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::SeqCst);
        Ok(chosen)
    }

    /// Smooth weighted round robin: each instance accrues its weight every
    /// round, the highest-weighted is picked, then decremented by the
    /// total weight. Converges to the exact weight ratio over a full cycle
    /// (e.g. weights 3/1 yield A,A,B,A,A,A,B,A,A,A,B,A,... across 40 picks).
    fn weighted_round_robin(&self, instances: &[ServiceInstance]) -> usize {
        let total_weight: i64 = instances.iter().map(|i| i.weight.max(1) as i64).sum();
        let mut best_idx = 0;
        let mut best_weight = i64::MIN;
        for (idx, inst) in instances.iter().enumerate() {
            let mut entry = self.wrr_state.entry(inst.id.clone()).or_insert_with(|| WrrState { current_weight: 0 });
            entry.current_weight += inst.weight.max(1) as i64;
            if entry.current_weight > best_weight {
                best_weight = entry.current_weight;
                best_idx = idx;
            }
        }
        if let Some(mut entry) = self.wrr_state.get_mut(&instances[best_idx].id) {
            entry.current_weight -= total_weight;
        }
        best_idx
    }

    fn least_connections(&self, instances: &[ServiceInstance]) -> usize {
        instances
            .iter()
            .enumerate()
            .min_by_key(|(_, inst)| {
                let count = self.conn_counts.get(&inst.id).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0);
                (count, inst.id.clone())
            })
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    fn consistent_hash(&self, instances: &[ServiceInstance], key: &str) -> usize {
        let membership_hash = membership_hash(instances);
        {
            let guard = self.ring.read().unwrap();
            if let Some((h, ring)) = guard.as_ref() {
                if *h == membership_hash {
                    return position_on_ring(ring, instances, key);
                }
            }
        }
        let ring = build_ring(instances);
        let result = position_on_ring(&ring, instances, key);
        *self.ring.write().unwrap() = Some((membership_hash, ring));
        result
    }
}

fn position_on_ring(ring: &[(u64, String)], instances: &[ServiceInstance], key: &str) -> usize {
    if ring.is_empty() {
        return 0;
    }
    let key_hash = hash_u64(key);
    let pos = ring.partition_point(|(h, _)| *h < key_hash) % ring.len();
    let target_id = &ring[pos].1;
    instances.iter().position(|i| &i.id == target_id).unwrap_or(0)
}

fn membership_hash(instances: &[ServiceInstance]) -> u64 {
    let mut ids: Vec<&str> = instances.iter().map(|i| i.id.as_str()).collect();
    ids.sort_unstable();
    let mut hasher = DefaultHasher::new();
    ids.hash(&mut hasher);
    hasher.finish()
}

fn hash_u64(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn build_ring(instances: &[ServiceInstance]) -> Vec<(u64, String)> {
    let mut ring = Vec::with_capacity(instances.len() * VIRTUAL_NODES_PER_INSTANCE);
    for inst in instances {
        for v in 0..VIRTUAL_NODES_PER_INSTANCE {
            ring.push((hash_u64(&format!("{}#{v}", inst.id)), inst.id.clone()));
        }
    }
    ring.sort_by_key(|(h, _)| *h);
    ring
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use chrono::Utc;

    fn make(id: &str, weight: u32) -> ServiceInstance {
        ServiceInstance {
            id: id.into(),
            host: "10.0.0.1".into(),
            port: 80,
            context_path: "/".into(),
            weight,
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
    fn empty_snapshot_is_no_upstream() {
        let b = Balancer::new(Strategy::RoundRobin);
        assert!(b.pick(&[], None).is_err());
    }

    #[test]
    fn round_robin_cycles_evenly() {
        let b = Balancer::new(Strategy::RoundRobin);
        let instances = vec![make("a", 1), make("b", 1)];
        let picks: Vec<_> = (0..4).map(|_| b.pick(&instances, None).unwrap().id.clone()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn scenario_4_weighted_round_robin_exact_ratio() {
        let b = Balancer::new(Strategy::WeightedRoundRobin);
        let instances = vec![make("A", 3), make("B", 1)];
        let mut sequence = Vec::new();
        for _ in 0..40 {
            sequence.push(b.pick(&instances, None).unwrap().id.clone());
        }
        let a_count = sequence.iter().filter(|s| *s == "A").count();
        let b_count = sequence.iter().filter(|s| *s == "B").count();
        assert_eq!(a_count, 30);
        assert_eq!(b_count, 10);
        assert_eq!(&sequence[..6], &["A", "A", "B", "A", "A", "A"]);
    }

    #[test]
    fn least_connections_prefers_idle_instance() {
        let b = Balancer::new(Strategy::LeastConnections);
        let instances = vec![make("a", 1), make("b", 1)];
        let first = b.pick(&instances, None).unwrap().id.clone();
        let second = b.pick(&instances, None).unwrap().id.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn consistent_hash_is_stable_for_same_key() {
        let b = Balancer::new(Strategy::ConsistentHash);
        let instances = vec![make("a", 1), make("b", 1), make("c", 1)];
        let first = b.pick(&instances, Some("user-42")).unwrap().id.clone();
        let second = b.pick(&instances, Some("user-42")).unwrap().id.clone();
        assert_eq!(first, second);
    }
}
