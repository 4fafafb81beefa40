//! # Load Balancer Module
//!
//! Selection policies used by generic clients to pick one instance from a resolved set.
//!
//! ## Load Balancing Algorithms
//!
//! 1. **Smooth Weighted Round Robin** (default): spreads calls in proportion to instance
//!    weights while interleaving them, and is deterministic for a fixed instance set and call
//!    sequence.
//! 2. **Round Robin**: ignores weights and cycles through instances.
//! 3. **Consistent Hashing**: sticky routing on the caller-provided [`RoutingHint`]; calls
//!    without a hint fall back to smooth weighted round robin.
//!
//! Callers pass only healthy instances; balancers never inspect health.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::config::LoadBalancerKind;
use crate::core::types::{RoutingHint, ServiceInstance};

/// Core trait for load balancing algorithms
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select an instance from the available pool
    ///
    /// # Returns
    /// * `Some(index)` - Index of selected instance in the instances slice
    /// * `None` - No suitable instance available
    async fn select_instance(
        &self,
        instances: &[ServiceInstance],
        hint: Option<&RoutingHint>,
    ) -> Option<usize>;

    /// Get the algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;

    /// Get current statistics for this load balancer
    async fn get_stats(&self) -> LoadBalancerStats;

    /// Reset internal state
    async fn reset(&self);
}

/// Load balancer statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: String,
    pub total_requests: u64,
    pub failed_selections: u64,
    pub instance_stats: HashMap<String, InstanceStats>,
}

/// Per-instance statistics
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub selections: u64,
    pub last_selected: Option<chrono::DateTime<chrono::Utc>>,
}

/// Counters shared by every algorithm
#[derive(Default)]
struct SelectionStats {
    per_instance: DashMap<String, InstanceStats>,
    total_requests: AtomicU64,
    failed_selections: AtomicU64,
}

impl SelectionStats {
    fn request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn failed(&self) {
        self.failed_selections.fetch_add(1, Ordering::Relaxed);
        counter!("load_balancer_failed_selections").increment(1);
    }

    fn selected(&self, instance: &ServiceInstance, algorithm: &'static str) {
        let mut stats = self
            .per_instance
            .entry(instance.id.clone())
            .or_insert_with(|| InstanceStats {
                selections: 0,
                last_selected: None,
            });
        stats.selections += 1;
        stats.last_selected = Some(chrono::Utc::now());

        counter!("load_balancer_selections", "algorithm" => algorithm).increment(1);
        debug!(
            instance_id = %instance.id,
            instance_address = %instance.address(),
            algorithm = algorithm,
            "Selected instance for load balancing"
        );
    }

    fn snapshot(&self, algorithm: &str) -> LoadBalancerStats {
        LoadBalancerStats {
            algorithm: algorithm.to_string(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_selections: self.failed_selections.load(Ordering::Relaxed),
            instance_stats: self
                .per_instance
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        }
    }

    fn clear(&self) {
        self.per_instance.clear();
        self.total_requests.store(0, Ordering::Relaxed);
        self.failed_selections.store(0, Ordering::Relaxed);
    }
}

/// Smooth weighted round robin
///
/// Every selection adds each instance's weight to its running score, picks the highest
/// score (first in slice order on ties) and subtracts the total weight from the winner.
/// Weights 5/1/1 yield `a a b a c a a` rather than `a a a a a b c`.
#[derive(Default)]
pub struct WeightedRoundRobinBalancer {
    current: Mutex<HashMap<String, i64>>,
    stats: SelectionStats,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick(&self, instances: &[ServiceInstance]) -> Option<usize> {
        let mut current = self.current.lock();
        current.retain(|id, _| instances.iter().any(|instance| &instance.id == id));

        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (index, instance) in instances.iter().enumerate() {
            let weight = i64::from(instance.weight);
            if weight == 0 {
                continue;
            }
            let score = current.entry(instance.id.clone()).or_insert(0);
            *score += weight;
            total += weight;
            if best.map_or(true, |(_, best_score)| *score > best_score) {
                best = Some((index, *score));
            }
        }

        let (index, _) = best?;
        if let Some(score) = current.get_mut(&instances[index].id) {
            *score -= total;
        }
        Some(index)
    }
}

#[async_trait]
impl LoadBalancer for WeightedRoundRobinBalancer {
    async fn select_instance(
        &self,
        instances: &[ServiceInstance],
        _hint: Option<&RoutingHint>,
    ) -> Option<usize> {
        self.stats.request();
        match self.pick(instances) {
            Some(index) => {
                self.stats.selected(&instances[index], self.algorithm_name());
                Some(index)
            }
            None => {
                self.stats.failed();
                None
            }
        }
    }

    fn algorithm_name(&self) -> &'static str {
        "weighted_round_robin"
    }

    async fn get_stats(&self) -> LoadBalancerStats {
        self.stats.snapshot(self.algorithm_name())
    }

    async fn reset(&self) {
        self.current.lock().clear();
        self.stats.clear();
    }
}

/// Round-robin load balancer with atomic counter
#[derive(Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
    stats: SelectionStats,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select_instance(
        &self,
        instances: &[ServiceInstance],
        _hint: Option<&RoutingHint>,
    ) -> Option<usize> {
        self.stats.request();

        if instances.is_empty() {
            self.stats.failed();
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % instances.len();
        self.stats.selected(&instances[index], self.algorithm_name());
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "round_robin"
    }

    async fn get_stats(&self) -> LoadBalancerStats {
        self.stats.snapshot(self.algorithm_name())
    }

    async fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
        self.stats.clear();
    }
}

/// Consistent hash ring over instance ids, keyed by the routing hint
pub struct ConsistentHashBalancer {
    virtual_nodes: usize,
    fallback: WeightedRoundRobinBalancer,
    stats: SelectionStats,
}

impl ConsistentHashBalancer {
    /// Create a new consistent hash load balancer
    ///
    /// # Arguments
    /// * `virtual_nodes` - Number of virtual nodes per instance (default: 150)
    pub fn new(virtual_nodes: Option<usize>) -> Self {
        Self {
            virtual_nodes: virtual_nodes.unwrap_or(150).max(1),
            fallback: WeightedRoundRobinBalancer::new(),
            stats: SelectionStats::default(),
        }
    }

    fn create_hash_ring(&self, instances: &[ServiceInstance]) -> BTreeMap<u64, usize> {
        let mut ring = BTreeMap::new();
        for (index, instance) in instances.iter().enumerate() {
            for i in 0..self.virtual_nodes {
                let hash = hash_string(&format!("{}:{}", instance.id, i));
                ring.insert(hash, index);
            }
        }
        ring
    }
}

/// Hash a string to u64
fn hash_string(s: &str) -> u64 {
    let result = Sha256::digest(s.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&result[0..8]);
    u64::from_be_bytes(bytes)
}

#[async_trait]
impl LoadBalancer for ConsistentHashBalancer {
    async fn select_instance(
        &self,
        instances: &[ServiceInstance],
        hint: Option<&RoutingHint>,
    ) -> Option<usize> {
        self.stats.request();

        if instances.is_empty() {
            self.stats.failed();
            return None;
        }

        let hint = match hint {
            Some(hint) => hint,
            None => return self.fallback.select_instance(instances, None).await,
        };

        let ring = self.create_hash_ring(instances);
        let key_hash = hash_string(hint.as_str());
        let index = ring
            .range(key_hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, index)| *index)?;

        self.stats.selected(&instances[index], self.algorithm_name());
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "consistent_hash"
    }

    async fn get_stats(&self) -> LoadBalancerStats {
        self.stats.snapshot(self.algorithm_name())
    }

    async fn reset(&self) {
        self.fallback.reset().await;
        self.stats.clear();
    }
}

/// Build a fresh balancer for the configured policy
pub fn create_load_balancer(kind: LoadBalancerKind) -> Arc<dyn LoadBalancer> {
    match kind {
        LoadBalancerKind::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new()),
        LoadBalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancerKind::ConsistentHash => Arc::new(ConsistentHashBalancer::new(None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(port: u16, weight: u32) -> ServiceInstance {
        ServiceInstance::new("TravelService", "127.0.0.1", port).with_weight(weight)
    }

    async fn sequence(balancer: &dyn LoadBalancer, instances: &[ServiceInstance], n: usize) -> Vec<u16> {
        let mut ports = Vec::new();
        for _ in 0..n {
            let index = balancer.select_instance(instances, None).await.unwrap();
            ports.push(instances[index].port);
        }
        ports
    }

    #[tokio::test]
    async fn test_smooth_weighted_sequence() {
        let balancer = WeightedRoundRobinBalancer::new();
        let instances = vec![instance(1, 5), instance(2, 1), instance(3, 1)];
        assert_eq!(
            sequence(&balancer, &instances, 7).await,
            vec![1, 1, 2, 1, 3, 1, 1]
        );
    }

    #[tokio::test]
    async fn test_weighted_is_deterministic() {
        let instances = vec![instance(1, 3), instance(2, 2), instance(3, 1)];
        let first = sequence(&WeightedRoundRobinBalancer::new(), &instances, 12).await;
        let second = sequence(&WeightedRoundRobinBalancer::new(), &instances, 12).await;
        assert_eq!(first, second);
        assert_eq!(first.iter().filter(|p| **p == 1).count(), 6);
        assert_eq!(first.iter().filter(|p| **p == 2).count(), 4);
        assert_eq!(first.iter().filter(|p| **p == 3).count(), 2);
    }

    #[tokio::test]
    async fn test_weighted_equal_weights_alternate() {
        let balancer = WeightedRoundRobinBalancer::new();
        let instances = vec![instance(8888, 1), instance(8889, 1)];
        assert_eq!(
            sequence(&balancer, &instances, 4).await,
            vec![8888, 8889, 8888, 8889]
        );
    }

    #[tokio::test]
    async fn test_empty_instances() {
        let balancers: Vec<Arc<dyn LoadBalancer>> = vec![
            create_load_balancer(LoadBalancerKind::WeightedRoundRobin),
            create_load_balancer(LoadBalancerKind::RoundRobin),
            create_load_balancer(LoadBalancerKind::ConsistentHash),
        ];
        for balancer in balancers {
            assert!(balancer.select_instance(&[], None).await.is_none());
            assert_eq!(balancer.get_stats().await.failed_selections, 1);
        }
    }

    #[tokio::test]
    async fn test_round_robin_ignores_weight() {
        let balancer = RoundRobinBalancer::new();
        let instances = vec![instance(1, 10), instance(2, 1)];
        assert_eq!(sequence(&balancer, &instances, 4).await, vec![1, 2, 1, 2]);

        balancer.reset().await;
        assert_eq!(balancer.get_stats().await.total_requests, 0);
    }

    #[tokio::test]
    async fn test_consistent_hash_is_sticky() {
        let balancer = ConsistentHashBalancer::new(None);
        let instances = vec![instance(1, 1), instance(2, 1), instance(3, 1)];
        let hint = RoutingHint::new("user-42");

        let first = balancer.select_instance(&instances, Some(&hint)).await.unwrap();
        for _ in 0..10 {
            assert_eq!(
                balancer.select_instance(&instances, Some(&hint)).await,
                Some(first)
            );
        }
    }

    #[tokio::test]
    async fn test_consistent_hash_without_hint_falls_back() {
        let balancer = ConsistentHashBalancer::new(Some(10));
        let instances = vec![instance(1, 1), instance(2, 1)];
        assert_eq!(sequence(&balancer, &instances, 2).await, vec![1, 2]);
    }
}
