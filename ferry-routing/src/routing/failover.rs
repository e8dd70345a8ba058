use super::affinity::AffinityStore;
use super::health::{HealthSnapshot, HealthState};
use super::selector;
use super::table::{Endpoint, RuntimeCluster, ServiceTable, Tier};
use ferry_core::config::model::{FailMode, GlobalSettings, PoolKind};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// 路由错误分类
///
/// 只有终态（AllTiersExhausted、DeadlineExceeded）会跨出引擎边界；
/// PoolExhausted由控制器在层间升级时在内部消化。
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    #[error("no eligible endpoint in priority tier {tier}")]
    PoolExhausted { tier: u8 },

    #[error("all priority tiers exhausted for service '{service}' ({tiers_tried} tiers tried)")]
    AllTiersExhausted { service: String, tiers_tried: usize },

    #[error("routing deadline exceeded for service '{service}'")]
    DeadlineExceeded { service: String },

    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("service '{0}' is disabled")]
    ServiceDisabled(String),
}

/// 故障转移控制器
///
/// 按priority升序遍历层；层内按集群weight加权选择，单层尝试受
/// tier_retry_budget约束，整个决策受max_total_attempts和调用方
/// 剩余期限约束。
pub struct FailoverController {
    tier_retry_budget: u32,
    max_total_attempts: u32,
}

impl FailoverController {
    pub fn new(settings: &GlobalSettings) -> Self {
        Self {
            tier_retry_budget: settings.tier_retry_budget,
            max_total_attempts: settings.max_total_attempts,
        }
    }

    /// 为一次请求选出端点
    ///
    /// 同一个粘性键贯穿所有层，故障转移后的客户端不会在一次逻辑请求内
    /// 被重新随机分配。
    pub fn select(
        &self,
        service: &ServiceTable,
        kind: PoolKind,
        snapshot: &HealthSnapshot,
        affinity: Option<(&AffinityStore, &str)>,
        deadline: Option<Instant>,
    ) -> Result<Arc<Endpoint>, RouteError> {
        // 亲和命中优先于任何策略；目标必须仍然合格（Unhealthy直接放弃）
        if let Some((store, sticky_key)) = affinity {
            if let Some(target_key) = store.get(sticky_key) {
                if let Some(endpoint) = service.find_endpoint(&target_key) {
                    if snapshot.state_of(&endpoint.key) != HealthState::Unhealthy {
                        store.refresh(sticky_key);
                        debug!(
                            "Affinity hit for key '{}' -> {}",
                            sticky_key, endpoint.key
                        );
                        return Ok(endpoint);
                    }
                    debug!(
                        "Affinity target {} no longer eligible for key '{}'",
                        endpoint.key, sticky_key
                    );
                }
            }
        }

        let mut total_attempts = 0u32;
        let mut tiers_tried = 0usize;

        for tier in &service.tiers {
            if deadline_exceeded(deadline) {
                debug!(
                    "Deadline exceeded while escalating service '{}' at tier {}",
                    service.name, tier.priority
                );
                return Err(RouteError::DeadlineExceeded {
                    service: service.name.clone(),
                });
            }

            if total_attempts >= self.max_total_attempts {
                debug!(
                    "Total attempt cap {} reached for service '{}'",
                    self.max_total_attempts, service.name
                );
                break;
            }

            tiers_tried += 1;
            match self.select_in_tier(tier, kind, snapshot, &mut total_attempts) {
                Ok(endpoint) => {
                    if let Some((store, sticky_key)) = affinity {
                        store.put(sticky_key, &endpoint.key);
                    }
                    return Ok(endpoint);
                }
                Err(RouteError::PoolExhausted { tier }) => {
                    debug!(
                        "Tier {} exhausted for service '{}', escalating",
                        tier, service.name
                    );
                }
                Err(other) => return Err(other),
            }
        }

        if service.fail_mode == FailMode::FailOpen {
            if let Some(endpoint) = pick_ignoring_health(service, kind) {
                warn!(
                    "Service '{}' fail-open: routing to {} despite no eligible endpoint",
                    service.name, endpoint.key
                );
                if let Some((store, sticky_key)) = affinity {
                    store.put(sticky_key, &endpoint.key);
                }
                return Ok(endpoint);
            }
        }

        Err(RouteError::AllTiersExhausted {
            service: service.name.clone(),
            tiers_tried,
        })
    }

    /// 层内选择：按集群weight加权挑选集群，池耗尽的集群从本次决策中剔除
    fn select_in_tier(
        &self,
        tier: &Tier,
        kind: PoolKind,
        snapshot: &HealthSnapshot,
        total_attempts: &mut u32,
    ) -> Result<Arc<Endpoint>, RouteError> {
        let mut remaining: Vec<&Arc<RuntimeCluster>> = tier.clusters.iter().collect();
        let mut attempts_in_tier = 0u32;
        // 每个集群至少有一次被尝试的机会，预算主要约束重复尝试
        let attempt_cap = self.tier_retry_budget.max(tier.clusters.len() as u32);

        while !remaining.is_empty()
            && attempts_in_tier < attempt_cap
            && *total_attempts < self.max_total_attempts
        {
            attempts_in_tier += 1;
            *total_attempts += 1;

            let index = pick_cluster_index(&remaining);
            let cluster = remaining[index];

            let picked = cluster
                .pool_for(kind)
                .and_then(|pool| selector::pick_from_pool(pool, pool.strategy, snapshot));

            match picked {
                Some(endpoint) => return Ok(endpoint),
                None => {
                    debug!(
                        "Cluster '{}' has no eligible endpoint for {:?} pool",
                        cluster.name, kind
                    );
                    remaining.swap_remove(index);
                }
            }
        }

        Err(RouteError::PoolExhausted {
            tier: tier.priority,
        })
    }
}

/// 按weight在剩余集群中加权抽取；权重异常时退化为第一个
fn pick_cluster_index(clusters: &[&Arc<RuntimeCluster>]) -> usize {
    if clusters.len() == 1 {
        return 0;
    }

    match WeightedIndex::new(clusters.iter().map(|cluster| cluster.weight)) {
        Ok(dist) => {
            let mut rng = rand::rng();
            dist.sample(&mut rng)
        }
        Err(_) => 0,
    }
}

/// fail-open最后手段：无视健康状态，从最优先层的池里轮询取一个端点
fn pick_ignoring_health(service: &ServiceTable, kind: PoolKind) -> Option<Arc<Endpoint>> {
    for tier in &service.tiers {
        for cluster in &tier.clusters {
            if let Some(pool) = cluster.pool_for(kind) {
                if !pool.endpoints.is_empty() {
                    let index =
                        pool.cursor.fetch_add(1, Ordering::Relaxed) % pool.endpoints.len();
                    return Some(pool.endpoints[index].clone());
                }
            }
        }
    }
    None
}

fn deadline_exceeded(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::health::{HealthMonitor, HealthThresholds};
    use ferry_core::config::model::{
        AffinityConfig, CanaryRule, ClusterConfig, EndpointConfig, HealthCheckConfig, PoolConfig,
        RoutingStrategy, ServiceRoute,
    };
    use std::time::Duration;

    fn endpoint_config(address: &str) -> EndpointConfig {
        EndpointConfig {
            address: address.to_string(),
            weight: 1,
            priority: 0,
            enabled: true,
        }
    }

    fn cluster(name: &str, priority: u8, addresses: &[&str]) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            priority,
            weight: 1,
            health: HealthCheckConfig::default(),
            pools: vec![PoolConfig {
                kind: PoolKind::Stable,
                strategy: None,
                endpoints: addresses.iter().map(|a| endpoint_config(a)).collect(),
            }],
        }
    }

    fn two_tier_service() -> ServiceTable {
        let route = ServiceRoute {
            name: "orders".to_string(),
            enabled: true,
            strategy: RoutingStrategy::RoundRobin,
            canary: None::<CanaryRule>,
            affinity: AffinityConfig::default(),
            fail_mode: FailMode::FailClosed,
            clusters: vec![
                cluster("primary", 1, &["10.1.0.1:80", "10.1.0.2:80"]),
                cluster("fallback", 2, &["10.2.0.1:80"]),
            ],
        };

        ServiceTable::from_route(&route)
    }

    fn controller() -> FailoverController {
        FailoverController::new(&GlobalSettings::default())
    }

    fn mark_unhealthy(monitor: &HealthMonitor, key: &str) {
        monitor.register(key, HealthThresholds::default());
        for _ in 0..4 {
            monitor.record_failure(key);
        }
    }

    #[test]
    fn test_prefers_lowest_priority_tier() {
        let service = two_tier_service();
        let monitor = HealthMonitor::new(0.3);
        let snapshot = monitor.snapshot();

        let endpoint = controller()
            .select(&service, PoolKind::Stable, &snapshot, None, None)
            .expect("tier 1 healthy");
        assert_eq!(endpoint.cluster, "primary");
    }

    #[test]
    fn test_escalates_when_tier_unhealthy() {
        let service = two_tier_service();
        let monitor = HealthMonitor::new(0.3);
        mark_unhealthy(&monitor, "primary:10.1.0.1:80");
        mark_unhealthy(&monitor, "primary:10.1.0.2:80");
        let snapshot = monitor.snapshot();

        let endpoint = controller()
            .select(&service, PoolKind::Stable, &snapshot, None, None)
            .expect("tier 2 healthy");
        assert_eq!(endpoint.cluster, "fallback");
        assert_eq!(endpoint.address, "10.2.0.1:80");
    }

    #[test]
    fn test_all_tiers_exhausted_is_terminal() {
        let service = two_tier_service();
        let monitor = HealthMonitor::new(0.3);
        mark_unhealthy(&monitor, "primary:10.1.0.1:80");
        mark_unhealthy(&monitor, "primary:10.1.0.2:80");
        mark_unhealthy(&monitor, "fallback:10.2.0.1:80");
        let snapshot = monitor.snapshot();

        let error = controller()
            .select(&service, PoolKind::Stable, &snapshot, None, None)
            .expect_err("everything unhealthy");
        assert!(matches!(
            error,
            RouteError::AllTiersExhausted { tiers_tried: 2, .. }
        ));
    }

    #[test]
    fn test_fail_open_routes_despite_unhealthy() {
        let mut service = two_tier_service();
        service.fail_mode = FailMode::FailOpen;

        let monitor = HealthMonitor::new(0.3);
        mark_unhealthy(&monitor, "primary:10.1.0.1:80");
        mark_unhealthy(&monitor, "primary:10.1.0.2:80");
        mark_unhealthy(&monitor, "fallback:10.2.0.1:80");
        let snapshot = monitor.snapshot();

        let endpoint = controller()
            .select(&service, PoolKind::Stable, &snapshot, None, None)
            .expect("fail-open still routes");
        assert_eq!(endpoint.cluster, "primary");
    }

    #[test]
    fn test_deadline_exceeded_reported_distinctly() {
        let service = two_tier_service();
        let monitor = HealthMonitor::new(0.3);
        let snapshot = monitor.snapshot();

        let past = Instant::now() - Duration::from_millis(1);
        let error = controller()
            .select(&service, PoolKind::Stable, &snapshot, None, Some(past))
            .expect_err("deadline already passed");
        assert!(matches!(error, RouteError::DeadlineExceeded { .. }));
    }

    #[test]
    fn test_affinity_hit_bypasses_strategy() {
        let service = two_tier_service();
        let monitor = HealthMonitor::new(0.3);
        let snapshot = monitor.snapshot();
        let store = AffinityStore::new(Duration::from_secs(60), 100);
        store.put("orders:10.9.9.9", "primary:10.1.0.2:80");

        for _ in 0..5 {
            let endpoint = controller()
                .select(
                    &service,
                    PoolKind::Stable,
                    &snapshot,
                    Some((&store, "orders:10.9.9.9")),
                    None,
                )
                .expect("affinity target healthy");
            assert_eq!(endpoint.key, "primary:10.1.0.2:80");
        }
    }

    #[test]
    fn test_affinity_ignored_when_target_unhealthy() {
        let service = two_tier_service();
        let monitor = HealthMonitor::new(0.3);
        mark_unhealthy(&monitor, "primary:10.1.0.2:80");
        let snapshot = monitor.snapshot();

        let store = AffinityStore::new(Duration::from_secs(60), 100);
        store.put("orders:10.9.9.9", "primary:10.1.0.2:80");

        let endpoint = controller()
            .select(
                &service,
                PoolKind::Stable,
                &snapshot,
                Some((&store, "orders:10.9.9.9")),
                None,
            )
            .expect("re-selection succeeds");
        assert_eq!(endpoint.key, "primary:10.1.0.1:80");

        // 重新选择的结果覆盖旧的亲和映射
        assert_eq!(
            store.get("orders:10.9.9.9").as_deref(),
            Some("primary:10.1.0.1:80")
        );
    }

    #[test]
    fn test_selection_establishes_affinity() {
        let service = two_tier_service();
        let monitor = HealthMonitor::new(0.3);
        let snapshot = monitor.snapshot();
        let store = AffinityStore::new(Duration::from_secs(60), 100);

        let first = controller()
            .select(
                &service,
                PoolKind::Stable,
                &snapshot,
                Some((&store, "orders:10.9.9.9")),
                None,
            )
            .expect("selection succeeds");

        // 后续请求粘在第一次的结果上
        for _ in 0..5 {
            let endpoint = controller()
                .select(
                    &service,
                    PoolKind::Stable,
                    &snapshot,
                    Some((&store, "orders:10.9.9.9")),
                    None,
                )
                .expect("selection succeeds");
            assert_eq!(endpoint.key, first.key);
        }
    }
}
