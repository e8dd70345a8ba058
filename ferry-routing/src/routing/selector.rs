use super::health::{HealthSnapshot, HealthState};
use super::table::{Endpoint, RuntimePool};
use ferry_core::config::model::RoutingStrategy;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// 资格过滤：优先Healthy，全不健康时回落Degraded；Unhealthy永不入选。
/// 返回空向量表示池已耗尽，由故障转移控制器升级处理。
pub fn eligible_endpoints<'a>(
    pool: &'a RuntimePool,
    snapshot: &HealthSnapshot,
) -> Vec<&'a Arc<Endpoint>> {
    let healthy: Vec<&Arc<Endpoint>> = pool
        .endpoints
        .iter()
        .filter(|endpoint| snapshot.state_of(&endpoint.key) == HealthState::Healthy)
        .collect();

    if !healthy.is_empty() {
        return healthy;
    }

    pool.endpoints
        .iter()
        .filter(|endpoint| snapshot.state_of(&endpoint.key) == HealthState::Degraded)
        .collect()
}

/// 在池内按策略选出一个端点；None表示池耗尽
pub fn pick_from_pool(
    pool: &RuntimePool,
    strategy: RoutingStrategy,
    snapshot: &HealthSnapshot,
) -> Option<Arc<Endpoint>> {
    let eligible = eligible_endpoints(pool, snapshot);
    if eligible.is_empty() {
        return None;
    }

    let selected = match strategy {
        RoutingStrategy::RoundRobin => pick_round_robin(pool, &eligible),
        RoutingStrategy::Weighted => pick_weighted(&eligible),
        RoutingStrategy::LatencyBased => pick_latency_based(pool, &eligible, snapshot),
    };

    if let Some(endpoint) = &selected {
        trace!(
            "Selected endpoint {} via {:?} ({} eligible)",
            endpoint.key,
            strategy,
            eligible.len()
        );
    }

    selected
}

/// 轮询：每池一个游标，原子步进，对合格子集取模
fn pick_round_robin(pool: &RuntimePool, eligible: &[&Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
    let index = pool.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
    Some(eligible[index].clone())
}

/// 加权随机：weight为0的端点即使合格也不会被选中
fn pick_weighted(eligible: &[&Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
    let weighted: Vec<&&Arc<Endpoint>> = eligible
        .iter()
        .filter(|endpoint| endpoint.weight > 0)
        .collect();
    if weighted.is_empty() {
        return None;
    }

    let dist = WeightedIndex::new(weighted.iter().map(|endpoint| endpoint.weight)).ok()?;
    let mut rng = rand::rng();
    Some((*weighted[dist.sample(&mut rng)]).clone())
}

/// 延迟优先：取EWMA最低者，并列时在并列集合内轮询防止饿死；
/// 没有延迟样本的端点视为无穷大延迟
fn pick_latency_based(
    pool: &RuntimePool,
    eligible: &[&Arc<Endpoint>],
    snapshot: &HealthSnapshot,
) -> Option<Arc<Endpoint>> {
    let latencies: Vec<f64> = eligible
        .iter()
        .map(|endpoint| {
            snapshot
                .latency_of(&endpoint.key)
                .unwrap_or(f64::INFINITY)
        })
        .collect();

    let best = latencies.iter().copied().fold(f64::INFINITY, f64::min);

    let tied: Vec<&Arc<Endpoint>> = eligible
        .iter()
        .zip(latencies.iter())
        .filter(|(_, latency)| **latency <= best)
        .map(|(endpoint, _)| *endpoint)
        .collect();

    if tied.len() == 1 {
        return Some(tied[0].clone());
    }

    let index = pool.cursor.fetch_add(1, Ordering::Relaxed) % tied.len();
    Some(tied[index].clone())
}
