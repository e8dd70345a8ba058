use super::service::RequestFacts;
use ferry_core::config::model::{CanaryRule, PoolKind};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// 对请求做稳定/金丝雀分类
///
/// 优先级：header显式匹配 > cookie显式匹配 > 按weight的IP哈希分桶。
/// 同一客户端IP在weight不变期间的分类结果恒定；没有客户端IP时退化为
/// 一次性随机抽取（不具备粘性）。
pub fn classify(rule: Option<&CanaryRule>, facts: &RequestFacts) -> PoolKind {
    let Some(rule) = rule else {
        return PoolKind::Stable;
    };

    if !rule.enabled {
        return PoolKind::Stable;
    }

    if let (Some(header), Some(expected)) = (&rule.header, &rule.header_value) {
        if facts.headers.get(header) == Some(expected) {
            debug!("Canary classification by header '{}'", header);
            return PoolKind::Canary;
        }
    }

    if let (Some(cookie), Some(expected)) = (&rule.cookie_name, &rule.cookie_value) {
        if facts.cookies.get(cookie) == Some(expected) {
            debug!("Canary classification by cookie '{}'", cookie);
            return PoolKind::Canary;
        }
    }

    // 0和100直接短路，不做哈希
    if rule.weight == 0 {
        return PoolKind::Stable;
    }
    if rule.weight >= 100 {
        return PoolKind::Canary;
    }

    let bucket = match &facts.client_ip {
        Some(client_ip) => sticky_bucket(client_ip),
        None => rand::rng().random_range(0..100),
    };

    if bucket < rule.weight {
        PoolKind::Canary
    } else {
        PoolKind::Stable
    }
}

/// 客户端IP的稳定哈希分桶 [0, 100)
fn sticky_bucket(client_ip: &str) -> u8 {
    let mut hasher = DefaultHasher::new();
    client_ip.hash(&mut hasher);
    (hasher.finish() % 100) as u8
}
