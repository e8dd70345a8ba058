use arc_swap::ArcSwap;
use ferry_core::config::model::{
    AffinityConfig, CanaryRule, ClusterConfig, Config, FailMode, HealthCheckConfig, PoolKind,
    RoutingStrategy, ServiceRoute,
};
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 运行时端点：一次配置构建后不再修改
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// 全局唯一键："集群名:地址"
    pub key: String,
    pub cluster: String,
    pub address: String,
    pub weight: u32,
    pub priority: u8,
}

impl Endpoint {
    pub fn make_key(cluster: &str, address: &str) -> String {
        format!("{cluster}:{address}")
    }
}

/// 运行时池：端点按(priority, address)排成稳定顺序，轮询游标随池生存
#[derive(Debug)]
pub struct RuntimePool {
    pub kind: PoolKind,
    pub strategy: RoutingStrategy,
    pub endpoints: Vec<Arc<Endpoint>>,
    pub cursor: AtomicUsize,
}

#[derive(Debug)]
pub struct RuntimeCluster {
    pub name: String,
    pub priority: u8,
    pub weight: u32,
    pub health: HealthCheckConfig,
    pub pools: Vec<RuntimePool>,
}

impl RuntimeCluster {
    /// 获取指定类型的池；金丝雀请求在该集群没有金丝雀池时回落到稳定池
    pub fn pool_for(&self, kind: PoolKind) -> Option<&RuntimePool> {
        self.pools
            .iter()
            .find(|pool| pool.kind == kind)
            .or_else(|| match kind {
                PoolKind::Canary => self.pools.iter().find(|pool| pool.kind == PoolKind::Stable),
                PoolKind::Stable => None,
            })
    }
}

/// 同一priority的集群构成一个故障转移层
#[derive(Debug)]
pub struct Tier {
    pub priority: u8,
    pub clusters: Vec<Arc<RuntimeCluster>>,
}

/// 单个服务的运行时路由表，整体替换、从不原地修改
#[derive(Debug)]
pub struct ServiceTable {
    pub name: String,
    pub enabled: bool,
    pub strategy: RoutingStrategy,
    pub canary: Option<CanaryRule>,
    pub affinity: AffinityConfig,
    pub fail_mode: FailMode,
    /// 按priority升序
    pub tiers: Vec<Tier>,
}

impl ServiceTable {
    pub(crate) fn from_route(route: &ServiceRoute) -> Self {
        let mut clusters: Vec<Arc<RuntimeCluster>> = route
            .clusters
            .iter()
            .map(|cluster| Arc::new(build_cluster(cluster, route.strategy)))
            .collect();
        clusters.sort_by_key(|cluster| cluster.priority);

        let mut tiers: Vec<Tier> = Vec::new();
        for cluster in clusters {
            match tiers.last_mut() {
                Some(tier) if tier.priority == cluster.priority => tier.clusters.push(cluster),
                _ => tiers.push(Tier {
                    priority: cluster.priority,
                    clusters: vec![cluster],
                }),
            }
        }

        Self {
            name: route.name.clone(),
            enabled: route.enabled,
            strategy: route.strategy,
            canary: route.canary.clone(),
            affinity: route.affinity.clone(),
            fail_mode: route.fail_mode,
            tiers,
        }
    }

    /// 按端点键查找端点（任意层、任意池）
    pub fn find_endpoint(&self, endpoint_key: &str) -> Option<Arc<Endpoint>> {
        for tier in &self.tiers {
            for cluster in &tier.clusters {
                for pool in &cluster.pools {
                    if let Some(endpoint) =
                        pool.endpoints.iter().find(|e| e.key == endpoint_key)
                    {
                        return Some(endpoint.clone());
                    }
                }
            }
        }
        None
    }

    /// 遍历服务内所有端点及其所属集群的健康检查配置
    pub fn endpoints_with_health(&self) -> Vec<(Arc<Endpoint>, &HealthCheckConfig)> {
        let mut out = Vec::new();
        for tier in &self.tiers {
            for cluster in &tier.clusters {
                for pool in &cluster.pools {
                    for endpoint in &pool.endpoints {
                        out.push((endpoint.clone(), &cluster.health));
                    }
                }
            }
        }
        out
    }
}

fn build_cluster(config: &ClusterConfig, service_strategy: RoutingStrategy) -> RuntimeCluster {
    let pools = config
        .pools
        .iter()
        .map(|pool| {
            let mut endpoints: Vec<Arc<Endpoint>> = pool
                .endpoints
                .iter()
                .filter(|endpoint| endpoint.enabled)
                .map(|endpoint| {
                    Arc::new(Endpoint {
                        key: Endpoint::make_key(&config.name, &endpoint.address),
                        cluster: config.name.clone(),
                        address: endpoint.address.clone(),
                        weight: endpoint.weight,
                        priority: endpoint.priority,
                    })
                })
                .collect();
            endpoints.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.address.cmp(&b.address))
            });

            RuntimePool {
                kind: pool.kind,
                strategy: pool.strategy.unwrap_or(service_strategy),
                endpoints,
                cursor: AtomicUsize::new(0),
            }
        })
        .collect();

    RuntimeCluster {
        name: config.name.clone(),
        priority: config.priority,
        weight: config.weight,
        health: config.health.clone(),
        pools,
    }
}

/// 服务发现反馈的端点元组
#[derive(Debug, Clone)]
pub struct DiscoveredEndpoint {
    pub address: String,
    pub weight: u32,
    pub priority: u8,
    pub cluster: String,
}

/// 全局路由表
///
/// 所有服务表挂在一个ArcSwap后面，配置变更和服务发现都构建新表整体替换，
/// 请求路径上的读取永远看到一个完整一致的结构。
pub struct RoutingTable {
    services: ArcSwap<HashMap<String, Arc<ServiceTable>>>,
}

impl RoutingTable {
    pub fn from_config(config: &Config) -> Self {
        Self {
            services: ArcSwap::from_pointee(build_services(config)),
        }
    }

    /// 整体替换路由表（配置重载）
    pub fn rebuild(&self, config: &Config) {
        let services = build_services(config);
        info!("Routing table rebuilt with {} services", services.len());
        self.services.store(Arc::new(services));
    }

    /// 获取服务表（支持键名和显示名称）
    pub fn get(&self, service_name: &str) -> Option<Arc<ServiceTable>> {
        let services = self.services.load();
        if let Some(table) = services.get(service_name) {
            return Some(table.clone());
        }

        services
            .values()
            .find(|table| table.name == service_name)
            .cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<ServiceTable>>> {
        self.services.load_full()
    }

    /// 应用服务发现更新：整体重建目标服务中被提及集群的稳定池
    ///
    /// 引用未知集群的更新被丢弃并告警，已有配置中未被提及的集群保持不变。
    pub fn apply_discovery(&self, service_name: &str, updates: &[DiscoveredEndpoint]) -> bool {
        let services = self.services.load_full();
        let Some((service_key, current)) = services
            .iter()
            .find(|(key, table)| *key == service_name || table.name == service_name)
            .map(|(key, table)| (key.clone(), table.clone()))
        else {
            warn!("Discovery update for unknown service '{}'", service_name);
            return false;
        };

        let mut by_cluster: HashMap<&str, Vec<&DiscoveredEndpoint>> = HashMap::new();
        for update in updates {
            by_cluster.entry(&update.cluster).or_default().push(update);
        }

        let known_clusters: std::collections::HashSet<&str> = current
            .tiers
            .iter()
            .flat_map(|tier| tier.clusters.iter().map(|c| c.name.as_str()))
            .collect();
        for cluster in by_cluster.keys() {
            if !known_clusters.contains(cluster) {
                warn!(
                    "Discovery update references unknown cluster '{}' for service '{}', dropping",
                    cluster, service_name
                );
            }
        }

        let tiers = current
            .tiers
            .iter()
            .map(|tier| Tier {
                priority: tier.priority,
                clusters: tier
                    .clusters
                    .iter()
                    .map(|cluster| match by_cluster.get(cluster.name.as_str()) {
                        Some(discovered) => Arc::new(rebuild_cluster(cluster, discovered)),
                        None => cluster.clone(),
                    })
                    .collect(),
            })
            .collect();

        let rebuilt = Arc::new(ServiceTable {
            name: current.name.clone(),
            enabled: current.enabled,
            strategy: current.strategy,
            canary: current.canary.clone(),
            affinity: current.affinity.clone(),
            fail_mode: current.fail_mode,
            tiers,
        });

        let mut next: HashMap<String, Arc<ServiceTable>> = (*services).clone();
        next.insert(service_key, rebuilt);
        self.services.store(Arc::new(next));

        debug!(
            "Applied {} discovery updates to service '{}'",
            updates.len(),
            service_name
        );
        true
    }
}

fn build_services(config: &Config) -> HashMap<String, Arc<ServiceTable>> {
    config
        .services
        .iter()
        .map(|(key, route)| (key.clone(), Arc::new(ServiceTable::from_route(route))))
        .collect()
}

/// 用发现结果替换集群的稳定池端点，其余池保持原样
fn rebuild_cluster(cluster: &RuntimeCluster, discovered: &[&DiscoveredEndpoint]) -> RuntimeCluster {
    let pools = cluster
        .pools
        .iter()
        .map(|pool| {
            let endpoints = if pool.kind == PoolKind::Stable {
                let mut endpoints: Vec<Arc<Endpoint>> = discovered
                    .iter()
                    .map(|update| {
                        Arc::new(Endpoint {
                            key: Endpoint::make_key(&cluster.name, &update.address),
                            cluster: cluster.name.clone(),
                            address: update.address.clone(),
                            weight: update.weight,
                            priority: update.priority,
                        })
                    })
                    .collect();
                endpoints.sort_by(|a, b| {
                    a.priority
                        .cmp(&b.priority)
                        .then_with(|| a.address.cmp(&b.address))
                });
                endpoints
            } else {
                pool.endpoints.clone()
            };

            RuntimePool {
                kind: pool.kind,
                strategy: pool.strategy,
                endpoints,
                cursor: AtomicUsize::new(0),
            }
        })
        .collect();

    RuntimeCluster {
        name: cluster.name.clone(),
        priority: cluster.priority,
        weight: cluster.weight,
        health: cluster.health.clone(),
        pools,
    }
}
