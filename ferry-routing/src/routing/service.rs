use super::affinity::{AffinityStats, AffinityStore};
use super::canary;
use super::failover::{FailoverController, RouteError};
use super::health::{HealthEvent, HealthMonitor, HealthSnapshot, HealthThresholds};
use super::prober::{DefaultProbeExecutor, ProbeExecutor, Prober};
use super::table::{DiscoveredEndpoint, Endpoint, RoutingTable};
use anyhow::Result;
use arc_swap::ArcSwap;
use ferry_core::config::model::{Config, PoolKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// 代理层为当前请求提供的事实
///
/// 引擎不解析HTTP，header/cookie已由调用方展开成映射。
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    pub client_ip: Option<String>,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// 显式亲和令牌，优先于client_ip作为粘性键
    pub affinity_token: Option<String>,
    /// 调用方剩余期限；超过后立即终止层间升级
    pub deadline: Option<Instant>,
}

/// 选中的目标端点
#[derive(Debug, Clone)]
pub struct SelectedTarget {
    pub endpoint: Arc<Endpoint>,
    pub pool_kind: PoolKind,
    pub selection_time: Duration,
}

/// 请求结果反馈（被动健康信号）
#[derive(Debug, Clone)]
pub enum OutcomeReport {
    Success { latency: Duration },
    Failure { error: String },
}

/// 路由服务
///
/// 整合健康监视器、探测器、亲和存储和故障转移控制器，
/// 是代理层使用的唯一入口。
pub struct RoutingService {
    config: ArcSwap<Config>,
    table: Arc<RoutingTable>,
    monitor: Arc<HealthMonitor>,
    prober: Arc<Prober>,
    controller: FailoverController,
    affinity: Arc<ArcSwap<HashMap<String, Arc<AffinityStore>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl RoutingService {
    /// 创建路由服务（生产默认探测执行器）
    pub fn new(config: Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.settings.probe_timeout_seconds);
        let executor = Arc::new(DefaultProbeExecutor::new(timeout)?);
        Self::with_probe_executor(config, executor)
    }

    /// 创建路由服务并注入探测执行器（测试和非常规传输）
    pub fn with_probe_executor(config: Config, executor: Arc<dyn ProbeExecutor>) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(HealthMonitor::new(config.settings.latency_smoothing));
        let table = Arc::new(RoutingTable::from_config(&config));
        let controller = FailoverController::new(&config.settings);
        let timeout = Duration::from_secs(config.settings.probe_timeout_seconds);
        let prober = Arc::new(Prober::new(
            table.clone(),
            monitor.clone(),
            executor,
            timeout,
        ));

        let service = Self {
            config: ArcSwap::from_pointee(config),
            table,
            monitor,
            prober,
            controller,
            affinity: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            is_running: Arc::new(RwLock::new(false)),
        };

        service.register_endpoints();
        service.rebuild_affinity_stores();

        Ok(service)
    }

    /// 启动后台任务：探测循环与亲和清扫循环
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        info!("Starting routing service");

        let config = self.config.load();
        let probe_interval = Duration::from_secs(config.settings.probe_interval_seconds);
        let sweep_interval = Duration::from_secs(config.settings.affinity_sweep_interval_seconds);
        drop(config);

        let prober = self.prober.clone();
        let is_running = self.is_running.clone();
        tokio::spawn(async move {
            prober.run(is_running, probe_interval).await;
        });

        let affinity = self.affinity.clone();
        let is_running = self.is_running.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            // 启动时没有可清扫的条目，跳过立即触发的第一个tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !*is_running.read().await {
                    break;
                }

                let stores = affinity.load();
                let mut removed = 0;
                for store in stores.values() {
                    removed += store.sweep();
                }
                if removed > 0 {
                    debug!("Affinity sweep removed {} entries in total", removed);
                }
            }
        });

        info!("Routing service started");
        Ok(())
    }

    /// 停止后台任务
    pub async fn stop(&self) {
        let mut running = self.is_running.write().await;
        *running = false;
        info!("Routing service stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// 为请求选择目标端点——代理层的唯一入口
    ///
    /// 整个决策不做网络I/O：金丝雀分类、亲和查找和层间故障转移
    /// 都只读原子快照。
    pub fn select_target(
        &self,
        service_name: &str,
        facts: &RequestFacts,
    ) -> Result<SelectedTarget, RouteError> {
        let start = Instant::now();

        let service = self
            .table
            .get(service_name)
            .ok_or_else(|| RouteError::ServiceNotFound(service_name.to_string()))?;

        if !service.enabled {
            return Err(RouteError::ServiceDisabled(service_name.to_string()));
        }

        let pool_kind = canary::classify(service.canary.as_ref(), facts);

        let sticky_key = if service.affinity.enabled {
            facts
                .affinity_token
                .as_deref()
                .or(facts.client_ip.as_deref())
                .map(|id| format!("{}:{}", service.name, id))
        } else {
            None
        };
        let stores = self.affinity.load();
        let affinity_ctx = match (&sticky_key, stores.get(&service.name)) {
            (Some(key), Some(store)) => Some((store.as_ref(), key.as_str())),
            _ => None,
        };

        let snapshot = self.monitor.snapshot();
        let endpoint =
            self.controller
                .select(&service, pool_kind, &snapshot, affinity_ctx, facts.deadline)?;

        let selection_time = start.elapsed();
        debug!(
            "Selected {} for service '{}' ({:?} pool, {}us)",
            endpoint.key,
            service.name,
            pool_kind,
            selection_time.as_micros()
        );

        Ok(SelectedTarget {
            endpoint,
            pool_kind,
            selection_time,
        })
    }

    /// 被动健康反馈：代理层上报转发结果
    pub fn report_outcome(&self, endpoint_key: &str, outcome: OutcomeReport) {
        match outcome {
            OutcomeReport::Success { latency } => {
                self.monitor.record_success(endpoint_key, Some(latency));
                debug!(
                    "Recorded success for {} with latency {}ms",
                    endpoint_key,
                    latency.as_millis()
                );
            }
            OutcomeReport::Failure { error } => {
                self.monitor.record_failure(endpoint_key);
                debug!("Recorded failure for {}: {}", endpoint_key, error);
            }
        }
    }

    /// 手动触发一轮探测（管理接口和测试用）
    pub async fn trigger_probe_round(&self) {
        self.prober.probe_round().await;
    }

    /// 应用新配置：路由表整体替换，亲和存储按服务重建
    pub fn apply_config(&self, config: Config) -> Result<()> {
        config.validate()?;

        self.table.rebuild(&config);
        self.config.store(Arc::new(config));
        self.register_endpoints();
        self.rebuild_affinity_stores();

        info!("Routing configuration applied");
        Ok(())
    }

    /// 应用服务发现更新
    pub fn apply_discovery(
        &self,
        service_name: &str,
        updates: Vec<DiscoveredEndpoint>,
    ) -> Result<()> {
        if !self.table.apply_discovery(service_name, &updates) {
            anyhow::bail!("Discovery update for unknown service '{}'", service_name);
        }

        self.register_endpoints();
        Ok(())
    }

    /// 只读健康快照（观测/管理用途）
    pub fn health_snapshot(&self) -> Arc<HealthSnapshot> {
        self.monitor.snapshot()
    }

    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.monitor.subscribe()
    }

    /// 获取按服务聚合的健康统计
    pub fn service_health(&self) -> HashMap<String, ServiceHealthStats> {
        let snapshot = self.monitor.snapshot();
        let services = self.table.snapshot();
        let mut stats = HashMap::new();

        for (service_key, service) in services.iter() {
            let mut seen: HashSet<String> = HashSet::new();
            let mut healthy = 0usize;
            let mut degraded = 0usize;
            let mut unhealthy = 0usize;
            let mut latency_sum = 0.0f64;
            let mut latency_count = 0usize;

            for (endpoint, _) in service.endpoints_with_health() {
                if !seen.insert(endpoint.key.clone()) {
                    continue;
                }

                match snapshot.state_of(&endpoint.key) {
                    super::health::HealthState::Healthy => healthy += 1,
                    super::health::HealthState::Degraded => degraded += 1,
                    super::health::HealthState::Unhealthy => unhealthy += 1,
                }

                if let Some(latency) = snapshot.latency_of(&endpoint.key) {
                    latency_sum += latency;
                    latency_count += 1;
                }
            }

            let total = healthy + degraded + unhealthy;
            stats.insert(
                service_key.clone(),
                ServiceHealthStats {
                    total_endpoints: total,
                    healthy_endpoints: healthy,
                    degraded_endpoints: degraded,
                    unhealthy_endpoints: unhealthy,
                    health_ratio: if total > 0 {
                        (healthy + degraded) as f64 / total as f64
                    } else {
                        0.0
                    },
                    average_latency_ms: if latency_count > 0 {
                        Some(latency_sum / latency_count as f64)
                    } else {
                        None
                    },
                },
            );
        }

        stats
    }

    /// 获取各服务的亲和统计
    pub fn affinity_stats(&self) -> HashMap<String, AffinityStats> {
        self.affinity
            .load()
            .iter()
            .map(|(service, store)| (service.clone(), store.stats()))
            .collect()
    }

    pub fn get_config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// 把当前表里的所有端点注册进健康监视器并清理消失的端点
    fn register_endpoints(&self) {
        let services = self.table.snapshot();
        let mut keys = HashSet::new();

        for service in services.values() {
            for (endpoint, health) in service.endpoints_with_health() {
                self.monitor
                    .register(&endpoint.key, HealthThresholds::from(health));
                keys.insert(endpoint.key.clone());
            }
        }

        self.monitor.retain(&keys);
        self.monitor.publish();
    }

    /// 按服务重建亲和存储；未启用亲和的服务没有存储
    fn rebuild_affinity_stores(&self) {
        let services = self.table.snapshot();
        let previous = self.affinity.load();
        let mut stores: HashMap<String, Arc<AffinityStore>> = HashMap::new();

        for service in services.values() {
            if !service.affinity.enabled {
                continue;
            }

            // 配置未变的服务保留现有条目
            if let Some(existing) = previous.get(&service.name) {
                stores.insert(service.name.clone(), existing.clone());
                continue;
            }

            stores.insert(
                service.name.clone(),
                Arc::new(AffinityStore::new(
                    Duration::from_secs(service.affinity.ttl_seconds),
                    service.affinity.max_entries,
                )),
            );
        }

        if stores.len() != previous.len() {
            debug!("Affinity stores rebuilt for {} services", stores.len());
        }
        self.affinity.store(Arc::new(stores));
    }
}

/// 按服务聚合的健康统计
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceHealthStats {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub degraded_endpoints: usize,
    pub unhealthy_endpoints: usize,
    /// 可路由（Healthy或Degraded）端点占比
    pub health_ratio: f64,
    pub average_latency_ms: Option<f64>,
}

impl ServiceHealthStats {
    /// 服务是否还有可路由端点
    pub fn is_healthy(&self) -> bool {
        self.health_ratio > 0.0
    }

    pub fn is_fully_healthy(&self) -> bool {
        self.unhealthy_endpoints == 0 && self.degraded_endpoints == 0
    }
}
