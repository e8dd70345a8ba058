use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub services: HashMap<String, ServiceRoute>,
    #[serde(default)]
    pub settings: GlobalSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GlobalSettings {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// EWMA平滑系数：新样本所占的权重 (0,1]
    #[serde(default = "default_latency_smoothing")]
    pub latency_smoothing: f64,
    /// 单个优先级层内的重试预算
    #[serde(default = "default_tier_retry_budget")]
    pub tier_retry_budget: u32,
    /// 单次路由决策的总尝试上限（跨所有层）
    #[serde(default = "default_max_total_attempts")]
    pub max_total_attempts: u32,
    #[serde(default = "default_affinity_sweep_interval")]
    pub affinity_sweep_interval_seconds: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            latency_smoothing: default_latency_smoothing(),
            tier_retry_budget: default_tier_retry_budget(),
            max_total_attempts: default_max_total_attempts(),
            affinity_sweep_interval_seconds: default_affinity_sweep_interval(),
        }
    }
}

/// 单个服务的路由配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceRoute {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default)]
    pub canary: Option<CanaryRule>,
    #[serde(default)]
    pub affinity: AffinityConfig,
    #[serde(default)]
    pub fail_mode: FailMode,
    pub clusters: Vec<ClusterConfig>,
}

/// 集群配置：priority决定故障转移层级，weight决定同层内的流量份额
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_cluster_weight")]
    pub weight: u32,
    #[serde(default)]
    pub health: HealthCheckConfig,
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    #[serde(default)]
    pub kind: PoolKind,
    /// 覆盖服务级策略
    #[serde(default)]
    pub strategy: Option<RoutingStrategy>,
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EndpointConfig {
    /// host:port 或完整URL
    pub address: String,
    #[serde(default = "default_endpoint_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// 池类型：稳定池或金丝雀池
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    #[default]
    Stable,
    Canary,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// 轮询 - 按稳定顺序逐个循环
    #[default]
    RoundRobin,
    /// 加权随机 - 按weight比例抽取
    Weighted,
    /// 延迟优先 - 选择EWMA延迟最低的端点
    LatencyBased,
}

/// 池完全耗尽时的行为
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// 拒绝路由，向调用方返回错误
    #[default]
    FailClosed,
    /// 忽略健康状态继续路由（最后手段）
    FailOpen,
}

/// 金丝雀分流规则
///
/// header/cookie显式匹配优先于按weight的哈希分桶
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CanaryRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 0-100，金丝雀池应承接的流量百分比
    #[serde(default)]
    pub weight: u8,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub header_value: Option<String>,
    #[serde(default)]
    pub cookie_name: Option<String>,
    #[serde(default)]
    pub cookie_value: Option<String>,
}

/// 会话亲和配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AffinityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_affinity_ttl")]
    pub ttl_seconds: u64,
    /// 防御性容量上限，超出后按最久未刷新采样驱逐
    #[serde(default = "default_affinity_max_entries")]
    pub max_entries: usize,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_seconds: default_affinity_ttl(),
            max_entries: default_affinity_max_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// HTTP状态码检查
    #[default]
    Http,
    /// TCP连接检查
    Tcp,
    /// 仅依赖请求结果的被动反馈，不做主动探测
    Passive,
}

/// 健康检查配置（每个集群一份，阈值满足迟滞要求）
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub probe: ProbeKind,
    #[serde(default = "default_probe_path")]
    pub http_path: String,
    /// K：连续失败达到该值进入Degraded（降权不排除）
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
    /// N：连续失败达到该值进入Unhealthy（K < N）
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// M：连续成功达到该值恢复Healthy
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::default(),
            http_path: default_probe_path(),
            degraded_threshold: default_degraded_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    15
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_latency_smoothing() -> f64 {
    0.3
}

fn default_tier_retry_budget() -> u32 {
    2
}

fn default_max_total_attempts() -> u32 {
    6
}

fn default_affinity_sweep_interval() -> u64 {
    60
}

fn default_cluster_weight() -> u32 {
    1
}

fn default_endpoint_weight() -> u32 {
    1
}

fn default_affinity_ttl() -> u64 {
    300
}

fn default_affinity_max_entries() -> usize {
    10_000
}

fn default_probe_path() -> String {
    "/healthz".to_string()
}

fn default_degraded_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    4
}

fn default_recovery_threshold() -> u32 {
    2
}

impl Config {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            anyhow::bail!("Configuration defines no services");
        }

        self.validate_settings()?;

        for (service_id, service) in &self.services {
            self.validate_service_config(service_id, service)?;
        }

        Ok(())
    }

    fn validate_settings(&self) -> Result<()> {
        let settings = &self.settings;

        if settings.probe_interval_seconds == 0 {
            anyhow::bail!("settings.probe_interval_seconds cannot be 0");
        }

        if settings.probe_timeout_seconds == 0 {
            anyhow::bail!("settings.probe_timeout_seconds cannot be 0");
        }

        if settings.latency_smoothing <= 0.0 || settings.latency_smoothing > 1.0 {
            anyhow::bail!(
                "settings.latency_smoothing must be in (0, 1], got {}",
                settings.latency_smoothing
            );
        }

        if settings.tier_retry_budget == 0 {
            anyhow::bail!("settings.tier_retry_budget cannot be 0");
        }

        if settings.max_total_attempts == 0 {
            anyhow::bail!("settings.max_total_attempts cannot be 0");
        }

        Ok(())
    }

    /// 验证单个服务配置的有效性
    fn validate_service_config(&self, service_id: &str, service: &ServiceRoute) -> Result<()> {
        if service.name.is_empty() {
            anyhow::bail!("Service '{}' has empty name", service_id);
        }

        if service.name.contains(' ') || service.name.contains('\t') || service.name.contains('\n')
        {
            anyhow::bail!(
                "Service '{}' has invalid name format: '{}' (cannot contain whitespace)",
                service_id,
                service.name
            );
        }

        if service.clusters.is_empty() {
            anyhow::bail!("Service '{}' has no clusters defined", service_id);
        }

        if let Some(canary) = &service.canary {
            self.validate_canary_rule(service_id, canary)?;
        }

        if service.affinity.enabled {
            if service.affinity.ttl_seconds == 0 {
                anyhow::bail!(
                    "Service '{}' has affinity enabled with ttl_seconds 0",
                    service_id
                );
            }
            if service.affinity.max_entries == 0 {
                anyhow::bail!(
                    "Service '{}' has affinity enabled with max_entries 0",
                    service_id
                );
            }
        }

        let mut cluster_names = std::collections::HashSet::new();
        let mut has_enabled_stable_endpoint = false;

        for cluster in &service.clusters {
            self.validate_cluster_config(service_id, cluster)?;

            if !cluster_names.insert(cluster.name.clone()) {
                anyhow::bail!(
                    "Service '{}' has duplicate cluster name '{}'",
                    service_id,
                    cluster.name
                );
            }

            for pool in &cluster.pools {
                if pool.kind == PoolKind::Stable
                    && pool.endpoints.iter().any(|e| e.enabled)
                {
                    has_enabled_stable_endpoint = true;
                }
            }
        }

        if !has_enabled_stable_endpoint {
            anyhow::bail!(
                "Service '{}' has no enabled endpoint in any stable pool",
                service_id
            );
        }

        Ok(())
    }

    fn validate_canary_rule(&self, service_id: &str, canary: &CanaryRule) -> Result<()> {
        if canary.weight > 100 {
            anyhow::bail!(
                "Service '{}' has invalid canary weight: {} (maximum 100)",
                service_id,
                canary.weight
            );
        }

        // header/header_value必须成对出现
        if canary.header.is_some() != canary.header_value.is_some() {
            anyhow::bail!(
                "Service '{}' canary rule must set header and header_value together",
                service_id
            );
        }

        if canary.cookie_name.is_some() != canary.cookie_value.is_some() {
            anyhow::bail!(
                "Service '{}' canary rule must set cookie_name and cookie_value together",
                service_id
            );
        }

        if let Some(header) = &canary.header {
            if header.is_empty() {
                anyhow::bail!("Service '{}' canary rule has empty header name", service_id);
            }
        }

        if let Some(cookie) = &canary.cookie_name {
            if cookie.is_empty() {
                anyhow::bail!("Service '{}' canary rule has empty cookie name", service_id);
            }
        }

        Ok(())
    }

    /// 验证单个集群配置的有效性
    fn validate_cluster_config(&self, service_id: &str, cluster: &ClusterConfig) -> Result<()> {
        if cluster.name.is_empty() {
            anyhow::bail!("Service '{}' has cluster with empty name", service_id);
        }

        if cluster.name.contains(' ') || cluster.name.contains(':') {
            anyhow::bail!(
                "Service '{}' cluster has invalid name format: '{}' (cannot contain spaces or ':')",
                service_id,
                cluster.name
            );
        }

        if cluster.weight == 0 {
            anyhow::bail!(
                "Service '{}' cluster '{}' has weight 0 (must be positive)",
                service_id,
                cluster.name
            );
        }

        if cluster.pools.is_empty() {
            anyhow::bail!(
                "Service '{}' cluster '{}' has no pools defined",
                service_id,
                cluster.name
            );
        }

        let mut seen_kinds = std::collections::HashSet::new();
        for pool in &cluster.pools {
            if !seen_kinds.insert(pool.kind) {
                anyhow::bail!(
                    "Service '{}' cluster '{}' has more than one {:?} pool",
                    service_id,
                    cluster.name,
                    pool.kind
                );
            }
            self.validate_pool_config(service_id, &cluster.name, pool)?;
        }

        self.validate_health_config(service_id, &cluster.name, &cluster.health)?;

        Ok(())
    }

    fn validate_pool_config(
        &self,
        service_id: &str,
        cluster_name: &str,
        pool: &PoolConfig,
    ) -> Result<()> {
        if pool.endpoints.is_empty() {
            anyhow::bail!(
                "Service '{}' cluster '{}' has {:?} pool with no endpoints",
                service_id,
                cluster_name,
                pool.kind
            );
        }

        for endpoint in &pool.endpoints {
            if endpoint.address.is_empty() {
                anyhow::bail!(
                    "Service '{}' cluster '{}' has endpoint with empty address",
                    service_id,
                    cluster_name
                );
            }

            let address_ok = endpoint.address.starts_with("http://")
                || endpoint.address.starts_with("https://")
                || endpoint.address.contains(':');
            if !address_ok {
                anyhow::bail!(
                    "Service '{}' cluster '{}' has invalid endpoint address: '{}' (expected host:port or URL)",
                    service_id,
                    cluster_name,
                    endpoint.address
                );
            }
        }

        Ok(())
    }

    fn validate_health_config(
        &self,
        service_id: &str,
        cluster_name: &str,
        health: &HealthCheckConfig,
    ) -> Result<()> {
        // 迟滞要求：N >= 2, M >= 2, K < N
        if health.unhealthy_threshold < 2 {
            anyhow::bail!(
                "Service '{}' cluster '{}' has unhealthy_threshold {} (minimum 2 for hysteresis)",
                service_id,
                cluster_name,
                health.unhealthy_threshold
            );
        }

        if health.recovery_threshold < 2 {
            anyhow::bail!(
                "Service '{}' cluster '{}' has recovery_threshold {} (minimum 2 for hysteresis)",
                service_id,
                cluster_name,
                health.recovery_threshold
            );
        }

        if health.degraded_threshold == 0 {
            anyhow::bail!(
                "Service '{}' cluster '{}' has degraded_threshold 0",
                service_id,
                cluster_name
            );
        }

        if health.degraded_threshold >= health.unhealthy_threshold {
            anyhow::bail!(
                "Service '{}' cluster '{}' has degraded_threshold {} >= unhealthy_threshold {}",
                service_id,
                cluster_name,
                health.degraded_threshold,
                health.unhealthy_threshold
            );
        }

        if health.probe == ProbeKind::Http && health.http_path.is_empty() {
            anyhow::bail!(
                "Service '{}' cluster '{}' uses HTTP probe with empty http_path",
                service_id,
                cluster_name
            );
        }

        Ok(())
    }

    /// 获取指定服务的配置（支持键名和显示名称）
    pub fn get_service(&self, service_name: &str) -> Option<&ServiceRoute> {
        if let Some(service) = self.services.get(service_name) {
            return Some(service);
        }

        self.services
            .values()
            .find(|service| service.name == service_name)
    }

    /// 获取所有启用的服务名称
    pub fn get_available_services(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, service)| service.enabled)
            .map(|(_, service)| service.name.clone())
            .collect()
    }
}
