use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::failover::RouteError;
use super::health::HealthSnapshot;
use super::service::{OutcomeReport, RequestFacts, RoutingService, SelectedTarget,
    ServiceHealthStats};

/// 路由器接口
///
/// 这个trait定义了路由引擎的核心功能，请求路径代码依赖接口注入
/// 而不是具体单例，也便于单元测试替换实现
#[async_trait]
pub trait Router: Send + Sync {
    /// 为请求选择目标端点
    async fn select_target(
        &self,
        service_name: &str,
        facts: &RequestFacts,
    ) -> Result<SelectedTarget, RouteError>;

    /// 上报转发结果（被动健康信号）
    async fn report_outcome(&self, endpoint_key: &str, outcome: OutcomeReport);

    /// 获取按服务聚合的健康统计
    async fn service_health(&self) -> HashMap<String, ServiceHealthStats>;

    /// 获取只读健康快照
    async fn health_snapshot(&self) -> Arc<HealthSnapshot>;

    /// 手动触发一轮探测
    async fn trigger_probe_round(&self);

    /// 检查服务是否正在运行
    async fn is_running(&self) -> bool;
}

/// 为 RoutingService 实现 Router trait
#[async_trait]
impl Router for RoutingService {
    async fn select_target(
        &self,
        service_name: &str,
        facts: &RequestFacts,
    ) -> Result<SelectedTarget, RouteError> {
        RoutingService::select_target(self, service_name, facts)
    }

    async fn report_outcome(&self, endpoint_key: &str, outcome: OutcomeReport) {
        RoutingService::report_outcome(self, endpoint_key, outcome);
    }

    async fn service_health(&self) -> HashMap<String, ServiceHealthStats> {
        RoutingService::service_health(self)
    }

    async fn health_snapshot(&self) -> Arc<HealthSnapshot> {
        RoutingService::health_snapshot(self)
    }

    async fn trigger_probe_round(&self) {
        RoutingService::trigger_probe_round(self).await;
    }

    async fn is_running(&self) -> bool {
        RoutingService::is_running(self).await
    }
}
