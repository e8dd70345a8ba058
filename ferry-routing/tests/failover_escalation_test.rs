use async_trait::async_trait;
use ferry_core::config::model::{
    AffinityConfig, ClusterConfig, Config, EndpointConfig, FailMode, GlobalSettings,
    HealthCheckConfig, PoolConfig, PoolKind, RoutingStrategy, ServiceRoute,
};
use ferry_routing::{ProbeExecutor, ProbeReport, ProbeSpec, RequestFacts, RouteError, RoutingService};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// 可在测试中途翻转端点可达性的探测执行器
struct FlagExecutor {
    up: Mutex<HashMap<String, bool>>,
}

impl FlagExecutor {
    fn new() -> Self {
        Self {
            up: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, address: &str, up: bool) {
        self.up
            .lock()
            .expect("executor lock")
            .insert(address.to_string(), up);
    }
}

#[async_trait]
impl ProbeExecutor for FlagExecutor {
    async fn probe(&self, spec: &ProbeSpec) -> ProbeReport {
        let success = self
            .up
            .lock()
            .expect("executor lock")
            .get(&spec.address)
            .copied()
            .unwrap_or(false);
        ProbeReport {
            success,
            latency: if success {
                Some(Duration::from_millis(5))
            } else {
                None
            },
        }
    }
}

fn endpoint(address: &str) -> EndpointConfig {
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
            endpoints: addresses.iter().map(|a| endpoint(a)).collect(),
        }],
    }
}

fn create_failover_test_config() -> Config {
    let mut services = HashMap::new();
    services.insert(
        "orders".to_string(),
        ServiceRoute {
            name: "orders".to_string(),
            enabled: true,
            strategy: RoutingStrategy::RoundRobin,
            canary: None,
            affinity: AffinityConfig::default(),
            fail_mode: FailMode::FailClosed,
            clusters: vec![
                cluster("cluster-a", 1, &["10.1.0.1:80", "10.1.0.2:80"]),
                cluster("cluster-b", 2, &["10.2.0.1:80"]),
            ],
        },
    );

    Config {
        services,
        settings: GlobalSettings::default(),
    }
}

#[tokio::test]
async fn test_select_escalates_to_lower_priority_tier() {
    let executor = Arc::new(FlagExecutor::new());
    // 集群A全灭，集群B健康
    executor.set("10.1.0.1:80", false);
    executor.set("10.1.0.2:80", false);
    executor.set("10.2.0.1:80", true);

    let service = RoutingService::with_probe_executor(create_failover_test_config(), executor)
        .expect("service construction");

    // N=4轮探测让A的端点进入Unhealthy
    for _ in 0..4 {
        service.trigger_probe_round().await;
    }

    for _ in 0..5 {
        let target = service
            .select_target("orders", &RequestFacts::default())
            .expect("cluster B should serve");
        assert_eq!(target.endpoint.cluster, "cluster-b");
        assert_eq!(target.endpoint.address, "10.2.0.1:80");
    }

    println!("✅ Escalation: all selections landed on cluster-b");
}

#[tokio::test]
async fn test_exhausted_tiers_return_terminal_error() {
    let executor = Arc::new(FlagExecutor::new());
    // 所有端点都不可达
    let service = RoutingService::with_probe_executor(create_failover_test_config(), executor)
        .expect("service construction");

    for _ in 0..4 {
        service.trigger_probe_round().await;
    }

    let error = service
        .select_target("orders", &RequestFacts::default())
        .expect_err("no tier can serve");
    assert!(matches!(error, RouteError::AllTiersExhausted { .. }));

    println!("✅ Terminal: AllTiersExhausted surfaced, no panic");
}

#[tokio::test]
async fn test_recovered_tier_takes_traffic_back() {
    let executor = Arc::new(FlagExecutor::new());
    executor.set("10.1.0.1:80", false);
    executor.set("10.1.0.2:80", false);
    executor.set("10.2.0.1:80", true);

    let service =
        RoutingService::with_probe_executor(create_failover_test_config(), executor.clone())
            .expect("service construction");

    for _ in 0..4 {
        service.trigger_probe_round().await;
    }

    let target = service
        .select_target("orders", &RequestFacts::default())
        .expect("fallback serves");
    assert_eq!(target.endpoint.cluster, "cluster-b");

    // 集群A恢复；M=2轮成功探测后重新变为Healthy
    executor.set("10.1.0.1:80", true);
    executor.set("10.1.0.2:80", true);
    for _ in 0..2 {
        service.trigger_probe_round().await;
    }

    let target = service
        .select_target("orders", &RequestFacts::default())
        .expect("primary serves again");
    assert_eq!(target.endpoint.cluster, "cluster-a");

    println!("✅ Recovery: traffic moved back to cluster-a");
}

#[tokio::test]
async fn test_fail_open_serves_despite_exhaustion() {
    let mut config = create_failover_test_config();
    if let Some(route) = config.services.get_mut("orders") {
        route.fail_mode = FailMode::FailOpen;
    }

    let executor = Arc::new(FlagExecutor::new());
    let service =
        RoutingService::with_probe_executor(config, executor).expect("service construction");

    for _ in 0..4 {
        service.trigger_probe_round().await;
    }

    // fail-open下仍然返回端点而不是错误
    let target = service
        .select_target("orders", &RequestFacts::default())
        .expect("fail-open routes anyway");
    assert_eq!(target.endpoint.cluster, "cluster-a");
}
