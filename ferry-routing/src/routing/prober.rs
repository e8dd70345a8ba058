use super::health::HealthMonitor;
use super::table::RoutingTable;
use anyhow::Result;
use async_trait::async_trait;
use ferry_core::config::model::ProbeKind;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// 一次探测的目标描述
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    pub endpoint_key: String,
    pub address: String,
    pub kind: ProbeKind,
    pub http_path: String,
    pub timeout: Duration,
}

/// 探测结果；超时与拒绝连接一样计为失败
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub success: bool,
    pub latency: Option<Duration>,
}

/// 可插拔的探测执行器
///
/// 引擎不关心探测的传输细节；测试注入Mock实现，生产默认实现
/// 提供HTTP状态检查和TCP连接检查。
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn probe(&self, spec: &ProbeSpec) -> ProbeReport;
}

/// 默认探测执行器：HTTP状态检查 + TCP连接检查
pub struct DefaultProbeExecutor {
    client: reqwest::Client,
}

impl DefaultProbeExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeExecutor for DefaultProbeExecutor {
    async fn probe(&self, spec: &ProbeSpec) -> ProbeReport {
        match spec.kind {
            ProbeKind::Http => self.probe_http(spec).await,
            ProbeKind::Tcp => probe_tcp(spec).await,
            // Passive集群不会被主动探测循环调度到这里
            ProbeKind::Passive => ProbeReport {
                success: true,
                latency: None,
            },
        }
    }
}

impl DefaultProbeExecutor {
    async fn probe_http(&self, spec: &ProbeSpec) -> ProbeReport {
        let url = probe_url(&spec.address, &spec.http_path);
        let start = Instant::now();

        match tokio::time::timeout(spec.timeout, self.client.get(&url).send()).await {
            Ok(Ok(response)) => {
                let latency = start.elapsed();
                if response.status().is_success() {
                    trace!(
                        "HTTP probe succeeded for {} ({}ms)",
                        spec.endpoint_key,
                        latency.as_millis()
                    );
                    ProbeReport {
                        success: true,
                        latency: Some(latency),
                    }
                } else {
                    debug!(
                        "HTTP probe failed for {} with status {}",
                        spec.endpoint_key,
                        response.status()
                    );
                    ProbeReport {
                        success: false,
                        latency: None,
                    }
                }
            }
            Ok(Err(e)) => {
                debug!("HTTP probe error for {}: {}", spec.endpoint_key, e);
                ProbeReport {
                    success: false,
                    latency: None,
                }
            }
            Err(_) => {
                debug!("HTTP probe timed out for {}", spec.endpoint_key);
                ProbeReport {
                    success: false,
                    latency: None,
                }
            }
        }
    }
}

async fn probe_tcp(spec: &ProbeSpec) -> ProbeReport {
    let start = Instant::now();

    match tokio::time::timeout(spec.timeout, TcpStream::connect(&spec.address)).await {
        Ok(Ok(_stream)) => ProbeReport {
            success: true,
            latency: Some(start.elapsed()),
        },
        Ok(Err(e)) => {
            debug!("TCP probe error for {}: {}", spec.endpoint_key, e);
            ProbeReport {
                success: false,
                latency: None,
            }
        }
        Err(_) => {
            debug!("TCP probe timed out for {}", spec.endpoint_key);
            ProbeReport {
                success: false,
                latency: None,
            }
        }
    }
}

fn probe_url(address: &str, path: &str) -> String {
    let base = if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", address.trim_end_matches('/'))
    };
    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// 后台探测器
///
/// 独立于请求流量按固定间隔探测所有端点；整池Unhealthy时探测照常
/// 继续，恢复因此能被自动发现。
pub struct Prober {
    table: Arc<RoutingTable>,
    monitor: Arc<HealthMonitor>,
    executor: Arc<dyn ProbeExecutor>,
    timeout: Duration,
}

impl Prober {
    pub fn new(
        table: Arc<RoutingTable>,
        monitor: Arc<HealthMonitor>,
        executor: Arc<dyn ProbeExecutor>,
        timeout: Duration,
    ) -> Self {
        Self {
            table,
            monitor,
            executor,
            timeout,
        }
    }

    /// 执行一轮探测：按端点去重，逐端点并发执行，结束后发布新快照
    pub async fn probe_round(&self) {
        let services = self.table.snapshot();

        // 同一端点可能出现在多个服务里，只探测一次
        let mut specs: HashMap<String, ProbeSpec> = HashMap::new();
        for service in services.values() {
            for (endpoint, health) in service.endpoints_with_health() {
                if health.probe == ProbeKind::Passive {
                    continue;
                }
                specs
                    .entry(endpoint.key.clone())
                    .or_insert_with(|| ProbeSpec {
                        endpoint_key: endpoint.key.clone(),
                        address: endpoint.address.clone(),
                        kind: health.probe,
                        http_path: health.http_path.clone(),
                        timeout: self.timeout,
                    });
            }
        }

        if specs.is_empty() {
            trace!("Probe round skipped: no active-probe endpoints");
            return;
        }

        debug!("Starting probe round for {} endpoints", specs.len());

        let tasks = specs.into_values().map(|spec| {
            let executor = self.executor.clone();
            let monitor = self.monitor.clone();
            async move {
                let report = executor.probe(&spec).await;
                if report.success {
                    monitor.record_success(&spec.endpoint_key, report.latency);
                } else {
                    monitor.record_failure(&spec.endpoint_key);
                }
                report.success
            }
        });

        let results = futures::future::join_all(tasks).await;
        let succeeded = results.iter().filter(|ok| **ok).count();

        // 一轮结束统一发布，保证路由决策读到一轮内一致的视图
        self.monitor.publish();

        debug!(
            "Probe round complete: {}/{} endpoints up",
            succeeded,
            results.len()
        );
    }

    /// 按固定间隔持续探测，直到运行标志被清除
    pub async fn run(&self, is_running: Arc<tokio::sync::RwLock<bool>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            if !*is_running.read().await {
                break;
            }
            self.probe_round().await;
        }

        debug!("Prober loop stopped");
    }
}
