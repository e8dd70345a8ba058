use arc_swap::ArcSwap;
use ferry_core::config::model::HealthCheckConfig;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

static INSTANT_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// 被动反馈触发的快照重建节流间隔
const PASSIVE_PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// 端点健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// 降权但不排除：连续失败达到K (< N) 时进入
    Degraded,
    Unhealthy,
}

/// 状态机阈值（来自集群健康检查配置）
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub degraded: u32,
    pub unhealthy: u32,
    pub recovery: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded: 2,
            unhealthy: 4,
            recovery: 2,
        }
    }
}

impl From<&HealthCheckConfig> for HealthThresholds {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            degraded: config.degraded_threshold,
            unhealthy: config.unhealthy_threshold,
            recovery: config.recovery_threshold,
        }
    }
}

/// 健康状态变更事件
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub endpoint: String,
    pub from: HealthState,
    pub to: HealthState,
}

/// 注册表内部条目，仅由HealthMonitor写入
#[derive(Debug)]
struct EndpointHealth {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    latency_ms: Option<f64>,
    thresholds: HealthThresholds,
}

impl EndpointHealth {
    fn new(thresholds: HealthThresholds) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            latency_ms: None,
            thresholds,
        }
    }
}

/// 快照内的不可变端点视图
#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointHealthView {
    pub state: HealthState,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// 选择逻辑读取的唯一接口：一次路由决策看到一个内部一致的视图
#[derive(Debug, Default)]
pub struct HealthSnapshot {
    pub version: u64,
    pub entries: HashMap<String, EndpointHealthView>,
}

impl HealthSnapshot {
    /// 未知端点默认健康，新发现的端点立即可路由
    pub fn state_of(&self, endpoint_key: &str) -> HealthState {
        self.entries
            .get(endpoint_key)
            .map(|entry| entry.state)
            .unwrap_or(HealthState::Healthy)
    }

    pub fn latency_of(&self, endpoint_key: &str) -> Option<f64> {
        self.entries
            .get(endpoint_key)
            .and_then(|entry| entry.latency_ms)
    }
}

/// 健康监视器
///
/// 端点健康字段的唯一写入方。探测器和被动反馈都经由record_*进入，
/// 请求路径只读原子替换的快照，从不等待探测执行。
pub struct HealthMonitor {
    entries: RwLock<HashMap<String, EndpointHealth>>,
    snapshot: ArcSwap<HealthSnapshot>,
    version: AtomicU64,
    last_publish_nanos: AtomicU64,
    events: broadcast::Sender<HealthEvent>,
    /// EWMA平滑系数：新样本权重
    alpha: f64,
}

impl HealthMonitor {
    pub fn new(alpha: f64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(HealthSnapshot::default()),
            version: AtomicU64::new(0),
            last_publish_nanos: AtomicU64::new(0),
            events,
            alpha,
        }
    }

    /// 注册端点，已存在时保持现有状态（表重建不重置健康历史）
    pub fn register(&self, endpoint_key: &str, thresholds: HealthThresholds) {
        let mut entries = self.entries.write();
        entries
            .entry(endpoint_key.to_string())
            .and_modify(|entry| entry.thresholds = thresholds)
            .or_insert_with(|| EndpointHealth::new(thresholds));
    }

    /// 丢弃不在给定集合中的端点（端点从配置/发现中消失后调用）
    pub fn retain(&self, endpoint_keys: &HashSet<String>) {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|key, _| endpoint_keys.contains(key));
            before - entries.len()
        };
        if removed > 0 {
            debug!("Dropped health state for {} removed endpoints", removed);
            self.publish();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// 记录成功（探测或被动反馈）
    pub fn record_success(&self, endpoint_key: &str, latency: Option<Duration>) {
        let transition = {
            let mut entries = self.entries.write();
            let entry = entries
                .entry(endpoint_key.to_string())
                .or_insert_with(|| EndpointHealth::new(HealthThresholds::default()));

            entry.consecutive_successes += 1;
            entry.consecutive_failures = 0;

            if let Some(sample) = latency {
                let sample_ms = sample.as_secs_f64() * 1000.0;
                entry.latency_ms = Some(match entry.latency_ms {
                    Some(previous) => self.alpha * sample_ms + (1.0 - self.alpha) * previous,
                    None => sample_ms,
                });
            }

            if entry.state != HealthState::Healthy
                && entry.consecutive_successes >= entry.thresholds.recovery
            {
                let from = entry.state;
                entry.state = HealthState::Healthy;
                entry.consecutive_successes = 0;
                entry.consecutive_failures = 0;
                Some(from)
            } else {
                None
            }
        };

        if let Some(from) = transition {
            info!(
                "Endpoint {} recovered: {:?} -> Healthy",
                endpoint_key, from
            );
            self.emit(endpoint_key, from, HealthState::Healthy);
            self.publish();
        } else {
            self.publish_throttled();
        }
    }

    /// 记录失败（探测超时同样计为失败）
    pub fn record_failure(&self, endpoint_key: &str) {
        let transition = {
            let mut entries = self.entries.write();
            let entry = entries
                .entry(endpoint_key.to_string())
                .or_insert_with(|| EndpointHealth::new(HealthThresholds::default()));

            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;

            if entry.state != HealthState::Unhealthy
                && entry.consecutive_failures >= entry.thresholds.unhealthy
            {
                let from = entry.state;
                entry.state = HealthState::Unhealthy;
                entry.consecutive_failures = 0;
                entry.consecutive_successes = 0;
                Some((from, HealthState::Unhealthy))
            } else if entry.state == HealthState::Healthy
                && entry.consecutive_failures >= entry.thresholds.degraded
            {
                // 失败计数保留：Degraded在K处进入，同一串失败在N处升级为Unhealthy
                entry.state = HealthState::Degraded;
                Some((HealthState::Healthy, HealthState::Degraded))
            } else {
                None
            }
        };

        if let Some((from, to)) = transition {
            info!("Endpoint {} transitioned: {:?} -> {:?}", endpoint_key, from, to);
            self.emit(endpoint_key, from, to);
            self.publish();
        } else {
            self.publish_throttled();
        }
    }

    /// 请求路径读取的快照，从不阻塞在探测上
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot.load_full()
    }

    /// 重建并原子替换快照
    pub fn publish(&self) {
        let entries = self.entries.read();
        let views: HashMap<String, EndpointHealthView> = entries
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    EndpointHealthView {
                        state: entry.state,
                        latency_ms: entry.latency_ms,
                        consecutive_failures: entry.consecutive_failures,
                        consecutive_successes: entry.consecutive_successes,
                    },
                )
            })
            .collect();
        drop(entries);

        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_publish_nanos
            .store(now_nanos(), Ordering::Relaxed);
        self.snapshot.store(Arc::new(HealthSnapshot {
            version,
            entries: views,
        }));
    }

    /// 无状态变更时的节流发布：延迟样本最终进入快照，但不让每次被动反馈
    /// 都付出整表重建的代价
    fn publish_throttled(&self) {
        let now = now_nanos();
        let last = self.last_publish_nanos.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= PASSIVE_PUBLISH_INTERVAL.as_nanos() as u64
            && self
                .last_publish_nanos
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.publish();
        }
    }

    fn emit(&self, endpoint_key: &str, from: HealthState, to: HealthState) {
        // 无订阅者时send返回Err，忽略即可
        let _ = self.events.send(HealthEvent {
            endpoint: endpoint_key.to_string(),
            from,
            to,
        });
    }
}

fn now_nanos() -> u64 {
    Instant::now().duration_since(*INSTANT_EPOCH).as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(0.3)
    }

    #[test]
    fn test_unknown_endpoint_defaults_healthy() {
        let monitor = monitor();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.state_of("local:10.0.0.1:80"), HealthState::Healthy);
    }

    #[test]
    fn test_degraded_then_unhealthy_on_same_failure_run() {
        let monitor = monitor();
        monitor.register("local:a:80", HealthThresholds::default());

        monitor.record_failure("local:a:80");
        assert_eq!(monitor.snapshot().state_of("local:a:80"), HealthState::Healthy);

        // K=2次失败进入Degraded
        monitor.record_failure("local:a:80");
        assert_eq!(monitor.snapshot().state_of("local:a:80"), HealthState::Degraded);

        // 同一串失败到N=4升级为Unhealthy，不需要重新数4次
        monitor.record_failure("local:a:80");
        monitor.record_failure("local:a:80");
        assert_eq!(
            monitor.snapshot().state_of("local:a:80"),
            HealthState::Unhealthy
        );
    }

    #[test]
    fn test_recovery_requires_consecutive_successes() {
        let monitor = monitor();
        monitor.register("local:a:80", HealthThresholds::default());

        for _ in 0..4 {
            monitor.record_failure("local:a:80");
        }
        assert_eq!(
            monitor.snapshot().state_of("local:a:80"),
            HealthState::Unhealthy
        );

        // 一次成功不够（M=2）
        monitor.record_success("local:a:80", None);
        assert_eq!(
            monitor.snapshot().state_of("local:a:80"),
            HealthState::Unhealthy
        );

        // 中间一次失败重置成功计数
        monitor.record_failure("local:a:80");
        monitor.record_success("local:a:80", None);
        assert_eq!(
            monitor.snapshot().state_of("local:a:80"),
            HealthState::Unhealthy
        );

        monitor.record_success("local:a:80", None);
        assert_eq!(
            monitor.snapshot().state_of("local:a:80"),
            HealthState::Healthy
        );
    }

    #[test]
    fn test_ewma_latency_smoothing() {
        let monitor = monitor();
        monitor.register("local:a:80", HealthThresholds::default());

        monitor.record_success("local:a:80", Some(Duration::from_millis(100)));
        monitor.publish();
        let first = monitor
            .snapshot()
            .latency_of("local:a:80")
            .expect("latency recorded");
        assert!((first - 100.0).abs() < 1e-9);

        monitor.record_success("local:a:80", Some(Duration::from_millis(200)));
        monitor.publish();
        let second = monitor
            .snapshot()
            .latency_of("local:a:80")
            .expect("latency recorded");
        // 0.3 * 200 + 0.7 * 100 = 130
        assert!((second - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_events_emitted_on_transition() {
        let monitor = monitor();
        monitor.register("local:a:80", HealthThresholds::default());
        let mut events = monitor.subscribe();

        for _ in 0..4 {
            monitor.record_failure("local:a:80");
        }

        let first = events.try_recv().expect("degraded event");
        assert_eq!(first.from, HealthState::Healthy);
        assert_eq!(first.to, HealthState::Degraded);

        let second = events.try_recv().expect("unhealthy event");
        assert_eq!(second.to, HealthState::Unhealthy);
    }

    #[test]
    fn test_retain_drops_removed_endpoints() {
        let monitor = monitor();
        monitor.register("local:a:80", HealthThresholds::default());
        monitor.register("local:b:80", HealthThresholds::default());
        monitor.publish();

        let mut keep = HashSet::new();
        keep.insert("local:a:80".to_string());
        monitor.retain(&keep);

        let snapshot = monitor.snapshot();
        assert!(snapshot.entries.contains_key("local:a:80"));
        assert!(!snapshot.entries.contains_key("local:b:80"));
    }

    #[test]
    fn test_snapshot_version_increases() {
        let monitor = monitor();
        let before = monitor.snapshot().version;
        monitor.publish();
        monitor.publish();
        assert!(monitor.snapshot().version > before);
    }
}
