use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

static INSTANT_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// 容量驱逐时的随机采样大小
const EVICTION_SAMPLE_SIZE: usize = 5;

/// 亲和条目
#[derive(Debug)]
struct AffinityEntry {
    /// 端点键："集群名:地址"
    target: String,
    last_refresh: AtomicU64,
    hit_count: AtomicU64,
}

impl AffinityEntry {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            last_refresh: AtomicU64::new(now_nanos()),
            hit_count: AtomicU64::new(0),
        }
    }

    fn age(&self) -> Duration {
        Duration::from_nanos(now_nanos().saturating_sub(self.last_refresh.load(Ordering::Relaxed)))
    }

    fn refresh(&self) {
        self.last_refresh.store(now_nanos(), Ordering::Relaxed);
    }
}

/// 会话亲和存储
///
/// 基于分片并发映射，不同键的get/put互不阻塞，sweep不会卡住并发查找。
/// 仅按TTL过期；容量上限是防御性的，超出后按最久未刷新采样驱逐。
pub struct AffinityStore {
    entries: DashMap<String, AffinityEntry>,
    ttl: Duration,
    max_entries: usize,
    // 统计信息
    total_lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

impl AffinityStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
            total_lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// 查找粘性目标，过期条目在查找时惰性清除
    pub fn get(&self, sticky_key: &str) -> Option<String> {
        self.total_lookups.fetch_add(1, Ordering::Relaxed);

        let found_expired = match self.entries.get(sticky_key) {
            Some(entry) => {
                if entry.age() <= self.ttl {
                    entry.hit_count.fetch_add(1, Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!("Affinity hit for key '{}'", sticky_key);
                    return Some(entry.target.clone());
                }
                true
            }
            None => false,
        };

        if found_expired && self.entries.remove(sticky_key).is_some() {
            self.expired.fetch_add(1, Ordering::Relaxed);
            debug!("Affinity entry expired for key '{}'", sticky_key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// 建立或覆盖粘性映射并刷新TTL
    pub fn put(&self, sticky_key: &str, target: &str) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(sticky_key) {
            self.evict_sampled();
        }

        self.entries
            .insert(sticky_key.to_string(), AffinityEntry::new(target));
        trace!("Affinity entry stored: '{}' -> '{}'", sticky_key, target);
    }

    /// 刷新现有条目的TTL（选择命中亲和目标时调用）
    pub fn refresh(&self, sticky_key: &str) {
        if let Some(entry) = self.entries.get(sticky_key) {
            entry.refresh();
        }
    }

    /// 周期清扫过期条目，返回清除数量
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.age() <= self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Affinity sweep removed {} expired entries", removed);
        }
        removed
    }

    /// 超出容量时按最久未刷新驱逐（随机采样）
    fn evict_sampled(&self) {
        let keys: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if keys.is_empty() {
            return;
        }

        let mut rng = rand::rng();
        let mut candidates = Vec::with_capacity(EVICTION_SAMPLE_SIZE);
        for _ in 0..EVICTION_SAMPLE_SIZE {
            let key = &keys[rng.random_range(0..keys.len())];
            if let Some(entry) = self.entries.get(key) {
                candidates.push((key.clone(), entry.last_refresh.load(Ordering::Relaxed)));
            }
        }

        if let Some((oldest_key, _)) = candidates
            .into_iter()
            .min_by_key(|&(_, last_refresh)| last_refresh)
        {
            if self.entries.remove(&oldest_key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted affinity entry '{}' (capacity cap)", oldest_key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 获取亲和统计信息
    pub fn stats(&self) -> AffinityStats {
        let total = self.total_lookups.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);

        AffinityStats {
            entries: self.entries.len(),
            total_lookups: total,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
            expired: self.expired.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// 亲和统计信息
#[derive(Debug, Clone, serde::Serialize)]
pub struct AffinityStats {
    pub entries: usize,
    pub total_lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub expired: u64,
    pub evictions: u64,
}

fn now_nanos() -> u64 {
    Instant::now().duration_since(*INSTANT_EPOCH).as_nanos() as u64
}
