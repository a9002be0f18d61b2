use crate::parser::ProxyServer;
use crate::probe::ProbeResult;
use arc_swap::ArcSwapOption;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub server: ProxyServer,
    pub latency_ms: u64,
}

/// Immutable ranked view. Never mutated after publication; superseded
/// snapshots die when the last reader drops its Arc.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub generation_id: u64,
    pub built_at: SystemTime,
    pub entries: Vec<CacheEntry>,
}

/// Both ranked views of one refresh, swapped as a unit so a reader can
/// never pair top-K of one generation with the working set of another.
#[derive(Debug)]
pub struct Generation {
    pub top_k: CacheSnapshot,
    pub all_working: CacheSnapshot,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.top_k.generation_id
    }
}

pub enum PublishOutcome {
    Published(Arc<Generation>),
    /// Zero successful probes: the previous generation stays visible and
    /// the generation counter does not advance.
    Degraded,
}

struct SiteEntry {
    snapshot: Arc<CacheSnapshot>,
    expires_at: Instant,
}

pub struct Cache {
    published: ArcSwapOption<Generation>,
    publish_lock: Mutex<()>,
    generation_counter: AtomicU64,
    top_k: usize,
    site_ttl: Duration,
    site_table: AsyncMutex<HashMap<String, SiteEntry>>,
    site_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Cache {
    pub fn new(top_k: usize, site_ttl: Duration) -> Self {
        Self {
            published: ArcSwapOption::from(None),
            publish_lock: Mutex::new(()),
            generation_counter: AtomicU64::new(0),
            top_k,
            site_ttl,
            site_table: AsyncMutex::new(HashMap::new()),
            site_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Lock-free snapshot read.
    pub fn load(&self) -> Option<Arc<Generation>> {
        self.published.load_full()
    }

    pub fn current_generation_id(&self) -> u64 {
        self.generation_counter.load(Ordering::Acquire)
    }

    /// Build and swap in the views for one completed refresh. The mutex
    /// covers only counter bump + pointer swap; readers never take it.
    pub fn publish(&self, results: &[ProbeResult]) -> PublishOutcome {
        let ranked = rank_results(results);
        if ranked.is_empty() {
            return PublishOutcome::Degraded;
        }

        let _guard = self.publish_lock.lock().expect("publish lock poisoned");
        let id = self.generation_counter.load(Ordering::Acquire) + 1;
        let built_at = SystemTime::now();

        let top_k = CacheSnapshot {
            generation_id: id,
            built_at,
            entries: ranked.iter().take(self.top_k).cloned().collect(),
        };
        let all_working = CacheSnapshot {
            generation_id: id,
            built_at,
            entries: ranked,
        };

        let generation = Arc::new(Generation { top_k, all_working });
        self.published.store(Some(Arc::clone(&generation)));
        self.generation_counter.store(id, Ordering::Release);

        PublishOutcome::Published(generation)
    }

    /// Per-key refresh guard. Callers hold this across check-probe-store so
    /// at most one refresh per probe URL is in flight; latecomers block on
    /// it and then find the freshly stored entry.
    pub async fn site_lock(&self, probe_url: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.site_locks.lock().await;
        Arc::clone(
            locks
                .entry(probe_url.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    pub async fn site_get_fresh(&self, probe_url: &str) -> Option<Arc<CacheSnapshot>> {
        let table = self.site_table.lock().await;
        let entry = table.get(probe_url)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(Arc::clone(&entry.snapshot))
    }

    pub async fn site_store(&self, probe_url: &str, results: &[ProbeResult]) -> Arc<CacheSnapshot> {
        let built_at = results
            .iter()
            .map(|r| r.measured_at)
            .max()
            .unwrap_or_else(SystemTime::now);
        let snapshot = Arc::new(CacheSnapshot {
            generation_id: self.current_generation_id(),
            built_at,
            entries: rank_results(results),
        });

        let mut table = self.site_table.lock().await;
        table.insert(
            probe_url.to_string(),
            SiteEntry {
                snapshot: Arc::clone(&snapshot),
                expires_at: Instant::now() + self.site_ttl,
            },
        );
        snapshot
    }

    /// Site views currently inside their TTL, for the publish hooks.
    pub async fn site_views(&self) -> Vec<(String, Arc<CacheSnapshot>)> {
        let now = Instant::now();
        self.site_table
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(url, entry)| (url.clone(), Arc::clone(&entry.snapshot)))
            .collect()
    }
}

/// Successful probes sorted ascending by latency, ties broken by raw URI so
/// identical inputs always rank identically.
pub fn rank_results(results: &[ProbeResult]) -> Vec<CacheEntry> {
    let mut entries: Vec<CacheEntry> = results
        .iter()
        .filter_map(|r| {
            r.latency_ms().map(|latency_ms| CacheEntry {
                server: r.server.clone(),
                latency_ms,
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        a.latency_ms
            .cmp(&b.latency_ms)
            .then_with(|| a.server.raw_uri().cmp(b.server.raw_uri()))
    });
    entries
}

pub fn to_json(snapshot: &CacheSnapshot) -> Value {
    let entries: Vec<Value> = snapshot
        .entries
        .iter()
        .map(|entry| {
            json!({
                "raw_uri": entry.server.raw_uri(),
                "kind": entry.server.kind(),
                "address": entry.server.address(),
                "port": entry.server.port(),
                "latency_ms": entry.latency_ms,
                "tag": entry.server.tag(),
            })
        })
        .collect();
    Value::Array(entries)
}

pub fn to_raw(snapshot: &CacheSnapshot) -> String {
    snapshot
        .entries
        .iter()
        .map(|entry| entry.server.raw_uri())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn to_base64(snapshot: &CacheSnapshot) -> String {
    STANDARD.encode(to_raw(snapshot))
}
