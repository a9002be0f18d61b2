use crate::cache::{Cache, CacheSnapshot, PublishOutcome};
use crate::fetcher::SourceFetcher;
use crate::mirror::PublishHook;
use crate::parser::{ProxyServer, parse_server_list};
use crate::scheduler::{Scheduler, cap_servers};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub sources_failed: usize,
    pub parsed: usize,
    pub tested: usize,
    pub working: usize,
    pub generation_id: Option<u64>,
}

/// Everything one refresh cycle needs: fetch, parse, dedupe, probe, publish.
pub struct RefreshEngine {
    fetcher: SourceFetcher,
    scheduler: Scheduler,
    cache: Arc<Cache>,
    hooks: Vec<Arc<dyn PublishHook>>,
    sources: Vec<String>,
    probe_url: String,
    low_bandwidth_cap: Option<usize>,
}

impl RefreshEngine {
    pub fn new(
        fetcher: SourceFetcher,
        scheduler: Scheduler,
        cache: Arc<Cache>,
        hooks: Vec<Arc<dyn PublishHook>>,
        sources: Vec<String>,
        probe_url: String,
        low_bandwidth_cap: Option<usize>,
    ) -> Self {
        Self {
            fetcher,
            scheduler,
            cache,
            hooks,
            sources,
            probe_url,
            low_bandwidth_cap,
        }
    }

    pub async fn refresh_once(&self) -> RefreshSummary {
        log::info!("Refresh cycle started ({} sources)", self.sources.len());

        let (lines, reports) = self.fetcher.fetch_all(&self.sources).await;
        let failed_sources: Vec<&str> = reports
            .iter()
            .filter(|r| r.result.is_err())
            .map(|r| r.url.as_str())
            .collect();
        if !failed_sources.is_empty() {
            log::debug!("Sources skipped this cycle: {failed_sources:?}");
        }
        let sources_failed = failed_sources.len();

        let servers = parse_server_list(&lines);
        let parsed = servers.len();
        let servers = dedupe_servers(servers);
        let deduped = servers.len();
        let servers = cap_servers(servers, self.low_bandwidth_cap);

        if servers.is_empty() {
            log::warn!(
                "Refresh degraded: no servers to test ({sources_failed} of {} sources failed)",
                self.sources.len()
            );
            return RefreshSummary {
                sources_failed,
                parsed,
                tested: 0,
                working: 0,
                generation_id: None,
            };
        }

        log::info!(
            "Testing {} servers ({parsed} parsed, {deduped} unique)",
            servers.len()
        );
        let results = self.scheduler.run(&servers, &self.probe_url).await;

        let mut error_counts: HashMap<&'static str, usize> = HashMap::new();
        for result in &results {
            if let Err(e) = &result.outcome {
                *error_counts.entry(e.kind()).or_default() += 1;
                log::debug!(
                    "{} via {} failed: {e}",
                    result.server.address(),
                    result.probe_url
                );
            }
        }
        let working = results.iter().filter(|r| r.outcome.is_ok()).count();
        log::info!(
            "Probe results: {working}/{} working, failures: {error_counts:?}",
            results.len()
        );

        let generation_id = match self.cache.publish(&results) {
            PublishOutcome::Published(generation) => {
                let id = generation.id();
                log::info!(
                    "Published generation {id} (top {}, working {})",
                    generation.top_k.entries.len(),
                    generation.all_working.entries.len()
                );

                let site_views = self.cache.site_views().await;
                for hook in &self.hooks {
                    let hook = Arc::clone(hook);
                    let generation = Arc::clone(&generation);
                    let site_views = site_views.clone();
                    tokio::spawn(async move { hook.on_publish(generation, site_views).await });
                }
                Some(id)
            }
            PublishOutcome::Degraded => {
                log::warn!("Refresh degraded: zero successful probes, keeping previous snapshot");
                None
            }
        };

        RefreshSummary {
            sources_failed,
            parsed,
            tested: results.len(),
            working,
            generation_id,
        }
    }

    /// Fetch-or-refresh of one site-specific view. The per-key lock means a
    /// burst of callers performs one probe run; everyone else finds the
    /// stored entry when the lock frees. Returns None only on cold start.
    pub async fn site_refresh(&self, probe_url: &str) -> Option<Arc<CacheSnapshot>> {
        let lock = self.cache.site_lock(probe_url).await;
        let _guard = lock.lock().await;

        if let Some(snapshot) = self.cache.site_get_fresh(probe_url).await {
            return Some(snapshot);
        }

        let generation = self.cache.load()?;
        let servers: Vec<ProxyServer> = generation
            .all_working
            .entries
            .iter()
            .map(|e| e.server.clone())
            .collect();

        log::info!(
            "Site view for {probe_url}: probing {} working servers",
            servers.len()
        );
        let results = self.scheduler.run(&servers, probe_url).await;
        Some(self.cache.site_store(probe_url, &results).await)
    }
}

/// First occurrence wins; ordering of the surviving servers is preserved so
/// the low-bandwidth prefix stays deterministic.
pub fn dedupe_servers(servers: Vec<ProxyServer>) -> Vec<ProxyServer> {
    let mut seen: HashSet<String> = HashSet::with_capacity(servers.len());
    servers
        .into_iter()
        .filter(|server| seen.insert(server.raw_uri().to_string()))
        .collect()
}

/// Requests a refresh from outside the loop and waits for the cycle that
/// answers it.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<oneshot::Sender<RefreshSummary>>,
}

impl RefreshHandle {
    pub async fn request_refresh(&self) -> Option<RefreshSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }
}

/// The single long-running driver. Periodic ticks and on-demand requests
/// both land here; requests arriving while a cycle is running attach to it
/// instead of starting a second one.
pub fn spawn_refresh_loop(
    engine: Arc<RefreshEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (RefreshHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<oneshot::Sender<RefreshSummary>>(32);
    let handle = RefreshHandle { tx };

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requests_open = true;

        loop {
            let mut waiters: Vec<oneshot::Sender<RefreshSummary>> = Vec::new();

            tokio::select! {
                _ = ticker.tick() => {}
                request = rx.recv(), if requests_open => match request {
                    Some(responder) => waiters.push(responder),
                    None => {
                        requests_open = false;
                        continue;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let refresh = engine.refresh_once();
            tokio::pin!(refresh);
            let summary = loop {
                tokio::select! {
                    summary = &mut refresh => break summary,
                    request = rx.recv(), if requests_open => match request {
                        Some(responder) => waiters.push(responder),
                        None => requests_open = false,
                    },
                }
            };

            log::info!(
                "Cycle done: generation {:?}, {}/{} working, {} parsed, {} sources failed",
                summary.generation_id,
                summary.working,
                summary.tested,
                summary.parsed,
                summary.sources_failed
            );
            for waiter in waiters {
                let _ = waiter.send(summary.clone());
            }
        }

        log::info!("Refresh loop stopped");
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_server_url;
    use crate::probe::{ProbeError, ProbeResult};
    use crate::scheduler::{ProbeJob, SchedulerConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Servers whose hostname contains "even" succeed, the rest time out.
    struct AlternatingJob {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProbeJob for AlternatingJob {
        async fn probe(&self, server: &ProxyServer, probe_url: &str) -> ProbeResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            ProbeResult {
                server: server.clone(),
                outcome: if server.address().contains("even") {
                    Ok(100 + n as u64)
                } else {
                    Err(ProbeError::Timeout)
                },
                probe_url: probe_url.to_string(),
                measured_at: SystemTime::now(),
            }
        }
    }

    fn engine_with(
        sources: Vec<String>,
        job: Arc<dyn ProbeJob>,
        cache: Arc<Cache>,
    ) -> Arc<RefreshEngine> {
        let (_tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            job,
            SchedulerConfig {
                max_concurrent: 4,
                batch_size: 16,
            },
            rx,
        );
        Arc::new(RefreshEngine::new(
            SourceFetcher::new().unwrap(),
            scheduler,
            cache,
            Vec::new(),
            sources,
            "http://probe.example/".to_string(),
            None,
        ))
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence() {
        let servers = vec![
            parse_server_url("vless://u@a.example:443?type=tcp#1").unwrap(),
            parse_server_url("vless://u@b.example:443?type=tcp").unwrap(),
            parse_server_url("vless://u@a.example:443?type=tcp#1").unwrap(),
        ];

        let deduped = dedupe_servers(servers);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].address(), "a.example");
        assert_eq!(deduped[1].address(), "b.example");
    }

    #[tokio::test]
    async fn test_refresh_cycle_publishes_working_set() {
        let source = MockServer::start().await;
        let body = "vless://u@even0.example:443?type=tcp\n\
                    vless://u@odd1.example:443?type=tcp\n\
                    vless://u@even2.example:443?type=tcp\n\
                    vless://u@even0.example:443?type=tcp";
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&source)
            .await;

        let cache = Arc::new(Cache::new(25, Duration::from_secs(3600)));
        let engine = engine_with(
            vec![format!("{}/sub", source.uri())],
            Arc::new(AlternatingJob {
                calls: AtomicUsize::new(0),
            }),
            Arc::clone(&cache),
        );

        let summary = engine.refresh_once().await;

        assert_eq!(summary.sources_failed, 0);
        assert_eq!(summary.parsed, 4);
        assert_eq!(summary.tested, 3);
        assert_eq!(summary.working, 2);
        assert_eq!(summary.generation_id, Some(1));

        let generation = cache.load().unwrap();
        assert_eq!(generation.all_working.entries.len(), 2);
        assert!(
            generation
                .all_working
                .entries
                .iter()
                .all(|e| e.server.address().contains("even"))
        );
    }

    #[tokio::test]
    async fn test_all_sources_down_is_degraded() {
        let source = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&source)
            .await;

        let cache = Arc::new(Cache::new(25, Duration::from_secs(3600)));
        // Seed a generation first.
        cache.publish(&[ProbeResult {
            server: parse_server_url("vless://u@seed.example:443?type=tcp").unwrap(),
            outcome: Ok(42),
            probe_url: "http://probe.example/".to_string(),
            measured_at: SystemTime::now(),
        }]);

        let engine = engine_with(
            vec![format!("{}/sub", source.uri())],
            Arc::new(AlternatingJob {
                calls: AtomicUsize::new(0),
            }),
            Arc::clone(&cache),
        );

        let summary = engine.refresh_once().await;

        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.generation_id, None);
        assert_eq!(cache.load().unwrap().id(), 1);
        assert_eq!(
            cache.load().unwrap().all_working.entries[0].server.address(),
            "seed.example"
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_cycle() {
        let source = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("vless://u@even0.example:443?type=tcp"),
            )
            .mount(&source)
            .await;

        let job = Arc::new(AlternatingJob {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(Cache::new(25, Duration::from_secs(3600)));
        let engine = engine_with(
            vec![format!("{}/sub", source.uri())],
            job.clone(),
            Arc::clone(&cache),
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn_refresh_loop(engine, Duration::from_secs(3600), shutdown_rx);

        // The interval's immediate first tick runs one cycle; both requests
        // either attach to it or share the next one.
        let (first, second) = tokio::join!(handle.request_refresh(), handle.request_refresh());
        assert!(first.is_some());
        assert!(second.is_some());

        // One probe per cycle; at most two cycles can have run (startup tick
        // plus the one answering the requests).
        assert!(job.calls.load(Ordering::SeqCst) <= 2);
        assert!(cache.load().is_some());

        task.abort();
    }

    #[tokio::test]
    async fn test_site_refresh_probes_working_set_and_caches() {
        let cache = Arc::new(Cache::new(25, Duration::from_secs(3600)));
        cache.publish(&[ProbeResult {
            server: parse_server_url("vless://u@even0.example:443?type=tcp").unwrap(),
            outcome: Ok(42),
            probe_url: "http://probe.example/".to_string(),
            measured_at: SystemTime::now(),
        }]);

        let job = Arc::new(AlternatingJob {
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(Vec::new(), job.clone(), Arc::clone(&cache));

        let first = engine.site_refresh("https://youtube.com").await.unwrap();
        assert_eq!(first.entries.len(), 1);
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);

        // Within the TTL the stored entry answers without new probes.
        let second = engine.site_refresh("https://youtube.com").await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(job.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_site_refresh_cold_start_is_none() {
        let cache = Arc::new(Cache::new(25, Duration::from_secs(3600)));
        let engine = engine_with(
            Vec::new(),
            Arc::new(AlternatingJob {
                calls: AtomicUsize::new(0),
            }),
            cache,
        );

        assert!(engine.site_refresh("https://youtube.com").await.is_none());
    }
}
