use crate::parser::ProxyServer;
use crate::probe::{ProbeResult, ProbeRunner};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};

/// Seam between the pool and the per-server measurement so the dispatch
/// contract is testable without spawning engine processes.
#[async_trait]
pub trait ProbeJob: Send + Sync {
    async fn probe(&self, server: &ProxyServer, probe_url: &str) -> ProbeResult;
}

#[async_trait]
impl ProbeJob for ProbeRunner {
    async fn probe(&self, server: &ProxyServer, probe_url: &str) -> ProbeResult {
        self.run(server, probe_url).await
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub batch_size: usize,
}

/// Bounded-concurrency dispatcher: fans servers across at most
/// `max_concurrent` live jobs, one batch at a time, returning exactly one
/// result per input. After shutdown flips, no new job launches; jobs already
/// running reach their own teardown via the per-job deadline.
pub struct Scheduler {
    runner: Arc<dyn ProbeJob>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn ProbeJob>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            runner,
            config,
            shutdown,
        }
    }

    pub async fn run(&self, servers: &[ProxyServer], probe_url: &str) -> Vec<ProbeResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut results = Vec::with_capacity(servers.len());

        for batch in servers.chunks(self.config.batch_size.max(1)) {
            if *self.shutdown.borrow() {
                results.extend(
                    batch
                        .iter()
                        .map(|s| ProbeResult::cancelled(s.clone(), probe_url)),
                );
                continue;
            }

            let handles: Vec<_> = batch
                .iter()
                .map(|server| {
                    let runner = Arc::clone(&self.runner);
                    let semaphore = Arc::clone(&semaphore);
                    let shutdown = self.shutdown.clone();
                    let server = server.clone();
                    let probe_url = probe_url.to_string();
                    tokio::spawn(async move {
                        let Ok(_permit) = semaphore.acquire().await else {
                            return ProbeResult::cancelled(server, &probe_url);
                        };
                        if *shutdown.borrow() {
                            return ProbeResult::cancelled(server, &probe_url);
                        }
                        runner.probe(&server, &probe_url).await
                    })
                })
                .collect();

            for (joined, server) in join_all(handles).await.into_iter().zip(batch) {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        log::error!("Probe task panicked: {e}");
                        results.push(ProbeResult::cancelled(server.clone(), probe_url));
                    }
                }
            }
        }

        results
    }
}

/// Deterministic prefix applied after dedupe when running in low-bandwidth
/// mode.
pub fn cap_servers(mut servers: Vec<ProxyServer>, cap: Option<usize>) -> Vec<ProxyServer> {
    if let Some(cap) = cap
        && servers.len() > cap
    {
        log::info!(
            "Low-bandwidth mode: testing {cap} of {} deduplicated servers",
            servers.len()
        );
        servers.truncate(cap);
    }
    servers
}
