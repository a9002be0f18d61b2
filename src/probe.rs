use crate::parser::ProxyServer;
use crate::ports::PortAllocator;
use crate::xray::ConfigStore;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};

const READY_TIMEOUT: Duration = Duration::from_secs(2);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Window between the polite terminate and the hard kill.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const ENGINE_STARTUP_RETRIES: usize = 2;
const STDERR_CAPTURE_LINES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("engine failed to become ready")]
    EngineStartup,
    #[error("transport failure: {0}")]
    ProbeNetwork(String),
    #[error("probe returned HTTP {0}")]
    ProbeHttp(u16),
    #[error("probe deadline exceeded")]
    Timeout,
    #[error("latency {0} ms above cutoff")]
    TooSlow(u64),
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl ProbeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::EngineStartup => "engine_startup",
            ProbeError::ProbeNetwork(_) => "probe_network",
            ProbeError::ProbeHttp(_) => "probe_http",
            ProbeError::Timeout => "timeout",
            ProbeError::TooSlow(_) => "too_slow",
            ProbeError::Cancelled => "cancelled",
        }
    }
}

/// One measurement of one server against one probe URL. Only the successful
/// `(server, latency)` pair survives into a cache generation.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub server: ProxyServer,
    pub outcome: Result<u64, ProbeError>,
    pub probe_url: String,
    pub measured_at: SystemTime,
}

impl ProbeResult {
    pub fn latency_ms(&self) -> Option<u64> {
        self.outcome.as_ref().ok().copied()
    }

    pub fn cancelled(server: ProxyServer, probe_url: &str) -> Self {
        Self {
            server,
            outcome: Err(ProbeError::Cancelled),
            probe_url: probe_url.to_string(),
            measured_at: SystemTime::now(),
        }
    }
}

/// Runs one engine subprocess per job against an ephemeral local SOCKS port
/// and measures a proxied HTTP HEAD. Every exit path tears the job down:
/// process reaped, port released, config file removed.
pub struct ProbeRunner {
    engine_path: PathBuf,
    configs: Arc<ConfigStore>,
    ports: Arc<PortAllocator>,
    deadline: Duration,
    max_delay: Duration,
}

impl ProbeRunner {
    pub fn new(
        engine_path: PathBuf,
        configs: Arc<ConfigStore>,
        ports: Arc<PortAllocator>,
        deadline: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            engine_path,
            configs,
            ports,
            deadline,
            max_delay,
        }
    }

    pub async fn run(&self, server: &ProxyServer, probe_url: &str) -> ProbeResult {
        let mut outcome = self.run_attempt(server, probe_url).await;
        for attempt in 1..=ENGINE_STARTUP_RETRIES {
            if outcome != Err(ProbeError::EngineStartup) {
                break;
            }
            log::debug!(
                "Engine startup failed for {} (attempt {attempt}), retrying with a new port",
                server.address()
            );
            outcome = self.run_attempt(server, probe_url).await;
        }

        ProbeResult {
            server: server.clone(),
            outcome,
            probe_url: probe_url.to_string(),
            measured_at: SystemTime::now(),
        }
    }

    async fn run_attempt(&self, server: &ProxyServer, probe_url: &str) -> Result<u64, ProbeError> {
        let Some(port) = self.ports.allocate() else {
            log::warn!("Local port range exhausted, failing probe job");
            return Err(ProbeError::EngineStartup);
        };

        let result = self.probe_once(server, port, probe_url).await;

        self.configs.remove_config(port);
        self.ports.release(port);
        result
    }

    async fn probe_once(
        &self,
        server: &ProxyServer,
        port: u16,
        probe_url: &str,
    ) -> Result<u64, ProbeError> {
        // PREPARE
        let config_path = self.configs.write_config(server, port).map_err(|e| {
            log::debug!("Failed to synthesize config for {}: {e:#}", server.address());
            ProbeError::EngineStartup
        })?;

        // SPAWN
        let mut child = Command::new(&self.engine_path)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                log::warn!(
                    "Failed to spawn engine {}: {e}",
                    self.engine_path.display()
                );
                ProbeError::EngineStartup
            })?;

        let stderr_tail = capture_stderr(&mut child);

        // READY_WAIT + MEASURE under one deadline
        let work = async {
            self.wait_ready(&mut child, port).await?;
            self.measure(port, probe_url).await
        };
        let outcome = match timeout(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout),
        };

        // DONE: every path ends here
        self.shutdown_child(&mut child, port).await;

        if let Err(ref e) = outcome {
            let tail = stderr_tail.lock().expect("stderr buffer lock poisoned");
            if !tail.is_empty() {
                log::debug!(
                    "Engine stderr for {} ({}): {}",
                    server.address(),
                    e.kind(),
                    tail.join(" | ")
                );
            }
        }

        outcome.and_then(|latency_ms| classify_latency(latency_ms, self.max_delay))
    }

    async fn wait_ready(&self, child: &mut Child, port: u16) -> Result<(), ProbeError> {
        let ready_deadline = Instant::now() + READY_TIMEOUT;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                log::debug!("Engine on port {port} exited before readiness: {status}");
                return Err(ProbeError::EngineStartup);
            }

            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= ready_deadline {
                return Err(ProbeError::EngineStartup);
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// HEAD through the local SOCKS listener. Only this round-trip is timed;
    /// startup cost never counts toward the reported latency.
    async fn measure(&self, port: u16, probe_url: &str) -> Result<u64, ProbeError> {
        let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{port}"))
            .map_err(|e| ProbeError::ProbeNetwork(e.to_string()))?;

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .connect_timeout(self.deadline)
            .timeout(self.deadline)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ProbeError::ProbeNetwork(e.to_string()))?;

        let started = Instant::now();
        let response = client.head(probe_url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else {
                ProbeError::ProbeNetwork(e.to_string())
            }
        })?;
        let elapsed = started.elapsed();

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(elapsed.as_millis() as u64)
        } else {
            Err(ProbeError::ProbeHttp(status.as_u16()))
        }
    }

    async fn shutdown_child(&self, child: &mut Child, port: u16) {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
            log::debug!("Engine on port {port} ignored terminate, killing");
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill engine on port {port}: {e}");
            }
        }
    }
}

/// A measurement that completed is still a failure when it sits above the
/// latency cutoff. The cutoff itself is inclusive.
fn classify_latency(latency_ms: u64, max_delay: Duration) -> Result<u64, ProbeError> {
    if latency_ms > max_delay.as_millis() as u64 {
        Err(ProbeError::TooSlow(latency_ms))
    } else {
        Ok(latency_ms)
    }
}

/// Drain the child's stderr into a bounded buffer. The reader task ends on
/// pipe EOF when the process dies.
fn capture_stderr(child: &mut Child) -> Arc<Mutex<Vec<String>>> {
    let tail = Arc::new(Mutex::new(Vec::new()));
    if let Some(stderr) = child.stderr.take() {
        let buffer = Arc::clone(&tail);
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = match buffer.lock() {
                    Ok(buf) => buf,
                    Err(_) => break,
                };
                if buf.len() == STDERR_CAPTURE_LINES {
                    buf.remove(0);
                }
                buf.push(line);
            }
        });
    }
    tail
}
