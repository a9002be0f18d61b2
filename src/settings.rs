use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::time::Duration;

/// Seed subscription sources used when SUB_URLS is not set.
pub const DEFAULT_SOURCES: &[&str] = &[
    "https://raw.githubusercontent.com/mahdibland/V2RayAggregator/master/sub/sub_merge.txt",
    "https://raw.githubusercontent.com/barry-far/V2ray-Configs/main/All_Configs_Sub.txt",
    "https://raw.githubusercontent.com/soroushmirzaei/telegram-configs-collector/main/splitted/mixed",
];

pub const DEFAULT_PROBE_URL: &str = "http://www.google.com/generate_204";

#[derive(Debug, Clone)]
pub struct Settings {
    pub sub_urls: Vec<String>,
    pub xray_path: PathBuf,
    pub cache_interval: Duration,
    pub max_delay: Duration,
    pub test_timeout: Duration,
    pub low_bandwidth: bool,
    pub low_bandwidth_cap: usize,
    pub probe_url: String,
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub top_k: usize,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub site_cache_ttl: Duration,
    pub github_push_enabled: bool,
    pub github_repo_url: Option<String>,
    pub github_token: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Settings {
            sub_urls: parse_url_list(env_var("SUB_URLS")),
            xray_path: PathBuf::from(
                env_var("XRAY_PATH").unwrap_or_else(|| "/usr/local/bin/xray".to_string()),
            ),
            cache_interval: Duration::from_secs(parse_number(
                env_var("CACHE_INTERVAL_SECONDS"),
                900,
            )?),
            max_delay: Duration::from_millis(parse_number(env_var("MAX_DELAY_MS"), 8000)?),
            test_timeout: Duration::from_secs(parse_number(env_var("TEST_TIMEOUT"), 10)?),
            low_bandwidth: parse_bool(env_var("LOW_INTERNET_CONS"), false),
            low_bandwidth_cap: parse_number(env_var("LOW_BANDWIDTH_CAP"), 100)?,
            probe_url: env_var("PROBE_URL").unwrap_or_else(|| DEFAULT_PROBE_URL.to_string()),
            max_concurrent: parse_number(env_var("MAX_CONCURRENT_TESTS"), 50)?,
            batch_size: parse_number(env_var("BATCH_SIZE"), 100)?,
            top_k: parse_number(env_var("TOP_K"), 25)?,
            port_range_start: parse_number(env_var("PORT_RANGE_START"), 20000)?,
            port_range_end: parse_number(env_var("PORT_RANGE_END"), 30000)?,
            site_cache_ttl: Duration::from_secs(parse_number(
                env_var("SITE_CACHE_TTL_SECONDS"),
                3600,
            )?),
            github_push_enabled: parse_bool(env_var("GITHUB_PUSH_ENABLED"), false),
            github_repo_url: env_var("GITHUB_REPO_URL"),
            github_token: env_var("GITHUB_TOKEN"),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.sub_urls.is_empty() {
            return Err(anyhow!("At least one subscription source is required"));
        }

        for source in &self.sub_urls {
            let parsed = url::Url::parse(source)
                .with_context(|| format!("Invalid subscription source URL: {source}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(anyhow!("Subscription source must be http(s): {source}"));
            }
        }

        let probe = url::Url::parse(&self.probe_url).context("Invalid PROBE_URL")?;
        if !matches!(probe.scheme(), "http" | "https") {
            return Err(anyhow!("PROBE_URL must be http(s)"));
        }

        if self.port_range_start == 0 || self.port_range_start >= self.port_range_end {
            return Err(anyhow!(
                "Port range {}..{} is empty or invalid",
                self.port_range_start,
                self.port_range_end
            ));
        }

        if self.max_concurrent == 0 {
            return Err(anyhow!("MAX_CONCURRENT_TESTS must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("BATCH_SIZE must be greater than 0"));
        }
        if self.top_k == 0 {
            return Err(anyhow!("TOP_K must be greater than 0"));
        }
        if self.test_timeout.is_zero() {
            return Err(anyhow!("TEST_TIMEOUT must be greater than 0"));
        }
        if self.cache_interval.is_zero() {
            return Err(anyhow!("CACHE_INTERVAL_SECONDS must be greater than 0"));
        }

        if self.github_push_enabled
            && (self.github_repo_url.is_none() || self.github_token.is_none())
        {
            return Err(anyhow!(
                "GITHUB_PUSH_ENABLED requires GITHUB_REPO_URL and GITHUB_TOKEN"
            ));
        }

        Ok(())
    }

    pub fn low_bandwidth_cap_opt(&self) -> Option<usize> {
        self.low_bandwidth.then_some(self.low_bandwidth_cap)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_url_list(value: Option<String>) -> Vec<String> {
    match value {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect(),
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid numeric value: {raw}")),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        Some(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}
