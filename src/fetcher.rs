use crate::parser::{KNOWN_SCHEMES, decode_base64_any};
use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("subpool/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {0}")]
    Http(u16),
    #[error("request timed out")]
    Timeout,
}

impl FetchError {
    /// Transient failures get exactly one retry; 4xx and other permanent
    /// statuses do not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::Http(status) => *status >= 500,
        }
    }
}

/// Outcome of one subscription source for a refresh cycle.
#[derive(Debug)]
pub struct SourceReport {
    pub url: String,
    pub result: Result<usize, FetchError>,
}

pub struct SourceFetcher {
    client: Client,
}

impl SourceFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(FETCH_TIMEOUT)
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create subscription HTTP client")?;
        Ok(Self { client })
    }

    /// Fetch every source, returning all candidate URI lines plus a
    /// per-source report. A failing source never aborts the others.
    pub async fn fetch_all(&self, urls: &[String]) -> (Vec<String>, Vec<SourceReport>) {
        let mut lines = Vec::new();
        let mut reports = Vec::with_capacity(urls.len());

        for url in urls {
            match self.fetch_source(url).await {
                Ok(body) => {
                    let source_lines = split_subscription_body(&body);
                    log::info!("Fetched {url}: {} candidate URIs", source_lines.len());
                    reports.push(SourceReport {
                        url: url.clone(),
                        result: Ok(source_lines.len()),
                    });
                    lines.extend(source_lines);
                }
                Err(e) => {
                    log::warn!("Skipping source {url} this cycle: {e}");
                    reports.push(SourceReport {
                        url: url.clone(),
                        result: Err(e),
                    });
                }
            }
        }

        (lines, reports)
    }

    pub async fn fetch_source(&self, url: &str) -> Result<String, FetchError> {
        match self.fetch_once(url).await {
            Ok(body) => Ok(body),
            Err(e) if e.is_transient() => {
                log::debug!("Transient failure from {url} ({e}), retrying once");
                self.fetch_once(url).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

/// Decode an optionally base64-wrapped body and keep only lines that start
/// with a scheme the parser understands.
pub fn split_subscription_body(body: &str) -> Vec<String> {
    // Base64 detection works on the whitespace-stripped body; wrapped feeds
    // are often hard-rewrapped at 76 columns.
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();

    let text = match decode_base64_any(&compact) {
        Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        None => body.trim().to_string(),
    };

    text.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .filter(|l| KNOWN_SCHEMES.iter().any(|scheme| l.starts_with(scheme)))
        .map(|l| l.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_split_plain_body() {
        let body = "vless://a@h:443?type=tcp\r\ntrojan://p@h:443\n\nss://x@h:8388\n";
        let lines = split_subscription_body(body);
        assert_eq!(
            lines,
            vec![
                "vless://a@h:443?type=tcp",
                "trojan://p@h:443",
                "ss://x@h:8388"
            ]
        );
    }

    #[test]
    fn test_split_base64_wrapped_body() {
        let plain = "vless://a@h:443\nvmess://payload";
        let body = STANDARD.encode(plain);
        let lines = split_subscription_body(&body);
        assert_eq!(lines, vec!["vless://a@h:443", "vmess://payload"]);
    }

    #[test]
    fn test_split_drops_unknown_schemes() {
        let body = "vless://a@h:443\nhttp://nope\nsocks5://nope\n# comment";
        let lines = split_subscription_body(body);
        assert_eq!(lines, vec!["vless://a@h:443"]);
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout.is_transient());
        assert!(FetchError::Network("reset".into()).is_transient());
        assert!(FetchError::Http(502).is_transient());
        assert!(!FetchError::Http(404).is_transient());
    }

    #[tokio::test]
    async fn test_fetch_source_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_string("vless://a@h:443"))
            .mount(&server)
            .await;

        let fetcher = SourceFetcher::new().unwrap();
        let body = fetcher
            .fetch_source(&format!("{}/sub", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "vless://a@h:443");
    }

    #[tokio::test]
    async fn test_fetch_source_retries_5xx_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("trojan://p@h:443"))
            .mount(&server)
            .await;

        let fetcher = SourceFetcher::new().unwrap();
        let body = fetcher
            .fetch_source(&format!("{}/flaky", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "trojan://p@h:443");
    }

    #[tokio::test]
    async fn test_fetch_source_does_not_retry_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = SourceFetcher::new().unwrap();
        let err = fetcher
            .fetch_source(&format!("{}/gone", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http(404)));
    }

    #[tokio::test]
    async fn test_fetch_all_isolates_source_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_string("vless://a@h:443"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = SourceFetcher::new().unwrap();
        let urls = vec![
            format!("{}/bad", server.uri()),
            format!("{}/good", server.uri()),
        ];
        let (lines, reports) = fetcher.fetch_all(&urls).await;

        assert_eq!(lines, vec!["vless://a@h:443"]);
        assert!(reports[0].result.is_err());
        assert_eq!(*reports[1].result.as_ref().unwrap(), 1);
    }
}
