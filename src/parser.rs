use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use url::Url;

/// Scheme prefixes the pipeline accepts; anything else in a subscription
/// body is dropped before parsing.
pub const KNOWN_SCHEMES: &[&str] = &["vless://", "vmess://", "trojan://", "ss://"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VlessServer {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub network: String,
    pub security: String,
    pub sni: Option<String>,
    pub flow: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub spider_x: Option<String>,
    pub fingerprint: Option<String>,
    pub path: Option<String>,
    pub host_header: Option<String>,
    pub service_name: Option<String>,
    pub alpn: Vec<String>,
    pub tag: Option<String>,
    pub raw: String,
}

impl VlessServer {
    pub fn parse(vless_url: &str) -> Result<Self> {
        if !vless_url.starts_with("vless://") {
            return Err(anyhow!("Invalid VLESS URL: must start with 'vless://'"));
        }

        let url = Url::parse(vless_url).context("Failed to parse VLESS URL")?;

        let id = url.username();
        if id.is_empty() {
            return Err(anyhow!("VLESS URL missing user ID"));
        }

        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("VLESS URL missing host"))?
            .to_string();

        let port = url.port().unwrap_or(443);
        if port == 0 {
            return Err(anyhow!("invalid port: {}", port));
        }

        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut server = VlessServer {
            id: id.to_string(),
            host,
            port,
            network: params
                .get("type")
                .cloned()
                .unwrap_or_else(|| "tcp".to_string()),
            security: params
                .get("security")
                .cloned()
                .unwrap_or_else(|| "none".to_string()),
            sni: params.get("sni").cloned(),
            flow: params.get("flow").cloned(),
            public_key: params.get("pbk").cloned(),
            short_id: params.get("sid").cloned(),
            spider_x: params.get("spx").cloned(),
            fingerprint: params.get("fp").cloned(),
            path: params.get("path").cloned(),
            host_header: params.get("host").cloned(),
            service_name: None,
            alpn: params
                .get("alpn")
                .map(|s| s.split(',').map(|x| x.to_string()).collect())
                .unwrap_or_default(),
            tag: decode_fragment(url.fragment()),
            raw: vless_url.to_string(),
        };

        if server.network == "grpc" {
            server.service_name = params.get("serviceName").cloned();
        }

        Ok(server)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(anyhow!("VLESS server missing ID"));
        }

        if self.host.is_empty() {
            return Err(anyhow!("VLESS server missing host"));
        }

        match self.security.as_str() {
            "none" | "tls" | "reality" => {}
            _ => return Err(anyhow!("Unsupported security type: {}", self.security)),
        }

        match self.network.as_str() {
            "tcp" | "ws" | "grpc" | "h2" => {}
            _ => return Err(anyhow!("Unsupported network type: {}", self.network)),
        }

        if self.security == "reality" {
            if self.public_key.is_none() {
                return Err(anyhow!("Reality security requires public key"));
            }
            if self.short_id.is_none() {
                return Err(anyhow!("Reality security requires short ID"));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VmessServer {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub alter_id: u32,
    pub network: String,
    pub header_type: Option<String>,
    pub security: String,
    pub cipher: String,
    pub sni: Option<String>,
    pub path: Option<String>,
    pub host_header: Option<String>,
    pub tag: Option<String>,
    pub raw: String,
}

impl VmessServer {
    pub fn parse(vmess_url: &str) -> Result<Self> {
        let encoded = vmess_url
            .strip_prefix("vmess://")
            .ok_or_else(|| anyhow!("Invalid VMESS URL: must start with 'vmess://'"))?;

        let decoded = decode_base64_any(encoded.trim())
            .ok_or_else(|| anyhow!("VMESS payload is not valid base64"))?;
        let payload: serde_json::Value =
            serde_json::from_slice(&decoded).context("VMESS payload is not valid JSON")?;

        let host = payload["add"]
            .as_str()
            .ok_or_else(|| anyhow!("VMESS payload missing 'add'"))?
            .to_string();
        let port = payload["port"]
            .as_u64()
            .or_else(|| payload["port"].as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| anyhow!("VMESS payload missing 'port'"))?;
        let port = u16::try_from(port).map_err(|_| anyhow!("invalid port: {}", port))?;
        if port == 0 {
            return Err(anyhow!("invalid port: {}", port));
        }
        let id = payload["id"]
            .as_str()
            .ok_or_else(|| anyhow!("VMESS payload missing 'id'"))?
            .to_string();

        Ok(VmessServer {
            id,
            host,
            port,
            alter_id: payload["aid"]
                .as_u64()
                .or_else(|| payload["aid"].as_str().and_then(|s| s.parse().ok()))
                .unwrap_or(0) as u32,
            network: payload["net"].as_str().unwrap_or("tcp").to_string(),
            header_type: payload["type"].as_str().map(|s| s.to_string()),
            security: if payload["tls"].as_str() == Some("tls") {
                "tls".to_string()
            } else {
                "none".to_string()
            },
            cipher: payload["scy"].as_str().unwrap_or("auto").to_string(),
            sni: payload["sni"].as_str().map(|s| s.to_string()),
            path: payload["path"].as_str().map(|s| s.to_string()),
            host_header: payload["host"].as_str().map(|s| s.to_string()),
            tag: payload["ps"].as_str().map(|s| s.to_string()),
            raw: vmess_url.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow!("VMESS server missing host"));
        }
        match self.network.as_str() {
            "tcp" | "ws" | "grpc" | "h2" => Ok(()),
            _ => Err(anyhow!("Unsupported network type: {}", self.network)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrojanServer {
    pub password: String,
    pub host: String,
    pub port: u16,
    pub security: Option<String>,
    pub network: Option<String>,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub path: Option<String>,
    pub host_header: Option<String>,
    pub alpn: Vec<String>,
    pub tag: Option<String>,
    pub raw: String,
}

impl TrojanServer {
    pub fn parse(url_str: &str) -> Result<Self> {
        if !url_str.starts_with("trojan://") {
            return Err(anyhow!("Invalid Trojan URL: must start with 'trojan://'"));
        }
        let u = Url::parse(url_str).context("Failed to parse Trojan URL")?;

        let password = u.username().to_string();
        if password.is_empty() {
            return Err(anyhow!("Trojan URL missing password"));
        }

        let host = u
            .host_str()
            .ok_or_else(|| anyhow!("Trojan URL missing host"))?
            .to_string();
        let port = u.port().ok_or_else(|| anyhow!("Trojan URL missing port"))?;
        if port == 0 {
            return Err(anyhow!("invalid port: {}", port));
        }

        let params: HashMap<String, String> = u
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(TrojanServer {
            password,
            host,
            port,
            security: params.get("security").cloned(),
            network: params.get("type").cloned(),
            sni: params.get("sni").cloned(),
            fingerprint: params.get("fp").cloned(),
            path: params.get("path").cloned(),
            host_header: params.get("host").cloned(),
            alpn: params
                .get("alpn")
                .map(|s| s.split(',').map(|x| x.to_string()).collect())
                .unwrap_or_default(),
            tag: decode_fragment(u.fragment()),
            raw: url_str.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShadowsocksServer {
    pub method: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub tag: Option<String>,
    pub raw: String,
}

impl ShadowsocksServer {
    pub fn parse(url_str: &str) -> Result<Self> {
        let rest = url_str
            .strip_prefix("ss://")
            .ok_or_else(|| anyhow!("Invalid Shadowsocks URL: must start with 'ss://'"))?;

        // Legacy form wraps the entire method:password@host:port in base64.
        let body = match rest.split_once('#') {
            Some((b, _)) => b,
            None => rest,
        };
        if !body.contains('@') {
            return Self::parse_legacy(url_str, body);
        }

        let u = Url::parse(url_str).context("Failed to parse Shadowsocks URL")?;

        let userinfo = if let Some(pw) = u.password() {
            format!("{}:{}", u.username(), pw)
        } else {
            u.username().to_string()
        };
        if userinfo.is_empty() {
            return Err(anyhow!("Shadowsocks URL missing userinfo"));
        }

        let decoded = auto_decode(&userinfo);
        let decoded_str = String::from_utf8_lossy(&decoded);

        let parts: Vec<&str> = decoded_str.splitn(2, ':').collect();
        if parts.len() != 2 {
            return Err(anyhow!("invalid method:password format"));
        }
        let method = parts[0].to_string();
        let password = parts[1].to_string();

        let host = u
            .host_str()
            .ok_or_else(|| anyhow!("Shadowsocks URL missing host"))?
            .to_string();
        let port = u
            .port()
            .ok_or_else(|| anyhow!("Shadowsocks URL missing port"))?;
        if port == 0 {
            return Err(anyhow!("invalid port: {}", port));
        }

        Ok(ShadowsocksServer {
            method,
            password,
            host,
            port,
            tag: decode_fragment(u.fragment()),
            raw: url_str.to_string(),
        })
    }

    fn parse_legacy(raw: &str, body: &str) -> Result<Self> {
        let decoded = decode_base64_any(body)
            .ok_or_else(|| anyhow!("Shadowsocks legacy body is not valid base64"))?;
        let decoded = String::from_utf8(decoded).context("Shadowsocks legacy body is not UTF-8")?;

        let (userinfo, host_port) = decoded
            .rsplit_once('@')
            .ok_or_else(|| anyhow!("Shadowsocks legacy body missing '@'"))?;
        let (method, password) = userinfo
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid method:password format"))?;
        let (host, port_str) = host_port
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Shadowsocks legacy body missing port"))?;
        let port: u16 = port_str.parse().context("invalid port")?;
        if port == 0 {
            return Err(anyhow!("invalid port: {}", port));
        }

        let fragment = raw.split_once('#').map(|(_, f)| f);

        Ok(ShadowsocksServer {
            method: method.to_string(),
            password: password.to_string(),
            host: host.to_string(),
            port,
            tag: decode_fragment(fragment),
            raw: raw.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "server")]
pub enum ProxyServer {
    Vless(VlessServer),
    Vmess(VmessServer),
    Trojan(TrojanServer),
    Shadowsocks(ShadowsocksServer),
}

impl ProxyServer {
    /// The original URI string. Also the deduplication and equality key.
    pub fn raw_uri(&self) -> &str {
        match self {
            ProxyServer::Vless(v) => &v.raw,
            ProxyServer::Vmess(v) => &v.raw,
            ProxyServer::Trojan(t) => &t.raw,
            ProxyServer::Shadowsocks(s) => &s.raw,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyServer::Vless(_) => "vless",
            ProxyServer::Vmess(_) => "vmess",
            ProxyServer::Trojan(_) => "trojan",
            ProxyServer::Shadowsocks(_) => "shadowsocks",
        }
    }

    pub fn address(&self) -> &str {
        match self {
            ProxyServer::Vless(v) => &v.host,
            ProxyServer::Vmess(v) => &v.host,
            ProxyServer::Trojan(t) => &t.host,
            ProxyServer::Shadowsocks(s) => &s.host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            ProxyServer::Vless(v) => v.port,
            ProxyServer::Vmess(v) => v.port,
            ProxyServer::Trojan(t) => t.port,
            ProxyServer::Shadowsocks(s) => s.port,
        }
    }

    pub fn cipher(&self) -> &str {
        match self {
            ProxyServer::Vmess(v) => &v.cipher,
            ProxyServer::Shadowsocks(s) => &s.method,
            _ => "",
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            ProxyServer::Vless(v) => v.tag.as_deref(),
            ProxyServer::Vmess(v) => v.tag.as_deref(),
            ProxyServer::Trojan(t) => t.tag.as_deref(),
            ProxyServer::Shadowsocks(s) => s.tag.as_deref(),
        }
    }
}

impl PartialEq for ProxyServer {
    fn eq(&self, other: &Self) -> bool {
        self.raw_uri() == other.raw_uri()
    }
}

impl Eq for ProxyServer {}

impl Hash for ProxyServer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw_uri().hash(state);
    }
}

pub fn parse_server_url(server_url: &str) -> Result<ProxyServer> {
    let server_url = server_url.trim();
    if server_url.is_empty() {
        return Err(anyhow!("empty server URL"));
    }

    let scheme = server_url
        .split("://")
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if scheme.is_empty() {
        return Err(anyhow!("protocol is missing in URL: {}", server_url));
    }

    match scheme.as_str() {
        "vless" => {
            let server = VlessServer::parse(server_url)?;
            server.validate()?;
            Ok(ProxyServer::Vless(server))
        }
        "vmess" => {
            let server = VmessServer::parse(server_url)?;
            server.validate()?;
            Ok(ProxyServer::Vmess(server))
        }
        "trojan" => Ok(ProxyServer::Trojan(TrojanServer::parse(server_url)?)),
        "ss" => Ok(ProxyServer::Shadowsocks(ShadowsocksServer::parse(
            server_url,
        )?)),
        _ => Err(anyhow!("unsupported protocol: {}", scheme)),
    }
}

/// Parse every line that survived the fetcher's scheme filter. Bad lines are
/// logged and skipped; the refresh loop decides what an empty result means.
pub fn parse_server_list(lines: &[String]) -> Vec<ProxyServer> {
    let mut servers = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_server_url(line) {
            Ok(server) => servers.push(server),
            Err(e) => log::warn!("Failed to parse server URL {line}: {e:#}"),
        }
    }
    servers
}

fn decode_fragment(fragment: Option<&str>) -> Option<String> {
    let fragment = fragment?;
    if fragment.is_empty() {
        return None;
    }
    Some(
        percent_decode_str(fragment)
            .decode_utf8()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| fragment.to_string()),
    )
}

/// Base64 with tolerance for every padding/alphabet combination seen in
/// wild subscription feeds.
pub fn decode_base64_any(input: &str) -> Option<Vec<u8>> {
    let input = input.trim();
    STANDARD
        .decode(input)
        .or_else(|_| STANDARD_NO_PAD.decode(input))
        .or_else(|_| URL_SAFE.decode(input))
        .or_else(|_| URL_SAFE_NO_PAD.decode(input))
        .ok()
}

fn auto_decode(input: &str) -> Vec<u8> {
    if let Ok(decoded) = percent_decode_str(input).decode_utf8() {
        let s = decoded.to_string();
        if let Some(bytes) = decode_base64_any(&s) {
            return bytes;
        }
        return s.into_bytes();
    }
    if let Some(bytes) = decode_base64_any(input) {
        return bytes;
    }
    input.as_bytes().to_vec()
}
