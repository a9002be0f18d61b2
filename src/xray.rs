use crate::parser::{ProxyServer, ShadowsocksServer, TrojanServer, VlessServer, VmessServer};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs;
use std::path::PathBuf;

/// Engine configuration document: one local SOCKS5 inbound bound to one
/// upstream outbound. Logging is disabled so readiness detection and
/// high fan-out never contend on the child's pipes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XrayConfig {
    pub log: Value,
    pub inbounds: Vec<Value>,
    pub outbounds: Vec<Value>,
}

pub fn build_config(server: &ProxyServer, port: u16) -> Result<XrayConfig> {
    let inbound = json!({
        "port": port,
        "listen": "127.0.0.1",
        "protocol": "socks",
        "settings": {
            "auth": "noauth",
            "udp": false
        }
    });

    let outbound = match server {
        ProxyServer::Vless(v) => vless_outbound(v)?,
        ProxyServer::Vmess(v) => vmess_outbound(v)?,
        ProxyServer::Trojan(t) => trojan_outbound(t)?,
        ProxyServer::Shadowsocks(s) => shadowsocks_outbound(s),
    };

    Ok(XrayConfig {
        log: json!({ "loglevel": "none" }),
        inbounds: vec![inbound],
        outbounds: vec![outbound],
    })
}

fn vless_outbound(v: &VlessServer) -> Result<Value> {
    let stream_settings = build_stream_settings(&StreamParams {
        network: &v.network,
        header_type: None,
        security: &v.security,
        sni: v.sni.as_deref(),
        host: &v.host,
        alpn: &v.alpn,
        fingerprint: v.fingerprint.as_deref(),
        public_key: v.public_key.as_deref(),
        short_id: v.short_id.as_deref(),
        spider_x: v.spider_x.as_deref(),
        path: v.path.as_deref(),
        host_header: v.host_header.as_deref(),
        service_name: v.service_name.as_deref(),
    })?;

    Ok(json!({
        "protocol": "vless",
        "tag": "vless-out",
        "settings": {
            "vnext": [{
                "address": v.host,
                "port": v.port,
                "users": [{
                    "id": v.id,
                    "encryption": "none",
                    "flow": v.flow.as_deref().unwrap_or("")
                }]
            }]
        },
        "streamSettings": stream_settings
    }))
}

fn vmess_outbound(v: &VmessServer) -> Result<Value> {
    let stream_settings = build_stream_settings(&StreamParams {
        network: &v.network,
        header_type: v.header_type.as_deref(),
        security: &v.security,
        sni: v.sni.as_deref(),
        host: &v.host,
        alpn: &[],
        fingerprint: None,
        public_key: None,
        short_id: None,
        spider_x: None,
        path: v.path.as_deref(),
        host_header: v.host_header.as_deref(),
        service_name: None,
    })?;

    Ok(json!({
        "protocol": "vmess",
        "tag": "vmess-out",
        "settings": {
            "vnext": [{
                "address": v.host,
                "port": v.port,
                "users": [{
                    "id": v.id,
                    "alterId": v.alter_id,
                    "security": v.cipher
                }]
            }]
        },
        "streamSettings": stream_settings
    }))
}

fn trojan_outbound(t: &TrojanServer) -> Result<Value> {
    let stream_settings = build_stream_settings(&StreamParams {
        network: t.network.as_deref().unwrap_or("tcp"),
        header_type: None,
        security: t.security.as_deref().unwrap_or("tls"),
        sni: t.sni.as_deref(),
        host: &t.host,
        alpn: &t.alpn,
        fingerprint: t.fingerprint.as_deref(),
        public_key: None,
        short_id: None,
        spider_x: None,
        path: t.path.as_deref(),
        host_header: t.host_header.as_deref(),
        service_name: None,
    })?;

    Ok(json!({
        "protocol": "trojan",
        "tag": "trojan-out",
        "settings": {
            "servers": [{
                "address": t.host,
                "port": t.port,
                "password": t.password
            }]
        },
        "streamSettings": stream_settings
    }))
}

fn shadowsocks_outbound(s: &ShadowsocksServer) -> Value {
    json!({
        "protocol": "shadowsocks",
        "tag": "ss-out",
        "settings": {
            "servers": [{
                "address": s.host,
                "port": s.port,
                "method": s.method,
                "password": s.password
            }]
        }
    })
}

struct StreamParams<'a> {
    network: &'a str,
    header_type: Option<&'a str>,
    security: &'a str,
    sni: Option<&'a str>,
    host: &'a str,
    alpn: &'a [String],
    fingerprint: Option<&'a str>,
    public_key: Option<&'a str>,
    short_id: Option<&'a str>,
    spider_x: Option<&'a str>,
    path: Option<&'a str>,
    host_header: Option<&'a str>,
    service_name: Option<&'a str>,
}

fn build_stream_settings(params: &StreamParams<'_>) -> Result<Value> {
    let mut stream_settings = json!({
        "network": params.network,
        "security": params.security
    });

    match params.network {
        "ws" => {
            let mut ws = json!({
                "path": params.path.unwrap_or("/")
            });
            if let Some(host) = params.host_header {
                ws["headers"] = json!({ "Host": host });
            }
            stream_settings["wsSettings"] = ws;
        }
        "grpc" => {
            stream_settings["grpcSettings"] = json!({
                "serviceName": params.service_name.unwrap_or("")
            });
        }
        "h2" => {
            let mut h2 = json!({
                "path": params.path.unwrap_or("/")
            });
            if let Some(host) = params.host_header {
                h2["host"] = json!([host]);
            }
            stream_settings["httpSettings"] = h2;
        }
        "tcp" => {
            if let Some(header) = params.header_type
                && header != "none"
            {
                stream_settings["tcpSettings"] = json!({ "header": { "type": header } });
            }
        }
        other => return Err(anyhow!("Unsupported network type: {}", other)),
    }

    match params.security {
        "tls" => {
            let mut tls_settings = json!({
                "allowInsecure": true
            });
            if let Some(name) = params.sni {
                tls_settings["serverName"] = Value::String(name.to_string());
            }
            if !params.alpn.is_empty() {
                tls_settings["alpn"] = json!(params.alpn);
            }
            if let Some(fp) = params.fingerprint {
                tls_settings["fingerprint"] = Value::String(fp.to_string());
            }
            stream_settings["tlsSettings"] = tls_settings;
        }
        "reality" => {
            let mut reality_settings = json!({
                "serverName": params.sni.unwrap_or(params.host),
                "publicKey": params.public_key
                    .ok_or_else(|| anyhow!("Reality requires public key"))?,
                "shortId": params.short_id
                    .ok_or_else(|| anyhow!("Reality requires short ID"))?,
                "fingerprint": params.fingerprint.unwrap_or("chrome")
            });
            if let Some(spx) = params.spider_x {
                reality_settings["spiderX"] = Value::String(spx.to_string());
            }
            stream_settings["realitySettings"] = reality_settings;
        }
        "none" => {}
        other => return Err(anyhow!("Unsupported security type: {}", other)),
    }

    Ok(stream_settings)
}

/// Owns the scratch directory holding per-job engine config files.
pub struct ConfigStore {
    scratch_dir: PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self> {
        let scratch_dir = std::env::temp_dir().join(format!("subpool_configs_{}", std::process::id()));
        fs::create_dir_all(&scratch_dir).context("Failed to create scratch config directory")?;

        Ok(Self { scratch_dir })
    }

    /// Write the config for one probe job. The file name is keyed by the
    /// allocated port, which is unique among live jobs.
    pub fn write_config(&self, server: &ProxyServer, port: u16) -> Result<PathBuf> {
        let config = build_config(server, port)?;
        let config_path = self.scratch_dir.join(format!("config_{port}.json"));

        let config_json =
            serde_json::to_string_pretty(&config).context("Failed to serialize engine config")?;

        fs::write(&config_path, config_json).context("Failed to write config file")?;

        log::debug!("Generated engine config: {}", config_path.display());
        Ok(config_path)
    }

    pub fn remove_config(&self, port: u16) {
        let config_path = self.scratch_dir.join(format!("config_{port}.json"));
        if let Err(e) = fs::remove_file(&config_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove config {}: {e}", config_path.display());
            }
        }
    }

    pub fn cleanup_all(&self) -> Result<()> {
        if self.scratch_dir.exists() {
            fs::remove_dir_all(&self.scratch_dir)
                .context("Failed to cleanup scratch config directory")?;
            log::debug!("Cleaned up configs in: {}", self.scratch_dir.display());
        }
        Ok(())
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup_all() {
            log::warn!("Failed to cleanup configs on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_server_url;

    #[test]
    fn test_inbound_is_local_socks_without_udp() {
        let server = parse_server_url("vless://uuid@example.com:443?type=tcp").unwrap();
        let config = build_config(&server, 21000).unwrap();

        assert_eq!(config.log["loglevel"], "none");
        let inbound = &config.inbounds[0];
        assert_eq!(inbound["port"], 21000);
        assert_eq!(inbound["listen"], "127.0.0.1");
        assert_eq!(inbound["protocol"], "socks");
        assert_eq!(inbound["settings"]["auth"], "noauth");
        assert_eq!(inbound["settings"]["udp"], false);
    }

    #[test]
    fn test_vless_reality_outbound() {
        let url = "vless://uuid@example.com:443?security=reality&sni=cdn.example.com&pbk=pk&sid=ab&spx=%2F&fp=chrome&type=tcp&flow=xtls-rprx-vision";
        let server = parse_server_url(url).unwrap();
        let config = build_config(&server, 20001).unwrap();

        let outbound = &config.outbounds[0];
        assert_eq!(outbound["protocol"], "vless");
        assert_eq!(outbound["settings"]["vnext"][0]["address"], "example.com");
        assert_eq!(
            outbound["settings"]["vnext"][0]["users"][0]["flow"],
            "xtls-rprx-vision"
        );

        let reality = &outbound["streamSettings"]["realitySettings"];
        assert_eq!(reality["serverName"], "cdn.example.com");
        assert_eq!(reality["publicKey"], "pk");
        assert_eq!(reality["shortId"], "ab");
        assert_eq!(reality["spiderX"], "/");
        assert_eq!(reality["fingerprint"], "chrome");
    }

    #[test]
    fn test_vless_ws_tls_outbound() {
        let url = "vless://uuid@example.com:443?security=tls&sni=example.com&type=ws&path=/ws&host=cdn.example.com&alpn=h2,http/1.1";
        let server = parse_server_url(url).unwrap();
        let config = build_config(&server, 20002).unwrap();

        let stream = &config.outbounds[0]["streamSettings"];
        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["wsSettings"]["path"], "/ws");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example.com");
        assert_eq!(stream["tlsSettings"]["serverName"], "example.com");
        assert_eq!(stream["tlsSettings"]["alpn"][0], "h2");
    }

    #[test]
    fn test_vmess_outbound_carries_cipher_and_alter_id() {
        use base64::Engine;
        let payload =
            r#"{"add":"example.com","port":443,"id":"uuid","aid":2,"scy":"aes-128-gcm"}"#;
        let url = format!(
            "vmess://{}",
            base64::engine::general_purpose::STANDARD.encode(payload)
        );
        let server = parse_server_url(&url).unwrap();
        let config = build_config(&server, 20003).unwrap();

        let user = &config.outbounds[0]["settings"]["vnext"][0]["users"][0];
        assert_eq!(user["alterId"], 2);
        assert_eq!(user["security"], "aes-128-gcm");
    }

    #[test]
    fn test_vmess_tcp_http_header() {
        use base64::Engine;
        let payload = r#"{"add":"example.com","port":80,"id":"uuid","net":"tcp","type":"http"}"#;
        let url = format!(
            "vmess://{}",
            base64::engine::general_purpose::STANDARD.encode(payload)
        );
        let server = parse_server_url(&url).unwrap();
        let config = build_config(&server, 20006).unwrap();

        let stream = &config.outbounds[0]["streamSettings"];
        assert_eq!(stream["tcpSettings"]["header"]["type"], "http");
    }

    #[test]
    fn test_trojan_defaults_to_tls() {
        let server = parse_server_url("trojan://pw@example.com:443").unwrap();
        let config = build_config(&server, 20004).unwrap();

        let outbound = &config.outbounds[0];
        assert_eq!(outbound["protocol"], "trojan");
        assert_eq!(outbound["settings"]["servers"][0]["password"], "pw");
        assert_eq!(outbound["streamSettings"]["security"], "tls");
    }

    #[test]
    fn test_shadowsocks_outbound() {
        let server = parse_server_url("ss://aes-256-gcm:pw@example.com:8388").unwrap();
        let config = build_config(&server, 20005).unwrap();

        let entry = &config.outbounds[0]["settings"]["servers"][0];
        assert_eq!(entry["method"], "aes-256-gcm");
        assert_eq!(entry["password"], "pw");
        assert_eq!(entry["port"], 8388);
    }

    #[test]
    fn test_config_store_writes_and_removes() {
        let store = ConfigStore::new().unwrap();
        let server = parse_server_url("vless://uuid@example.com:443?type=tcp").unwrap();

        let path = store.write_config(&server, 29999).unwrap();
        assert!(path.exists());

        let contents = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["inbounds"][0]["port"], 29999);

        store.remove_config(29999);
        assert!(!path.exists());

        store.cleanup_all().unwrap();
    }
}
