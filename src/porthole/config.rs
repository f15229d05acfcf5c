use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use uuid::Uuid;

use crate::porthole::tunnel::protocol::TunnelKind;

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub relay: Option<RelayConfig>,
    pub agent: Option<AgentConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// One axum listener carries the control endpoint, the HTTP ingress
    /// and the status routes.
    pub listen_addr: String,
    /// Host announced to agents in EXPOSED messages.
    pub public_host: String,
    /// Ingress suffix: `demo.example.dev` resolves the subdomain `demo`
    /// when `domain = "example.dev"`.
    pub domain: String,
    /// Optional shared bearer token required on control upgrades.
    pub auth_token: String,
    pub max_streams_per_tunnel: usize,
    pub udp_idle_timeout: Duration,
    pub tunnels: Vec<StaticTunnelConfig>,
}

#[derive(Debug, Clone)]
pub struct StaticTunnelConfig {
    pub id: Uuid,
    pub kind: TunnelKind,
    pub subdomain: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub tunnel_id: Uuid,
    pub kind: TunnelKind,
    pub auth_token: String,
    pub local_host: String,
    pub local_port: u16,
    /// Scheme used to reach the local service (http tunnels only).
    pub local_scheme: String,
    /// Requested public endpoint for tcp/udp tunnels; a hint, the relay
    /// may expose a different one.
    pub public_host: String,
    pub public_port: u16,
    pub heartbeat_interval: Duration,
}

pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(p);
    }
    let cwd = Path::new("porthole.toml");
    if fs::metadata(cwd).is_ok_and(|m| m.is_file()) {
        return Ok(cwd.to_path_buf());
    }
    Ok(PathBuf::from("/etc/porthole/porthole.toml"))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileConfig =
        toml::from_str(&data).with_context(|| format!("parse toml {}", path.display()))?;
    Config::from_file_config(fc)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    relay: Option<FileRelay>,
    agent: Option<FileAgent>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    public_host: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    auth_token: String,
    max_streams_per_tunnel: Option<i64>,
    udp_idle_timeout_ms: Option<i64>,
    #[serde(default)]
    tunnels: Vec<FileStaticTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStaticTunnel {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    subdomain: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    server_url: String,
    tunnel_id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    auth_token: String,
    #[serde(default)]
    local_host: String,
    local_port: i64,
    #[serde(default)]
    local_scheme: String,
    #[serde(default)]
    public_host: String,
    #[serde(default)]
    public_port: i64,
    heartbeat_interval_ms: Option<i64>,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(v) = &l.level {
                logging.level = v.trim().to_string();
            }
            if let Some(v) = &l.format {
                logging.format = v.trim().to_string();
            }
            if let Some(v) = &l.output {
                logging.output = v.trim().to_string();
            }
            logging.add_source = l.add_source;
        }

        let relay = match fc.relay {
            Some(r) => Some(resolve_relay(r)?),
            None => None,
        };
        let agent = match fc.agent {
            Some(a) => Some(resolve_agent(a)?),
            None => None,
        };

        Ok(Config {
            logging,
            relay,
            agent,
        })
    }
}

fn resolve_relay(fr: FileRelay) -> anyhow::Result<RelayConfig> {
    let mut listen_addr = fr.listen_addr.trim().to_string();
    if listen_addr.is_empty() {
        listen_addr = ":8080".into();
    }
    let public_host = {
        let h = fr.public_host.trim().to_string();
        if h.is_empty() { "127.0.0.1".into() } else { h }
    };
    let domain = {
        let d = fr.domain.trim().to_ascii_lowercase();
        if d.is_empty() {
            public_host.to_ascii_lowercase()
        } else {
            d
        }
    };

    let mut tunnels = Vec::with_capacity(fr.tunnels.len());
    for (i, t) in fr.tunnels.iter().enumerate() {
        let id = Uuid::parse_str(t.id.trim())
            .with_context(|| format!("config: relay.tunnels[{i}] invalid id {:?}", t.id))?;
        let kind = TunnelKind::parse(&t.kind)
            .with_context(|| format!("config: relay.tunnels[{i}] invalid type"))?;
        let subdomain = t.subdomain.trim().to_ascii_lowercase();
        if kind == TunnelKind::Http && subdomain.is_empty() {
            anyhow::bail!("config: relay.tunnels[{i}] http tunnels need a subdomain");
        }
        tunnels.push(StaticTunnelConfig {
            id,
            kind,
            subdomain,
        });
    }

    Ok(RelayConfig {
        listen_addr,
        public_host,
        domain,
        auth_token: fr.auth_token.trim().to_string(),
        max_streams_per_tunnel: fr
            .max_streams_per_tunnel
            .unwrap_or(1024)
            .max(0) as usize,
        udp_idle_timeout: Duration::from_millis(
            fr.udp_idle_timeout_ms.unwrap_or(60_000).max(0) as u64,
        ),
        tunnels,
    })
}

fn resolve_agent(fa: FileAgent) -> anyhow::Result<AgentConfig> {
    let server_url = fa.server_url.trim().trim_end_matches('/').to_string();
    if server_url.is_empty() {
        anyhow::bail!("config: agent.server_url is required");
    }
    let tunnel_id = Uuid::parse_str(fa.tunnel_id.trim())
        .with_context(|| format!("config: agent.tunnel_id invalid {:?}", fa.tunnel_id))?;
    let kind = TunnelKind::parse(&fa.kind).context("config: agent.type invalid")?;

    if !(1..=65535).contains(&fa.local_port) {
        anyhow::bail!("config: agent.local_port out of range: {}", fa.local_port);
    }
    let local_host = {
        let h = fa.local_host.trim().to_string();
        if h.is_empty() { "127.0.0.1".into() } else { h }
    };
    let local_scheme = {
        let s = fa.local_scheme.trim().to_ascii_lowercase();
        if s.is_empty() { "http".into() } else { s }
    };
    if local_scheme != "http" && local_scheme != "https" {
        anyhow::bail!("config: agent.local_scheme must be http or https");
    }
    if !(0..=65535).contains(&fa.public_port) {
        anyhow::bail!("config: agent.public_port out of range: {}", fa.public_port);
    }

    Ok(AgentConfig {
        server_url,
        tunnel_id,
        kind,
        auth_token: fa.auth_token.trim().to_string(),
        local_host,
        local_port: fa.local_port as u16,
        local_scheme,
        public_host: fa.public_host.trim().to_string(),
        public_port: fa.public_port as u16,
        heartbeat_interval: Duration::from_millis(
            fa.heartbeat_interval_ms.unwrap_or(15_000).max(1_000) as u64,
        ),
    })
}
