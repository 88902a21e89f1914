use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::lantern::heartbeat;
use crate::lantern::proto::{BasicAuth, TunnelProto, TunnelRequest};
use crate::lantern::server::interceptor::PortAllowList;

const CONFIG_FILE_NAMES: [&str; 3] = ["lantern.toml", "lantern.yaml", "lantern.yml"];

/// Chosen config file plus which rule of the lookup chain picked it, for
/// the startup log line.
#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: &'static str,
}

/// Lookup chain: `--config` flag, then `LANTERN_CONFIG`, then a
/// `lantern.*` file in the working directory, then the OS default.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(path) = flag.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(ResolvedConfigPath {
            path: expand_explicit(path),
            source: "flag",
        });
    }

    // clap maps LANTERN_CONFIG into the flag when unset; checking it here
    // keeps the precedence visible when run is called without a flag.
    if let Some(raw) = std::env::var_os("LANTERN_CONFIG").filter(|v| !v.is_empty()) {
        return Ok(ResolvedConfigPath {
            path: expand_explicit(PathBuf::from(raw)),
            source: "env",
        });
    }

    if let Some(path) = first_config_in(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path,
            source: "cwd",
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: "default",
    })
}

/// An explicit path may name a directory; look for a `lantern.*` file
/// inside it, falling back to the canonical name for the error message.
fn expand_explicit(path: PathBuf) -> PathBuf {
    if path.is_dir() {
        return first_config_in(&path).unwrap_or_else(|| path.join(CONFIG_FILE_NAMES[0]));
    }
    path
}

fn first_config_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/lantern/lantern.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "lantern", "lantern")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("lantern.toml"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub http_addr: Option<String>,
    pub auth_token: Option<String>,
    pub allow_ports: Option<PortAllowList>,
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub max_payload_bytes: u32,
    pub max_header_bytes: usize,
    pub buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub tunnels: Vec<TunnelRequest>,
    pub dial_timeout: Duration,
    pub request_timeout: Duration,
    pub reader_idle: Duration,
    pub writer_idle: Duration,
    pub max_payload_bytes: u32,
    pub buffer_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    api_addr: String,

    logging: Option<FileLogging>,

    server: Option<FileServer>,

    client: Option<FileClient>,
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
struct FileServer {
    bind_addr: String,
    http_addr: Option<String>,
    auth_token: Option<String>,
    /// Comma-separated port ranges, e.g. "10000-21000,30000".
    allow_ports: Option<String>,
    reader_idle_ms: Option<i64>,
    writer_idle_ms: Option<i64>,
    max_payload_bytes: Option<i64>,
    max_header_bytes: Option<i64>,
    buffer_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    auth_token: Option<String>,
    dial_timeout_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
    reader_idle_ms: Option<i64>,
    writer_idle_ms: Option<i64>,
    max_payload_bytes: Option<i64>,
    buffer_size: Option<i64>,
    #[serde(default)]
    tunnels: Vec<FileTunnel>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    #[serde(default)]
    proto: String,
    local_addr: String,
    local_port: u16,
    #[serde(default)]
    remote_port: u16,
    #[serde(default)]
    vhost: String,
    #[serde(default)]
    set_headers: BTreeMap<String, String>,
    #[serde(default)]
    add_headers: BTreeMap<String, String>,
    #[serde(default)]
    auth_enable: bool,
    auth_realm: Option<String>,
    auth_username: Option<String>,
    auth_password: Option<String>,
}

fn ms(v: Option<i64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.map(|m| m.max(0) as u64).unwrap_or(default_ms))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    logging.output = out.trim().to_string();
                }
            }
            logging.add_source = l.add_source;
        }

        let server = match &fc.server {
            Some(s) => Some(Self::server_config(s)?),
            None => None,
        };
        let client = match &fc.client {
            Some(c) => Some(Self::client_config(c)?),
            None => None,
        };

        Ok(Config {
            api_addr: fc.api_addr.trim().to_string(),
            logging,
            server,
            client,
        })
    }

    fn server_config(s: &FileServer) -> anyhow::Result<ServerConfig> {
        let bind_addr = s.bind_addr.trim().to_string();
        if bind_addr.is_empty() {
            anyhow::bail!("config: server.bind_addr is required");
        }
        let allow_ports = match s.allow_ports.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(ranges) => Some(
                ranges
                    .parse::<PortAllowList>()
                    .context("config: server.allow_ports")?,
            ),
        };
        Ok(ServerConfig {
            bind_addr,
            http_addr: non_empty(s.http_addr.as_deref()),
            auth_token: non_empty(s.auth_token.as_deref()),
            allow_ports,
            reader_idle: ms(s.reader_idle_ms, heartbeat::DEFAULT_READER_IDLE.as_millis() as u64),
            writer_idle: ms(s.writer_idle_ms, heartbeat::DEFAULT_WRITER_IDLE.as_millis() as u64),
            max_payload_bytes: size_or(s.max_payload_bytes, 1 << 20) as u32,
            max_header_bytes: size_or(s.max_header_bytes, 64 * 1024),
            buffer_size: size_or(s.buffer_size, 32 * 1024),
        })
    }

    fn client_config(c: &FileClient) -> anyhow::Result<ClientConfig> {
        let server_addr = c.server_addr.trim().to_string();
        if server_addr.is_empty() {
            anyhow::bail!("config: client.server_addr is required");
        }
        if c.tunnels.is_empty() {
            anyhow::bail!("config: client.tunnels must list at least one tunnel");
        }

        let auth_token = c.auth_token.clone().unwrap_or_default().trim().to_string();
        let mut tunnels = Vec::with_capacity(c.tunnels.len());
        for (i, t) in c.tunnels.iter().enumerate() {
            let proto = if t.proto.trim().is_empty() {
                TunnelProto::Tcp
            } else {
                match t.proto.trim().to_ascii_lowercase().as_str() {
                    "tcp" => TunnelProto::Tcp,
                    "http" => TunnelProto::Http,
                    "https" => TunnelProto::Https,
                    other => anyhow::bail!("config: client.tunnels[{i}] unknown proto {other:?}"),
                }
            };

            let basic_auth = if t.auth_enable {
                Some(BasicAuth {
                    realm: t.auth_realm.clone().unwrap_or_else(|| ".".to_string()),
                    username: t
                        .auth_username
                        .clone()
                        .with_context(|| format!("config: client.tunnels[{i}] auth_username"))?,
                    password: t
                        .auth_password
                        .clone()
                        .with_context(|| format!("config: client.tunnels[{i}] auth_password"))?,
                })
            } else {
                None
            };

            let request = TunnelRequest {
                proto,
                local_addr: t.local_addr.clone(),
                local_port: t.local_port,
                auth_token: auth_token.clone(),
                remote_port: t.remote_port,
                vhost: t.vhost.clone(),
                set_headers: t.set_headers.clone(),
                add_headers: t.add_headers.clone(),
                basic_auth,
            };
            tunnels.push(
                request
                    .normalize()
                    .with_context(|| format!("config: client.tunnels[{i}]"))?,
            );
        }

        Ok(ClientConfig {
            server_addr,
            tunnels,
            dial_timeout: ms(c.dial_timeout_ms, 5000),
            request_timeout: ms(c.request_timeout_ms, 10_000),
            reader_idle: ms(c.reader_idle_ms, heartbeat::DEFAULT_READER_IDLE.as_millis() as u64),
            writer_idle: ms(c.writer_idle_ms, heartbeat::DEFAULT_WRITER_IDLE.as_millis() as u64),
            max_payload_bytes: size_or(c.max_payload_bytes, 1 << 20) as u32,
            buffer_size: size_or(c.buffer_size, 32 * 1024),
        })
    }
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn size_or(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}
