use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to.
    pub bind: String,
    pub port: u16,
    /// Verbose logging and periodic state diagnostics.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct SignalingConfig {
    /// Maximum number of peers returned per resource request.
    pub multiplicity: usize,
    /// Lifetime of a pooled connection offer.
    pub conn_expiry_secs: u64,
    /// Offer pool capacity per client.
    pub peer_max_conns: usize,
    /// Depth of each client's outbound message queue.
    pub outbound_queue: usize,
    /// Depth of the shared hub event queue. Socket readers wait when it is
    /// full.
    pub hub_queue: usize,
    pub diagnostics_interval_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            multiplicity: 5,
            conn_expiry_secs: 60,
            peer_max_conns: 10,
            outbound_queue: 64,
            hub_queue: 1024,
            diagnostics_interval_secs: 5,
        }
    }
}

impl SignalingConfig {
    pub fn conn_expiry(&self) -> Duration {
        Duration::from_secs(self.conn_expiry_secs)
    }

    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_secs(self.diagnostics_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(default)]
pub struct FetcherConfig {
    /// Origins resources may be verified from. `*.example.com` matches any
    /// subdomain. Empty rejects everything.
    pub allowed_hosts: Vec<String>,
    pub min_chunk_bytes: u64,
    pub max_chunk_bytes: u64,
    /// Upper bound on the advertised `Content-Length` of a resource.
    pub max_resource_bytes: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            min_chunk_bytes: 500,
            max_chunk_bytes: 500_000,
            max_resource_bytes: 512 * 1024 * 1024,
            request_timeout_secs: 60,
            connect_timeout_secs: 5,
        }
    }
}

impl FetcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

/// Read a TOML config file and check it against the schema. Semantic limits
/// are left to [`Config::validate`] so overrides can be layered first.
pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let raw: toml::Value = toml::from_str(&content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(&content)?;
    Ok(cfg)
}

/// Split a comma separated host list, dropping blanks and lowercasing.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("invalid {key}: {raw}")),
        None => Ok(None),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>> {
    match env_value(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(anyhow!("invalid {key}: {raw}")),
        },
        None => Ok(None),
    }
}

impl Config {
    /// Layer `PEERKIT_*` environment variables over the loaded values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(bind) = env_value("PEERKIT_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = env_parse("PEERKIT_PORT")? {
            self.server.port = port;
        }
        if let Some(debug) = env_flag("PEERKIT_DEBUG")? {
            self.server.debug = debug;
        }
        if let Some(multiplicity) = env_parse("PEERKIT_MULTIPLICITY")? {
            self.signaling.multiplicity = multiplicity;
        }
        if let Some(expiry) = env_parse("PEERKIT_CONN_EXPIRY_SECS")? {
            self.signaling.conn_expiry_secs = expiry;
        }
        if let Some(max_conns) = env_parse("PEERKIT_PEER_MAX_CONNS")? {
            self.signaling.peer_max_conns = max_conns;
        }
        if let Some(hosts) = env_value("PEERKIT_ALLOWED_HOSTS") {
            self.fetcher.allowed_hosts = parse_host_list(&hosts);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.signaling.multiplicity == 0 {
            bail!("signaling.multiplicity must be at least 1");
        }
        if self.signaling.peer_max_conns == 0 {
            bail!("signaling.peer_max_conns must be at least 1");
        }
        if self.signaling.conn_expiry_secs == 0 {
            bail!("signaling.conn_expiry_secs must be at least 1");
        }
        if self.signaling.outbound_queue == 0 {
            bail!("signaling.outbound_queue must be at least 1");
        }
        if self.signaling.hub_queue == 0 {
            bail!("signaling.hub_queue must be at least 1");
        }
        if self.fetcher.min_chunk_bytes == 0 {
            bail!("fetcher.min_chunk_bytes must be at least 1");
        }
        if self.fetcher.min_chunk_bytes > self.fetcher.max_chunk_bytes {
            bail!(
                "fetcher.min_chunk_bytes ({}) exceeds fetcher.max_chunk_bytes ({})",
                self.fetcher.min_chunk_bytes,
                self.fetcher.max_chunk_bytes
            );
        }
        Ok(())
    }
}
