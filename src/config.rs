use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::{validate_executor_name, ParamSpec};

pub const INFO_PATH: &str = "/_api/v3/info";
pub const REGISTRATION_PATH: &str = "/_api/v3/agent_registration";
pub const CHANNEL_TOKEN_PATH: &str = "/_api/v3/agent_websocket_token";
pub const WEBSOCKET_PATH: &str = "/websockets";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokensConfig {
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default = "default_executors_dir")]
    pub executors_dir: PathBuf,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_registration_attempts")]
    pub registration_attempts: u32,
    #[serde(default = "default_registration_retry_delay_ms")]
    pub registration_retry_delay_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_name: default_agent_name(),
            executors_dir: default_executors_dir(),
            interpreter: default_interpreter(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            registration_attempts: default_registration_attempts(),
            registration_retry_delay_ms: default_registration_retry_delay_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

/// One `[executors.<name>]` table as written on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub repo_executor: Option<String>,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub check_cmds: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub varenvs: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "localhost".to_owned(),
                api_port: default_api_port(),
                websocket_port: default_websocket_port(),
                ssl: false,
                ssl_cert: None,
                http_timeout_secs: default_http_timeout_secs(),
            },
            tokens: TokensConfig::default(),
            agent: AgentConfig::default(),
            executors: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn api_base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host.trim(), self.api_port)
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url())
    }

    pub fn websocket_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}{WEBSOCKET_PATH}",
            self.host.trim(),
            self.websocket_port
        )
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = Self::read_stored(path)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// The file as written, without env or CLI overrides.
    fn read_stored(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        toml::from_str::<Config>(&text)
            .with_context(|| format!("failed parsing TOML config {}", path.display()))
    }

    /// Sets `tokens.agent` in the stored file and leaves every other stored
    /// value untouched.
    pub fn persist_agent_token(path: &Path, token: &str) -> Result<()> {
        let mut stored = Self::read_stored(path)?;
        stored.tokens.agent = Some(token.to_owned());
        stored.save(path)
    }

    /// Writes the config through a temp file so a crash never leaves a
    /// truncated store behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating config dir {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed serializing config")?;
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, text)
            .with_context(|| format!("failed writing config temp file {}", temp_path.display()))?;
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("failed replacing config file {}", path.display()))?;
        Ok(())
    }

    pub fn apply_cli_overrides(&mut self, host: Option<&str>, agent_name: Option<&str>) {
        if let Some(host) = host.and_then(normalize_optional_text) {
            self.server.host = host;
        }
        if let Some(name) = agent_name.and_then(normalize_optional_text) {
            self.agent.agent_name = name;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("DISPATCHER_RS_HOST") {
            if let Some(host) = normalize_optional_text(&v) {
                self.server.host = host;
            }
        }
        if let Ok(v) = env::var("DISPATCHER_RS_API_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                self.server.api_port = n;
            }
        }
        if let Ok(v) = env::var("DISPATCHER_RS_WEBSOCKET_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                self.server.websocket_port = n;
            }
        }
        if let Ok(v) = env::var("DISPATCHER_RS_SSL") {
            self.server.ssl = parse_bool(&v);
        }
        if let Ok(v) = env::var("DISPATCHER_RS_SSL_CERT") {
            self.server.ssl_cert = normalize_optional_text(&v).map(PathBuf::from);
        }
        if let Ok(v) = env::var("DISPATCHER_RS_HTTP_TIMEOUT_SECS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.server.http_timeout_secs = n.max(1);
            }
        }
        if let Ok(v) = env::var("DISPATCHER_RS_AGENT_NAME") {
            if let Some(name) = normalize_optional_text(&v) {
                self.agent.agent_name = name;
            }
        }
        if let Ok(v) = env::var("DISPATCHER_RS_AGENT_TOKEN") {
            self.tokens.agent = normalize_optional_text(&v);
        }
        if let Ok(v) = env::var("DISPATCHER_RS_EXECUTORS_DIR") {
            if let Some(dir) = normalize_optional_text(&v) {
                self.agent.executors_dir = PathBuf::from(dir);
            }
        }
        if let Ok(v) = env::var("DISPATCHER_RS_OUTBOUND_QUEUE_CAPACITY") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.agent.outbound_queue_capacity = n.max(1);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host must not be empty");
        }
        if self.server.api_port == 0 {
            anyhow::bail!("server.api_port must be > 0");
        }
        if self.server.websocket_port == 0 {
            anyhow::bail!("server.websocket_port must be > 0");
        }
        if self.server.http_timeout_secs == 0 {
            anyhow::bail!("server.http_timeout_secs must be > 0");
        }
        if self.server.ssl_cert.is_some() && !self.server.ssl {
            anyhow::bail!("server.ssl_cert requires server.ssl = true");
        }
        if self.agent.agent_name.trim().is_empty() {
            anyhow::bail!("agent.agent_name must not be empty");
        }
        if self.agent.outbound_queue_capacity == 0 {
            anyhow::bail!("agent.outbound_queue_capacity must be > 0");
        }
        if self.agent.registration_attempts == 0 {
            anyhow::bail!("agent.registration_attempts must be > 0");
        }
        for (name, executor) in &self.executors {
            validate_executor_name(name)?;
            if executor.max_size == 0 {
                anyhow::bail!("executors.{name}.max_size must be > 0");
            }
            if executor.cmd.trim().is_empty() && executor.repo_executor.is_none() {
                anyhow::bail!("executors.{name} needs either cmd or repo_executor");
            }
        }
        Ok(())
    }
}

fn normalize_optional_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_api_port() -> u16 {
    5985
}

fn default_websocket_port() -> u16 {
    9000
}

fn default_http_timeout_secs() -> u64 {
    5
}

fn default_agent_name() -> String {
    "unnamed_agent".to_owned()
}

fn default_executors_dir() -> PathBuf {
    PathBuf::from("executors")
}

fn default_interpreter() -> String {
    "python3".to_owned()
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_registration_attempts() -> u32 {
    3
}

fn default_registration_retry_delay_ms() -> u64 {
    1_000
}

fn default_close_grace_ms() -> u64 {
    250
}

fn default_max_size() -> usize {
    64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_dir;

    #[test]
    fn parses_executor_tables_with_params_and_varenvs() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            host = "faraday.local"
            api_port = 5986

            [agent]
            agent_name = "scanner-01"

            [executors.nmap]
            cmd = "nmap-wrapper"
            max_size = 1024
            check_cmds = ["which nmap"]

            [executors.nmap.params.target]
            mandatory = true
            type = "string"

            [executors.nmap.params.port_list]
            type = "list"
            base = "list"

            [executors.nmap.varenvs]
            api_key = "abc"
            "#,
        )
        .expect("parse config");

        assert_eq!(cfg.server.websocket_port, 9000);
        assert_eq!(cfg.agent.agent_name, "scanner-01");
        let nmap = cfg.executors.get("nmap").expect("nmap executor");
        assert_eq!(nmap.max_size, 1024);
        assert!(nmap.params.get("target").expect("target").mandatory);
        assert!(!nmap.params.get("port_list").expect("port_list").mandatory);
        assert_eq!(nmap.varenvs.get("api_key").map(String::as_str), Some("abc"));
        cfg.validate().expect("valid config");
    }

    #[test]
    fn urls_follow_ssl_mode() {
        let mut cfg = Config::default();
        assert_eq!(
            cfg.server.api_url(INFO_PATH),
            "http://localhost:5985/_api/v3/info"
        );
        assert_eq!(cfg.server.websocket_url(), "ws://localhost:9000/websockets");
        cfg.server.ssl = true;
        assert_eq!(cfg.server.api_base_url(), "https://localhost:5985");
        assert_eq!(cfg.server.websocket_url(), "wss://localhost:9000/websockets");
    }

    #[test]
    fn validate_rejects_executor_names_with_spaces() {
        let mut cfg = Config::default();
        cfg.executors.insert(
            "bad name".to_owned(),
            ExecutorConfig {
                cmd: "true".to_owned(),
                max_size: 10,
                ..ExecutorConfig::default()
            },
        );
        let err = cfg.validate().expect_err("space in name must fail");
        assert!(err.to_string().contains("bad name"));
    }

    #[test]
    fn validate_rejects_cert_without_ssl() {
        let mut cfg = Config::default();
        cfg.server.ssl_cert = Some(PathBuf::from("/tmp/ca.pem"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_keeps_agent_token() {
        let root = temp_dir("save");
        let path = root.join("dispatcher-rs.toml");
        let mut cfg = Config::default();
        cfg.tokens.agent = Some("long-lived".to_owned());
        cfg.executors.insert(
            "echo".to_owned(),
            ExecutorConfig {
                cmd: "echo".to_owned(),
                max_size: 128,
                ..ExecutorConfig::default()
            },
        );
        cfg.save(&path).expect("save config");
        assert!(!path.with_extension("toml.tmp").exists());

        let text = std::fs::read_to_string(&path).expect("read saved config");
        let reloaded: Config = toml::from_str(&text).expect("parse saved config");
        assert_eq!(reloaded.tokens.agent.as_deref(), Some("long-lived"));
        assert!(reloaded.executors.contains_key("echo"));
    }

    #[test]
    fn persisted_token_leaves_overrides_off_disk() {
        let root = temp_dir("persist");
        let path = root.join("dispatcher-rs.toml");
        std::fs::write(
            &path,
            "[server]\nhost = \"prod.example\"\n\n[agent]\nagent_name = \"scanner-01\"\n",
        )
        .expect("seed config");

        let mut cfg = Config::load(&path).expect("load config");
        cfg.apply_cli_overrides(Some("debug-host.local"), Some("one-off-name"));
        Config::persist_agent_token(&path, "long-lived").expect("persist token");

        let text = std::fs::read_to_string(&path).expect("read saved config");
        let stored: Config = toml::from_str(&text).expect("parse saved config");
        assert_eq!(stored.server.host, "prod.example");
        assert_eq!(stored.agent.agent_name, "scanner-01");
        assert_eq!(stored.tokens.agent.as_deref(), Some("long-lived"));
        assert_eq!(cfg.server.host, "debug-host.local");
    }

    #[test]
    fn cli_overrides_ignore_blank_values() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(Some("  "), Some("agent-x"));
        assert_eq!(cfg.server.host, "localhost");
        assert_eq!(cfg.agent.agent_name, "agent-x");
    }
}
