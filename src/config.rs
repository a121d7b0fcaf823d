//! Typed application configuration. Loaded from a TOML file given on the
//! CLI, with a handful of env var overrides layered on top for the fields
//! an operator commonly wants to change at deploy time without touching the
//! file.

use serde::Deserialize;

fn default_upstream_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    8081
}

fn default_upstream_base_path() -> String {
    "/api/v2/".to_string()
}

fn default_listen_port() -> u16 {
    8082
}

fn default_api_version() -> u32 {
    2
}

fn default_max_trigger_iterations() -> u32 {
    64
}

fn default_upstream_reply_timeout_ms() -> u64 {
    10_000
}

fn default_upstream_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    #[serde(default = "default_upstream_base_path")]
    pub upstream_base_path: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_api_version")]
    pub api_version: u32,
    #[serde(default = "default_max_trigger_iterations")]
    pub max_trigger_iterations: u32,
    #[serde(default = "default_upstream_reply_timeout_ms")]
    pub upstream_reply_timeout_ms: u64,
    #[serde(default = "default_upstream_connect_timeout_ms")]
    pub upstream_connect_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upstream_host: default_upstream_host(),
            upstream_port: default_upstream_port(),
            upstream_base_path: default_upstream_base_path(),
            listen_port: default_listen_port(),
            api_version: default_api_version(),
            max_trigger_iterations: default_max_trigger_iterations(),
            upstream_reply_timeout_ms: default_upstream_reply_timeout_ms(),
            upstream_connect_timeout_ms: default_upstream_connect_timeout_ms(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => AppConfig::default(),
        };

        if let Ok(host) = std::env::var("MSG_UPSTREAM_HOST") {
            config.upstream_host = host;
        }
        if let Ok(port) = std::env::var("MSG_UPSTREAM_PORT") {
            config.upstream_port = port.parse()?;
        }
        if let Ok(port) = std::env::var("MSG_LISTEN_PORT") {
            config.listen_port = port.parse()?;
        }

        Ok(config)
    }

    pub fn upstream_base_url(&self) -> Result<url::Url, url::ParseError> {
        url::Url::parse(&format!(
            "http://{}:{}{}",
            self.upstream_host, self.upstream_port, self.upstream_base_path
        ))
    }

    pub fn api_prefix(&self) -> String {
        format!("/api/v{}", self.api_version)
    }

    pub fn reply_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.upstream_reply_timeout_ms)
    }
}
