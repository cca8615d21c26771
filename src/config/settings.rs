use super::ConfigError;
use crate::shared::ids::ServerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_await_timeout_ms() -> u64 {
    600_000
}

fn default_model_timeout_seconds() -> u64 {
    120
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_shed_timeout_ms() -> u64 {
    500
}

fn default_ping_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_await_timeout_ms")]
    pub await_timeout_ms: u64,
    #[serde(default)]
    pub log_root: Option<PathBuf>,
    #[serde(default)]
    pub model: Option<ModelSettings>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            await_timeout_ms: default_await_timeout_ms(),
            log_root: None,
            model: None,
            mcp_servers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSettings {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_model_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ModelSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_shed_timeout_ms")]
    pub shed_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

impl McpServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            request_timeout_ms: default_request_timeout_ms(),
            shed_timeout_ms: default_shed_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shed_timeout(&self) -> Duration {
        Duration::from_millis(self.shed_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl EngineSettings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.await_timeout_ms == 0 {
            return Err(ConfigError::Settings(
                "`await_timeout_ms` must be greater than zero".to_string(),
            ));
        }
        if let Some(root) = self.log_root.as_ref() {
            if !root.is_absolute() {
                return Err(ConfigError::Settings(
                    "`log_root` must be an absolute path".to_string(),
                ));
            }
        }
        if let Some(model) = self.model.as_ref() {
            if !(model.endpoint.starts_with("http://") || model.endpoint.starts_with("https://")) {
                return Err(ConfigError::Settings(format!(
                    "model endpoint `{}` must be an http(s) url",
                    model.endpoint
                )));
            }
            if model.model.trim().is_empty() {
                return Err(ConfigError::Settings(
                    "`model.model` must be non-empty".to_string(),
                ));
            }
        }
        for (server_id, server) in &self.mcp_servers {
            ServerId::parse(server_id).map_err(ConfigError::Settings)?;
            if server.command.trim().is_empty() {
                return Err(ConfigError::Settings(format!(
                    "mcp server `{server_id}` requires a command"
                )));
            }
            if server.request_timeout_ms == 0 {
                return Err(ConfigError::Settings(format!(
                    "mcp server `{server_id}` request_timeout_ms must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn server(&self, server_id: &str) -> Result<&McpServerConfig, ConfigError> {
        self.mcp_servers
            .get(server_id)
            .ok_or_else(|| ConfigError::MissingServer {
                server_id: server_id.to_string(),
            })
    }

    pub fn await_timeout(&self) -> Duration {
        Duration::from_millis(self.await_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_omitted_fields() {
        let settings: EngineSettings = serde_yaml::from_str(
            r#"
mcp_servers:
  test:
    command: python3
    args: [bin/mcp-test-server.py]
"#,
        )
        .expect("parse");
        assert_eq!(settings.max_retries, 3);
        let server = settings.server("test").expect("server");
        assert_eq!(server.request_timeout_ms, 30_000);
        assert_eq!(server.shed_timeout_ms, 500);
        assert_eq!(server.ping_timeout(), Duration::from_secs(2));
        settings.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_relative_log_root_and_bad_server_ids() {
        let mut settings = EngineSettings {
            log_root: Some(PathBuf::from("relative/logs")),
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());

        settings.log_root = None;
        settings
            .mcp_servers
            .insert("bad id".to_string(), McpServerConfig::new("python3"));
        let err = settings.validate().expect_err("bad id");
        assert!(err.to_string().contains("server id"));
    }

    #[test]
    fn missing_server_is_reported_by_id() {
        let settings = EngineSettings::default();
        let err = settings.server("ghost").expect_err("missing");
        assert!(matches!(err, ConfigError::MissingServer { .. }));
    }
}
