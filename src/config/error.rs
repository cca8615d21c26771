#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("fsm definition `{path}` is invalid: {reason}")]
    Definition { path: String, reason: String },
    #[error("mcp server `{server_id}` is not configured")]
    MissingServer { server_id: String },
}
