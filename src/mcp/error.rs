#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("mcp server binary `{binary}` not found")]
    MissingBinary { binary: String },
    #[error("failed to spawn mcp server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mcp server `{server}` is not configured")]
    UnknownServer { server: String },
    #[error("bridge `{server}` is closed")]
    Closed { server: String },
    #[error("request has no usable id: {request}")]
    MissingRequestId { request: String },
    #[error("request id {id} is already awaiting a response")]
    DuplicateRequestId { id: String },
    #[error("mcp server returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("mcp request `{method}` timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("mcp server sent an invalid message: {reason}")]
    Protocol { reason: String },
}

pub(crate) fn io_error(path: impl Into<String>, source: std::io::Error) -> McpError {
    McpError::Io {
        path: path.into(),
        source,
    }
}
