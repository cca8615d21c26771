use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod http;
pub mod output_parse;

pub use http::HttpModelClient;
pub use output_parse::extract_json_document;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request to {endpoint} failed: {reason}")]
    Network { endpoint: String, reason: String },
    #[error("model endpoint {endpoint} returned status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("model output is not a structured document: {reason}")]
    Malformed { raw: String, reason: String },
    #[error("api key environment variable `{env}` is not set")]
    MissingApiKey { env: String },
    #[error("model request interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: PromptRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(PromptRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(PromptRole::User, content)
    }
}

/// Black-box language model: prompt messages in, one structured document out.
pub trait ModelClient: Send + Sync {
    fn complete(&self, messages: &[PromptMessage]) -> Result<Value, ModelError>;
}
