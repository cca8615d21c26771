use super::{extract_json_document, ModelClient, ModelError, PromptMessage};
use crate::config::ModelSettings;
use serde_json::{json, Value};
use std::time::Duration;

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct HttpModelClient {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpModelClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpModelClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    pub fn from_settings(settings: &ModelSettings) -> Result<Self, ModelError> {
        let api_key = match settings.api_key_env.as_ref() {
            Some(env) => Some(std::env::var(env).map_err(|_| ModelError::MissingApiKey {
                env: env.clone(),
            })?),
            None => None,
        };
        Ok(Self::new(
            settings.endpoint.clone(),
            settings.model.clone(),
            api_key,
            settings.timeout(),
        ))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    fn request_body(&self, messages: &[PromptMessage]) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "response_format": {"type": "json_object"},
        })
    }
}

impl ModelClient for HttpModelClient {
    fn complete(&self, messages: &[PromptMessage]) -> Result<Value, ModelError> {
        let url = self.completions_url();
        let mut request = self.agent.post(&url);
        if let Some(key) = self.api_key.as_ref() {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        let response = match request.send_json(self.request_body(messages)) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                return Err(ModelError::Status {
                    endpoint: url,
                    status,
                    body: response.into_string().unwrap_or_default(),
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(ModelError::Network {
                    endpoint: url,
                    reason: transport.to_string(),
                })
            }
        };

        let body: Value = response.into_json().map_err(|err| ModelError::Malformed {
            raw: String::new(),
            reason: format!("response body is not json: {err}"),
        })?;
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::Malformed {
                raw: body.to_string(),
                reason: "response has no choices[0].message.content".to_string(),
            })?;
        extract_json_document(content)
    }
}
