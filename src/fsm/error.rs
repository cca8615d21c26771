use crate::config::ConfigError;
use crate::schema::SchemaViolation;

#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("fsm definition is invalid: {0}")]
    InvalidDefinition(String),
    #[error("document does not declare its transition as `id: [from, to]`")]
    MissingDiscriminator,
    #[error("no transition `[{from}, {to}]` is declared")]
    UnknownTransition { from: String, to: String },
    #[error("transition `[{from}, {to}]` does not leave an entry state")]
    NotEntryTransition { from: String, to: String },
    #[error("document rejected by transition `[{from}, {to}]`: {violation}")]
    Rejected {
        from: String,
        to: String,
        #[source]
        violation: SchemaViolation,
    },
    #[error("state `{state}` references unregistered action `{action}`")]
    UnknownAction { state: String, action: String },
    #[error("fsm `{fsm_id}` is not registered")]
    UnknownFsm { fsm_id: String },
    #[error("fsm instance `{instance_id}` already has a run in progress")]
    Busy { instance_id: String },
    #[error("fsm instance `{instance_id}` is stopped")]
    Stopped { instance_id: String },
    #[error("fsm instance `{instance_id}` was interrupted")]
    Interrupted { instance_id: String },
    #[error("child fsm `{fsm_id}` did not complete: {reason}")]
    ChildFailed { fsm_id: String, reason: String },
    #[error("action config for state `{state}` is invalid: {reason}")]
    ActionConfig { state: String, reason: String },
    #[error("trail replay failed at record {index}: {reason}")]
    Replay { index: usize, reason: String },
    #[error("trail was recorded against definition {recorded}, not {current}")]
    FingerprintMismatch { recorded: String, current: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ConfigError> for FsmError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
