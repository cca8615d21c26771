use super::{ConfigError, EngineSettings};
use crate::fsm::FsmDefinition;
use crate::schema::SchemaValidator;
use std::fs;
use std::path::Path;

pub fn load_settings(path: &Path) -> Result<EngineSettings, ConfigError> {
    let settings = EngineSettings::from_path(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Loads a definition from YAML or JSON (JSON parses as YAML) and runs the
/// load-time meta-schema and structural checks.
pub fn load_definition(
    path: &Path,
    validator: &dyn SchemaValidator,
) -> Result<FsmDefinition, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let value: serde_json::Value =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    FsmDefinition::from_value(value, validator).map_err(|err| ConfigError::Definition {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}
