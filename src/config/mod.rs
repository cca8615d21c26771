pub mod error;
pub mod load;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_definition, load_settings};
pub use settings::{EngineSettings, McpServerConfig, ModelSettings};
