//! Host configuration selection

use painter_config::{ConfigError, EngineConfig};

/// Path of a JSON config file; environment overrides apply when unset
pub const CONFIG_PATH_VAR: &str = "PAINTER_CONFIG";

/// Load from `PAINTER_CONFIG` if set, otherwise defaults plus `PAINTER_*` overrides
pub fn load() -> Result<EngineConfig, ConfigError> {
    match std::env::var(CONFIG_PATH_VAR) {
        Ok(path) => EngineConfig::load(path),
        Err(_) => EngineConfig::from_env(),
    }
}
