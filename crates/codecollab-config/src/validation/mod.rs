//! Full configuration validation.
//!
//! Each section has its own submodule; this orchestrator calls them all
//! and collects errors into a single `ConfigError`.

mod helpers;
mod network;
mod voice;


use crate::schema::CodeCollabConfig;
use codecollab_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &CodeCollabConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    voice::validate_voice(&mut errors, config);
    network::validate_heartbeat(&mut errors, config);
    network::validate_store(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
