//! Configuration schema types.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod heartbeat;
mod store;
mod system;
mod voice;

pub use heartbeat::*;
pub use store::*;
pub use system::*;
pub use voice::*;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration.
///
/// Only override what you want to change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeCollabConfig {
    pub voice: VoiceConfig,
    pub heartbeat: HeartbeatConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}
