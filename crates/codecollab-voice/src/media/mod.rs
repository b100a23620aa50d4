//! Microphone capture, muting, and speech-activity metering.
//!
//! [`MediaDevices`] is the seam to the platform audio stack. [`LocalMedia`]
//! owns the local capture; [`LevelMeter`] turns an analyser into a
//! speaking / silent decision and is used for remote streams as well.

mod level;
mod local;
mod synthetic;
mod types;

pub use level::LevelMeter;
pub use local::LocalMedia;
pub use synthetic::{SyntheticDevices, SyntheticMicrophone};
pub use types::{AudioAnalyser, AudioConstraints, AudioTrack, MediaDevices, MediaError, MediaStream};
