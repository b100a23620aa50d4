//! Voice chat configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Microphone processing flags requested when the capture device is opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Voice chat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub enabled: bool,
    /// Average frequency-bin energy (0-255) above which a stream counts as speaking.
    pub speaking_threshold: u8,
    /// Analyser FFT size; half of it is the number of sampled bins.
    pub fft_size: u32,
    /// Cadence of the speaking-detection loop in milliseconds.
    pub frame_interval_ms: u64,
    /// How long a closed peer lingers before it is reaped.
    pub close_grace_ms: u64,
    /// Force-close peers stuck negotiating longer than this. 0 disables.
    pub negotiation_timeout_secs: u64,
    pub max_peers: usize,
    pub start_muted: bool,
    pub ice_servers: Vec<String>,
    pub capture: CaptureConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            speaking_threshold: 20,
            fft_size: 512,
            frame_interval_ms: 16,
            close_grace_ms: 1500,
            negotiation_timeout_secs: 20,
            max_peers: 8,
            start_muted: false,
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            capture: CaptureConfig::default(),
        }
    }
}

impl VoiceConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.negotiation_timeout_secs))
    }
}
