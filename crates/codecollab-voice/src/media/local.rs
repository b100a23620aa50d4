//! Local microphone capture.

use std::sync::Arc;

use codecollab_config::VoiceConfig;
use tracing::{info, warn};

use super::level::LevelMeter;
use super::types::{AudioConstraints, MediaDevices, MediaError, MediaStream};

/// Own microphone capture plus its analysis graph and mute flag.
///
/// Muting only flips `enabled` on the tracks, so peers holding the
/// stream keep it without renegotiating.
pub struct LocalMedia {
    devices: Arc<dyn MediaDevices>,
    constraints: AudioConstraints,
    fft_size: u32,
    threshold: u8,
    stream: Option<MediaStream>,
    meter: Option<LevelMeter>,
    muted: bool,
}

impl LocalMedia {
    pub fn new(devices: Arc<dyn MediaDevices>, config: &VoiceConfig) -> Self {
        Self {
            devices,
            constraints: AudioConstraints::from(&config.capture),
            fft_size: config.fft_size,
            threshold: config.speaking_threshold,
            stream: None,
            meter: None,
            muted: config.start_muted,
        }
    }

    /// Open the microphone, or return the stream already open.
    pub async fn acquire(&mut self) -> Result<MediaStream, MediaError> {
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }

        let stream = self.devices.get_user_media(&self.constraints).await?;
        stream.set_enabled(!self.muted);

        match self.devices.create_analyser(&stream, self.fft_size) {
            Ok(analyser) => self.meter = Some(LevelMeter::new(analyser, self.threshold)),
            Err(e) => warn!(error = %e, "Speaking detection unavailable for local stream"),
        }

        info!(stream = %stream.id(), muted = self.muted, "Microphone acquired");
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Release the current capture and open a fresh one.
    pub async fn reacquire(&mut self) -> Result<MediaStream, MediaError> {
        self.teardown();
        self.acquire().await
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Returns true if the mute state changed.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        if self.muted == muted {
            return false;
        }
        self.muted = muted;
        if let Some(stream) = &self.stream {
            stream.set_enabled(!muted);
        }
        info!(muted, "Local mute changed");
        true
    }

    /// Flip the mute state and return the new value.
    pub fn toggle_mute(&mut self) -> bool {
        let muted = !self.muted;
        self.set_muted(muted);
        muted
    }

    /// One speaking sample, or `None` without a stream. Muted is never speaking.
    pub fn sample_speaking(&mut self) -> Option<bool> {
        self.stream.as_ref()?;
        if self.muted {
            return Some(false);
        }
        Some(self.meter.as_mut().is_some_and(LevelMeter::is_speaking))
    }

    /// Close the analyser and stop every track. The mute flag survives.
    pub fn teardown(&mut self) {
        if let Some(mut meter) = self.meter.take() {
            meter.close();
        }
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
            info!(stream = %stream.id(), "Microphone released");
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.teardown();
    }
}
