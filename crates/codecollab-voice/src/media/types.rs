//! Media stream handles and the device trait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use codecollab_common::new_id;
use codecollab_config::CaptureConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("analyser is already closed")]
    AnalyserClosed,

    #[error("audio analysis failed: {0}")]
    Analysis(String),
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Capture processing requested from the device. Audio only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl From<&CaptureConfig> for AudioConstraints {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracks & streams
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TrackInner {
    id: String,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
    /// Sending-side track this one receives from.
    source: Option<AudioTrack>,
}

/// One audio track. Clones share state, so disabling a track is seen by
/// every holder of the stream.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    inner: Arc<TrackInner>,
}

impl AudioTrack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: new_id(),
                label: label.into(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                source: None,
            }),
        }
    }

    /// Receiving-side copy of this track. It has its own enabled and live
    /// flags but only carries sound while the source does.
    pub fn mirror(&self) -> AudioTrack {
        Self {
            inner: Arc::new(TrackInner {
                id: new_id(),
                label: self.inner.label.clone(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                source: Some(self.clone()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Enabled, live, and fed by a source that is too.
    pub fn is_producing(&self) -> bool {
        self.is_enabled()
            && self.is_live()
            && self.inner.source.as_ref().map_or(true, AudioTrack::is_producing)
    }

    /// End the track. A stopped track is also disabled and never restarts.
    pub fn stop(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.live.store(false, Ordering::SeqCst);
    }
}

/// A set of audio tracks from one source.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<AudioTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<AudioTrack>) -> Self {
        Self { id: new_id(), tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[AudioTrack] {
        &self.tracks
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Receiving-side copy, as delivered to a remote peer.
    pub fn mirror(&self) -> MediaStream {
        Self::new(self.tracks.iter().map(AudioTrack::mirror).collect())
    }

    /// True while any track is still live.
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(AudioTrack::is_live)
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaStream {}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Frequency-domain view of a stream.
pub trait AudioAnalyser: Send {
    /// Number of bins, half the FFT size.
    fn frequency_bin_count(&self) -> usize;

    /// Fill `out` with the current byte magnitudes (0-255).
    fn byte_frequency_data(&mut self, out: &mut [u8]) -> Result<(), MediaError>;

    /// Release the analysis graph. Closing twice is an error.
    fn close(&mut self) -> Result<(), MediaError>;

    fn is_closed(&self) -> bool;
}

/// Platform audio stack.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the microphone. May wait on a permission prompt.
    async fn get_user_media(&self, constraints: &AudioConstraints) -> Result<MediaStream, MediaError>;

    /// Build an analysis graph over `stream`.
    fn create_analyser(
        &self,
        stream: &MediaStream,
        fft_size: u32,
    ) -> Result<Box<dyn AudioAnalyser>, MediaError>;
}
