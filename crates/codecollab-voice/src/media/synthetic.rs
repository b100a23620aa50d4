//! Programmable audio devices for tests and local demos.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::types::{
    AudioAnalyser, AudioConstraints, AudioTrack, MediaDevices, MediaError, MediaStream,
};

#[derive(Default)]
struct Registry {
    /// Energy per track label; every bin reads this value.
    levels: HashMap<String, u8>,
    denied: HashSet<String>,
    open_analysers: usize,
    created_analysers: usize,
    captures: usize,
}

/// Shared registry of fake microphones, keyed by owner.
///
/// Tracks are labelled with their owner, so an analyser over a remote
/// stream reads the level set for whoever captured it.
#[derive(Clone, Default)]
pub struct SyntheticDevices {
    registry: Arc<Mutex<Registry>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device handle for `owner`'s machine.
    pub fn microphone(&self, owner: impl Into<String>) -> SyntheticMicrophone {
        SyntheticMicrophone {
            devices: self.clone(),
            owner: owner.into(),
        }
    }

    /// A stream as if captured by `owner`, without going through permission.
    pub fn stream_for(&self, owner: &str) -> MediaStream {
        MediaStream::new(vec![AudioTrack::new(owner)])
    }

    pub fn set_level(&self, owner: &str, level: u8) {
        self.registry().levels.insert(owner.to_string(), level);
    }

    /// Make `owner`'s permission prompt fail.
    pub fn deny(&self, owner: &str) {
        self.registry().denied.insert(owner.to_string());
    }

    pub fn open_analysers(&self) -> usize {
        self.registry().open_analysers
    }

    pub fn analysers_created(&self) -> usize {
        self.registry().created_analysers
    }

    /// Successful microphone captures so far.
    pub fn captures(&self) -> usize {
        self.registry().captures
    }

    fn level(&self, label: &str) -> u8 {
        self.registry().levels.get(label).copied().unwrap_or(0)
    }
}

/// One participant's view of [`SyntheticDevices`].
#[derive(Clone)]
pub struct SyntheticMicrophone {
    devices: SyntheticDevices,
    owner: String,
}

impl SyntheticMicrophone {
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl MediaDevices for SyntheticMicrophone {
    async fn get_user_media(&self, constraints: &AudioConstraints) -> Result<MediaStream, MediaError> {
        let mut registry = self.devices.registry();
        if registry.denied.contains(&self.owner) {
            return Err(MediaError::PermissionDenied(format!(
                "{} blocked microphone access",
                self.owner
            )));
        }
        registry.captures += 1;
        debug!(owner = %self.owner, ?constraints, "Synthetic microphone opened");
        Ok(MediaStream::new(vec![AudioTrack::new(self.owner.clone())]))
    }

    fn create_analyser(
        &self,
        stream: &MediaStream,
        fft_size: u32,
    ) -> Result<Box<dyn AudioAnalyser>, MediaError> {
        let track = stream
            .tracks()
            .first()
            .cloned()
            .ok_or_else(|| MediaError::Analysis("stream has no audio track".to_string()))?;
        let mut registry = self.devices.registry();
        registry.open_analysers += 1;
        registry.created_analysers += 1;
        Ok(Box::new(SyntheticAnalyser {
            devices: self.devices.clone(),
            track,
            bin_count: (fft_size / 2) as usize,
            closed: false,
        }))
    }
}

struct SyntheticAnalyser {
    devices: SyntheticDevices,
    track: AudioTrack,
    bin_count: usize,
    closed: bool,
}

impl AudioAnalyser for SyntheticAnalyser {
    fn frequency_bin_count(&self) -> usize {
        self.bin_count
    }

    fn byte_frequency_data(&mut self, out: &mut [u8]) -> Result<(), MediaError> {
        if self.closed {
            return Err(MediaError::AnalyserClosed);
        }
        // Disabled or ended tracks produce silence.
        let level = if self.track.is_producing() {
            self.devices.level(self.track.label())
        } else {
            0
        };
        out.fill(level);
        Ok(())
    }

    fn close(&mut self) -> Result<(), MediaError> {
        if self.closed {
            return Err(MediaError::AnalyserClosed);
        }
        self.closed = true;
        let mut registry = self.devices.registry();
        registry.open_analysers = registry.open_analysers.saturating_sub(1);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
