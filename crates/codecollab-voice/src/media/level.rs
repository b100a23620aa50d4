//! Speech-activity metering over an analyser.

use tracing::warn;

use super::types::{AudioAnalyser, MediaError};

/// Speaking / silent classifier over one analysis graph.
///
/// The analyser is closed at most once, either explicitly or on drop.
pub struct LevelMeter {
    analyser: Option<Box<dyn AudioAnalyser>>,
    bins: Vec<u8>,
    threshold: u8,
}

impl LevelMeter {
    pub fn new(analyser: Box<dyn AudioAnalyser>, threshold: u8) -> Self {
        let bins = vec![0; analyser.frequency_bin_count()];
        Self {
            analyser: Some(analyser),
            bins,
            threshold,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Mean byte magnitude across all frequency bins.
    pub fn average_energy(&mut self) -> Result<f32, MediaError> {
        let analyser = self.analyser.as_mut().ok_or(MediaError::AnalyserClosed)?;
        if self.bins.is_empty() {
            return Ok(0.0);
        }
        analyser.byte_frequency_data(&mut self.bins)?;
        let sum: u32 = self.bins.iter().map(|&b| u32::from(b)).sum();
        Ok(sum as f32 / self.bins.len() as f32)
    }

    /// Sample once. A closed or failing analyser reads as silence.
    pub fn is_speaking(&mut self) -> bool {
        match self.average_energy() {
            Ok(energy) => energy > f32::from(self.threshold),
            Err(_) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.analyser.as_ref().map_or(true, |a| a.is_closed())
    }

    /// Release the analysis graph. Safe to call repeatedly.
    pub fn close(&mut self) {
        let Some(mut analyser) = self.analyser.take() else {
            return;
        };
        if analyser.is_closed() {
            return;
        }
        if let Err(e) = analyser.close() {
            warn!(error = %e, "Failed to close analyser");
        }
    }
}

impl Drop for LevelMeter {
    fn drop(&mut self) {
        self.close();
    }
}
