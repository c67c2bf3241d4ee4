/// Listener parameters
///
/// Time/rate settings for the feature window and the sample counts derived
/// from them. Every other component sizes itself from these values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Sample rate the listener is trained for
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per sample (16-bit PCM)
pub const SAMPLE_DEPTH: u16 = 2;

#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("Invalid parameter: {0}")]
    Invalid(String),

    #[error("Feature window holds no frames: buffer of {buffer} samples is shorter than window of {window} samples")]
    EmptyFeatureWindow { buffer: usize, window: usize },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parameters describing how audio is windowed into feature frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerParams {
    /// Window length in seconds (audio span of one feature frame)
    pub window_t: f64,

    /// Hop length in seconds (stride between frames)
    pub hop_t: f64,

    /// Total audio span covered by the feature matrix, in seconds
    pub buffer_t: f64,

    /// Samples per second
    pub sample_rate: u32,

    /// Bytes per sample; only 16-bit PCM is supported
    pub sample_depth: u16,

    /// Width of one feature frame as produced by the vectorizer
    pub feature_dim: usize,

    /// Append first-order deltas before inference (doubles the width)
    pub use_delta: bool,

    /// `(mu, std)` pairs of the raw-output distribution used for calibration
    pub threshold_config: Vec<(f64, f64)>,

    /// Calibrated value that maps to a probability of 0.5
    pub threshold_center: f64,
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self {
            window_t: 1.0,
            hop_t: 0.02,
            buffer_t: 1.96,
            sample_rate: SAMPLE_RATE,
            sample_depth: SAMPLE_DEPTH,
            feature_dim: 13,
            use_delta: false,
            threshold_config: vec![(6.0, 4.0)],
            threshold_center: 0.2,
        }
    }
}

impl ListenerParams {
    /// Load parameters from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let params: Self = serde_json::from_str(&raw)?;
        params.validate()?;
        debug!("Loaded listener params from {}", path.as_ref().display());
        Ok(params)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.sample_rate == 0 {
            return Err(ParamsError::Invalid(
                "sample_rate must be greater than 0".to_string()
            ));
        }

        // Decoding, WAV and microphone input are all 16-bit PCM
        if self.sample_depth != SAMPLE_DEPTH {
            return Err(ParamsError::Invalid(format!(
                "sample_depth must be {} (16-bit PCM), got {}",
                SAMPLE_DEPTH, self.sample_depth
            )));
        }

        if !(self.window_t > 0.0) {
            return Err(ParamsError::Invalid(
                "window_t must be greater than 0".to_string()
            ));
        }

        if !(self.hop_t > 0.0) || self.hop_samples() == 0 {
            return Err(ParamsError::Invalid(
                "hop_t must cover at least one sample".to_string()
            ));
        }

        if self.buffer_t < self.window_t {
            return Err(ParamsError::Invalid(format!(
                "buffer_t ({}) must not be shorter than window_t ({})",
                self.buffer_t, self.window_t
            )));
        }

        // Rounding buffer_samples down to a hop multiple can still undercut the window
        if self.buffer_samples() < self.window_samples() {
            return Err(ParamsError::EmptyFeatureWindow {
                buffer: self.buffer_samples(),
                window: self.window_samples(),
            });
        }

        if self.feature_dim == 0 {
            return Err(ParamsError::Invalid(
                "feature_dim must be greater than 0".to_string()
            ));
        }

        if self.threshold_config.is_empty() {
            return Err(ParamsError::Invalid(
                "threshold_config needs at least one (mu, std) pair".to_string()
            ));
        }

        if self.threshold_config.iter().any(|&(mu, std)| !mu.is_finite() || !(std > 0.0)) {
            return Err(ParamsError::Invalid(
                "threshold_config entries need a finite mu and a positive std".to_string()
            ));
        }

        if !(self.threshold_center > 0.0 && self.threshold_center < 1.0) {
            return Err(ParamsError::Invalid(
                "threshold_center must be between 0.0 and 1.0 (exclusive)".to_string()
            ));
        }

        Ok(())
    }

    /// Samples in one analysis window
    pub fn window_samples(&self) -> usize {
        round_samples(self.sample_rate as f64 * self.window_t)
    }

    /// Samples between the starts of consecutive windows
    pub fn hop_samples(&self) -> usize {
        round_samples(self.sample_rate as f64 * self.hop_t)
    }

    /// Largest multiple of `hop_samples` that fits in `buffer_t`
    pub fn buffer_samples(&self) -> usize {
        let samples = round_samples(self.sample_rate as f64 * self.buffer_t);
        let hop = self.hop_samples();
        if hop == 0 {
            return 0;
        }
        hop * (samples / hop)
    }

    /// Number of feature frames held by the rolling feature matrix
    pub fn n_frames(&self) -> usize {
        let (buffer, window, hop) = (self.buffer_samples(), self.window_samples(), self.hop_samples());
        if hop == 0 || buffer < window {
            return 0;
        }
        1 + (buffer - window) / hop
    }

    /// Upper bound of raw samples spanned by the buffer
    pub fn max_samples(&self) -> usize {
        (self.buffer_t * self.sample_rate as f64) as usize
    }

    /// Width of the matrix handed to the inference engine
    pub fn feature_size(&self) -> usize {
        if self.use_delta {
            self.feature_dim * 2
        } else {
            self.feature_dim
        }
    }
}

fn round_samples(value: f64) -> usize {
    if value <= 0.0 {
        return 0;
    }
    (value + 0.5).floor() as usize
}
