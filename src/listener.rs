/// Listener: raw audio in, calibrated wake-word probability out
///
/// Chains the sliding feature window, the inference adapter and the
/// calibrator for one chunk at a time.

use crate::calibration::{Calibrator, ThresholdDecoder};
use crate::features::{FeatureMatrix, FeatureWindow, Vectorizer, WindowError};
use crate::inference::{InferenceAdapter, InferenceEngine, InferenceError};
use crate::params::{ListenerParams, ParamsError};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl ListenerError {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ListenerError::Window(WindowError::EndOfStream))
    }
}

pub struct Listener {
    params: ListenerParams,
    window: FeatureWindow,
    adapter: InferenceAdapter,
    calibrator: Box<dyn Calibrator>,
}

impl Listener {
    /// Build a listener calibrated with the `threshold_config` in `params`
    pub fn new(
        params: ListenerParams,
        vectorizer: Box<dyn Vectorizer>,
        engine: Box<dyn InferenceEngine>,
    ) -> Result<Self, ParamsError> {
        let window = FeatureWindow::new(&params, vectorizer)?;
        let adapter = InferenceAdapter::new(engine, &params)?;
        let calibrator = Box::new(ThresholdDecoder::from_params(&params)?);

        debug!("Listener ready: {} frames of {} features", params.n_frames(), params.feature_size());

        Ok(Self {
            params,
            window,
            adapter,
            calibrator,
        })
    }

    /// Replace the calibrator
    pub fn with_calibrator(mut self, calibrator: Box<dyn Calibrator>) -> Self {
        self.calibrator = calibrator;
        self
    }

    /// Feed a chunk of 16-bit PCM bytes and score the updated window
    ///
    /// An empty chunk reports the end of the stream.
    pub fn update(&mut self, chunk: &[u8]) -> Result<f32, ListenerError> {
        let features = self.window.ingest_bytes(chunk)?;
        let raw = self.adapter.run(features)?;
        Ok(self.score(raw))
    }

    /// Feed already decoded samples and score the updated window
    pub fn update_samples(&mut self, samples: &[f32]) -> Result<f32, ListenerError> {
        let features = self.window.ingest(samples)?;
        let raw = self.adapter.run(features)?;
        Ok(self.score(raw))
    }

    /// Drop all buffered audio and features
    pub fn clear(&mut self) {
        self.window.reset();
    }

    pub fn params(&self) -> &ListenerParams {
        &self.params
    }

    /// Current feature matrix
    pub fn features(&self) -> &FeatureMatrix {
        self.window.features()
    }

    fn score(&self, raw: f32) -> f32 {
        let prob = self.calibrator.calibrate(raw);
        trace!("raw={:.4} prob={:.4}", raw, prob);
        prob
    }
}
