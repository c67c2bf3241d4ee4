/// Inference adapter
///
/// Wraps an external network runtime: shapes a feature window into the
/// batched tensor the runtime expects, runs one forward pass and unwraps the
/// scalar score.

use crate::features::{add_deltas, FeatureMatrix};
use crate::params::{ListenerParams, ParamsError};
use std::borrow::Cow;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Input shape mismatch: got {actual:?}, model expects {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Inference engine failed: {0}")]
    Engine(#[source] anyhow::Error),

    #[error("Inference engine returned {actual} scores for a batch of {expected}")]
    OutputSize { expected: usize, actual: usize },
}

/// Network runtime with a loaded model
///
/// `input` is a row-major `[batch, rows, cols]` tensor; the result holds one
/// score per batch entry.
#[cfg_attr(test, mockall::automock)]
pub trait InferenceEngine: Send {
    fn invoke(&mut self, input: &[f32], shape: [usize; 3]) -> anyhow::Result<Vec<f32>>;
}

/// Runs the inference engine over feature windows
pub struct InferenceAdapter {
    engine: Box<dyn InferenceEngine>,
    use_delta: bool,
    input_shape: (usize, usize),
}

impl InferenceAdapter {
    pub fn new(engine: Box<dyn InferenceEngine>, params: &ListenerParams) -> Result<Self, ParamsError> {
        params.validate()?;

        let input_shape = (params.n_frames(), params.feature_size());
        debug!("Inference input shape: {:?}, deltas: {}", input_shape, params.use_delta);

        Ok(Self {
            engine,
            use_delta: params.use_delta,
            input_shape,
        })
    }

    /// Score a single feature window
    pub fn run(&mut self, features: &FeatureMatrix) -> Result<f32, InferenceError> {
        let scores = self.predict(std::slice::from_ref(features))?;
        Ok(scores[0])
    }

    /// Score a batch of windows, one forward pass per window
    pub fn predict(&mut self, windows: &[FeatureMatrix]) -> Result<Vec<f32>, InferenceError> {
        let mut scores = Vec::with_capacity(windows.len());

        for window in windows {
            let input = if self.use_delta {
                Cow::Owned(add_deltas(window))
            } else {
                Cow::Borrowed(window)
            };

            let actual = (input.rows(), input.cols());
            if actual != self.input_shape {
                return Err(InferenceError::ShapeMismatch {
                    expected: self.input_shape,
                    actual,
                });
            }

            let output = self
                .engine
                .invoke(input.as_slice(), [1, actual.0, actual.1])
                .map_err(InferenceError::Engine)?;

            let score = *output.first().ok_or(InferenceError::OutputSize {
                expected: 1,
                actual: 0,
            })?;

            trace!("Raw score: {:.4}", score);
            scores.push(score);
        }

        Ok(scores)
    }

    /// Shape `(rows, cols)` of the matrices handed to the engine
    pub fn input_shape(&self) -> (usize, usize) {
        self.input_shape
    }
}
