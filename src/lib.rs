/// Wake-word runner library
///
/// Streams 16-bit PCM audio through a sliding feature window and a
/// pluggable inference engine, calibrates the raw network output and
/// debounces the resulting probabilities into wake-word activations.
/// Feature extraction (`Vectorizer`) and the network itself
/// (`InferenceEngine`) are supplied by the caller.

pub mod audio_buffer;
pub mod calibration;
pub mod detector;
pub mod features;
pub mod inference;
pub mod listener;
pub mod microphone;
pub mod params;
pub mod runner;
pub mod source;

// Re-export main types
pub use audio_buffer::{bytes_to_audio, samples_to_bytes, AudioSample, BlockingByteBuffer};
pub use calibration::{Calibrator, PassThrough, ThresholdDecoder};
pub use detector::ActivationDetector;
pub use features::{FeatureMatrix, FeatureWindow, Vectorizer, WindowError};
pub use inference::{InferenceAdapter, InferenceEngine, InferenceError};
pub use listener::{Listener, ListenerError};
pub use microphone::MicrophoneSource;
pub use params::{ListenerParams, ParamsError, SAMPLE_DEPTH, SAMPLE_RATE};
pub use runner::{PipelineRunner, RunnerConfig, RunnerError, RunnerStats, WakeWordEvent};
pub use source::{AudioSource, BufferSource, ReaderSource, SourceError, WavSource};
