/// Pipeline runner
///
/// Owns the background worker that pulls audio chunks from a source, scores
/// them with the listener and debounces the scores into activations. The
/// caller's callbacks run on the worker, in chunk order.

use crate::audio_buffer::BlockingByteBuffer;
use crate::detector::{ActivationDetector, REFERENCE_CHUNK_SIZE};
use crate::listener::{Listener, ListenerError};
use crate::microphone::MicrophoneSource;
use crate::params::ParamsError;
use crate::source::{AudioSource, SourceError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Invalid runner configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error("Audio source error: {0}")]
    Source(#[from] SourceError),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Runner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Consecutive high chunks beyond which an activation fires
    /// (higher values add latency but reduce false positives)
    pub trigger_level: u32,

    /// 0.0 - 1.0, higher = more sensitive, more false positives
    pub sensitivity: f32,

    /// Bytes read from the source per iteration
    pub chunk_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            trigger_level: 3,
            sensitivity: 0.5,
            chunk_size: REFERENCE_CHUNK_SIZE,
        }
    }
}

impl RunnerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RunnerError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), RunnerError> {
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(RunnerError::InvalidConfig(
                "sensitivity must be between 0.0 and 1.0".to_string()
            ));
        }

        if self.chunk_size == 0 {
            return Err(RunnerError::InvalidConfig(
                "chunk_size must be greater than 0".to_string()
            ));
        }

        Ok(())
    }
}

/// Wake-word activation
#[derive(Debug, Clone)]
pub struct WakeWordEvent {
    /// When the activation fired (microseconds since epoch)
    pub timestamp: i64,

    /// Calibrated probability of the chunk that fired
    pub probability: f32,

    /// Index of that chunk since `start`
    pub chunk_index: u64,
}

/// Runner statistics
#[derive(Debug, Clone)]
pub struct RunnerStats {
    pub chunks_processed: u64,
    pub activations: u64,
    pub errors: u64,
    pub is_running: bool,
}

type PredictionCallback = Arc<dyn Fn(f32) + Send + Sync>;
type ActivationCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ListenerError) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    on_prediction: Option<PredictionCallback>,
    on_activation: Option<ActivationCallback>,
    on_error: Option<ErrorCallback>,
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    worker_id: Mutex<Option<ThreadId>>,
    chunks_processed: AtomicU64,
    activations: AtomicU64,
    errors: AtomicU64,
}

impl Shared {
    fn on_worker_thread(&self) -> bool {
        *self.worker_id.lock() == Some(thread::current().id())
    }
}

#[derive(Default)]
struct SourceSlot {
    source: Option<Box<dyn AudioSource>>,
    /// Opened by the runner itself, released on stop
    owned: bool,
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    interrupt: Option<Arc<BlockingByteBuffer>>,
}

/// Runs a `Listener` over an audio source on a background thread
pub struct PipelineRunner {
    config: RunnerConfig,
    sample_rate: u32,
    sample_depth: usize,
    listener: Arc<Mutex<Listener>>,
    source: Arc<Mutex<SourceSlot>>,
    callbacks: Arc<Callbacks>,
    shared: Arc<Shared>,
    worker: Mutex<Option<WorkerHandle>>,
    event_tx: mpsc::UnboundedSender<WakeWordEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WakeWordEvent>>,
}

impl PipelineRunner {
    /// Create a stopped runner; without `with_source` it listens on the default microphone
    pub fn new(listener: Listener, config: RunnerConfig) -> Result<Self, RunnerError> {
        config.validate()?;

        let sample_rate = listener.params().sample_rate;
        let sample_depth = listener.params().sample_depth as usize;
        if config.chunk_size % sample_depth != 0 {
            return Err(RunnerError::InvalidConfig(format!(
                "chunk_size ({}) must be a multiple of the sample depth ({})",
                config.chunk_size, sample_depth
            )));
        }

        info!(
            "Initializing pipeline runner: trigger_level={}, sensitivity={}, chunk_size={}",
            config.trigger_level, config.sensitivity, config.chunk_size
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            sample_rate,
            sample_depth,
            config,
            listener: Arc::new(Mutex::new(listener)),
            source: Arc::new(Mutex::new(SourceSlot::default())),
            callbacks: Arc::new(Callbacks::default()),
            shared: Arc::new(Shared::default()),
            worker: Mutex::new(None),
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
        })
    }

    /// Read audio from `source` instead of the microphone
    pub fn with_source(self, source: impl AudioSource + 'static) -> Self {
        *self.source.lock() = SourceSlot {
            source: Some(Box::new(source)),
            owned: false,
        };
        self
    }

    /// Called with the probability of every chunk
    pub fn on_prediction(mut self, callback: impl Fn(f32) + Send + Sync + 'static) -> Self {
        Arc::make_mut(&mut self.callbacks).on_prediction = Some(Arc::new(callback));
        self
    }

    /// Called when the wake word is heard
    pub fn on_activation(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Arc::make_mut(&mut self.callbacks).on_activation = Some(Arc::new(callback));
        self
    }

    /// Called when a chunk could not be scored; the runner keeps going
    pub fn on_error(mut self, callback: impl Fn(&ListenerError) + Send + Sync + 'static) -> Self {
        Arc::make_mut(&mut self.callbacks).on_error = Some(Arc::new(callback));
        self
    }

    /// Start listening on a background thread
    ///
    /// Starting a running runner logs a warning and does nothing.
    pub fn start(&self) -> Result<(), RunnerError> {
        if self.shared.on_worker_thread() {
            warn!("start() called from the runner's own worker, ignoring");
            return Ok(());
        }

        let mut worker = self.worker.lock();

        if self.shared.running.load(Ordering::Acquire) {
            warn!("Runner already running");
            return Ok(());
        }

        // The previous worker stopped on its own (end of stream)
        if let Some(finished) = worker.take() {
            join_worker(finished.thread);
        }

        self.listener.lock().clear();

        let interrupt = {
            let mut slot = self.source.lock();
            if slot.source.is_none() {
                let frames = (self.config.chunk_size / self.sample_depth) as u32;
                let microphone = MicrophoneSource::open(self.sample_rate, frames)?;
                *slot = SourceSlot {
                    source: Some(Box::new(microphone)),
                    owned: true,
                };
            }
            slot.source.as_ref().and_then(|s| s.interrupt_handle())
        };

        self.shared.running.store(true, Ordering::Release);
        self.shared.chunks_processed.store(0, Ordering::Relaxed);

        let context = WorkerContext {
            listener: self.listener.clone(),
            source: self.source.clone(),
            callbacks: self.callbacks.clone(),
            shared: self.shared.clone(),
            events: self.event_tx.clone(),
            detector: ActivationDetector::new(
                self.config.chunk_size,
                self.config.sensitivity,
                self.config.trigger_level,
            ),
            chunk_size: self.config.chunk_size,
        };

        let thread = thread::Builder::new()
            .name("wakeword-runner".to_string())
            .spawn(move || context.run())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                RunnerError::Spawn(e)
            })?;

        *worker = Some(WorkerHandle { thread, interrupt });

        info!("Pipeline runner started");
        Ok(())
    }

    /// Stop listening and wait for the worker to exit
    ///
    /// No-op when not running. When called from a callback on the worker the
    /// loop exits after the current chunk instead of being joined.
    pub fn stop(&self) {
        if self.shared.on_worker_thread() {
            self.shared.running.store(false, Ordering::Release);
            debug!("Stop requested from the worker thread");
            return;
        }

        let mut worker = self.worker.lock();

        if let Some(handle) = worker.take() {
            self.shared.running.store(false, Ordering::Release);

            // Unblock a read waiting on a buffer-backed source; no bytes are
            // written, so nothing stale is left for the next run
            if let Some(buffer) = &handle.interrupt {
                buffer.interrupt();
            }

            join_worker(handle.thread);
            *self.shared.worker_id.lock() = None;

            if let Some(buffer) = &handle.interrupt {
                buffer.resume();
            }
            info!("Pipeline runner stopped");
        }

        let mut slot = self.source.lock();
        if slot.owned {
            *slot = SourceSlot::default();
            info!("Released microphone");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Get current statistics
    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            chunks_processed: self.shared.chunks_processed.load(Ordering::Relaxed),
            activations: self.shared.activations.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
            is_running: self.is_running(),
        }
    }

    /// Get the next activation event (non-blocking)
    ///
    /// The event channel is unbounded: events pile up for as long as the
    /// caller does not drain them.
    pub fn try_recv_event(&self) -> Option<WakeWordEvent> {
        let mut rx = self.event_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Get the next activation event (waits)
    pub async fn recv_event(&self) -> Option<WakeWordEvent> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

impl Drop for PipelineRunner {
    /// Make sure the worker and any device are released when the owner goes away
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!("Runner worker thread panicked");
    }
}

/// Everything the worker thread owns or shares
struct WorkerContext {
    listener: Arc<Mutex<Listener>>,
    source: Arc<Mutex<SourceSlot>>,
    callbacks: Arc<Callbacks>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<WakeWordEvent>,
    detector: ActivationDetector,
    chunk_size: usize,
}

impl WorkerContext {
    fn run(mut self) {
        // Must be visible before any callback can call back into the runner
        *self.shared.worker_id.lock() = Some(thread::current().id());
        debug!("Runner worker started");

        while self.shared.running.load(Ordering::Acquire) {
            let read = match self.source.lock().source.as_mut() {
                Some(source) => source.read_chunk(self.chunk_size),
                None => Err(SourceError::EndOfStream),
            };

            // Read returned after stop() was requested (possibly interrupted)
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }

            let chunk = match read {
                Ok(Some(chunk)) => chunk,
                // Timed out waiting for audio, try again
                Ok(None) => continue,
                Err(SourceError::EndOfStream) => {
                    info!("Audio stream ended");
                    break;
                }
                Err(e) => {
                    error!("Audio source failed: {}", e);
                    self.shared.errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            };

            if !self.process(&chunk) {
                break;
            }
        }

        self.shared.running.store(false, Ordering::Release);
        debug!("Runner worker exited");
    }

    /// Score one chunk and deliver callbacks; false once the stream has ended
    fn process(&mut self, chunk: &[u8]) -> bool {
        let chunk_index = self.shared.chunks_processed.fetch_add(1, Ordering::Relaxed);

        let result = self.listener.lock().update(chunk);
        let prob = match result {
            Ok(prob) => prob,
            Err(e) if e.is_end_of_stream() => {
                info!("Audio stream ended");
                return false;
            }
            Err(e) => {
                self.shared.errors.fetch_add(1, Ordering::Relaxed);
                error!("Prediction failed for chunk {}: {}", chunk_index, e);
                if let Some(on_error) = &self.callbacks.on_error {
                    on_error(&e);
                }
                return true;
            }
        };

        if let Some(on_prediction) = &self.callbacks.on_prediction {
            on_prediction(prob);
        }

        if self.detector.update(prob) {
            self.shared.activations.fetch_add(1, Ordering::Relaxed);
            info!("Wake word detected! (chunk {}, probability {:.3})", chunk_index, prob);

            if let Some(on_activation) = &self.callbacks.on_activation {
                on_activation();
            }

            let event = WakeWordEvent {
                timestamp: current_timestamp_micros(),
                probability: prob,
                chunk_index,
            };
            // Only fails once the runner, and with it the receiver, is gone
            let _ = self.events.send(event);
        }

        true
    }
}

fn current_timestamp_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}
