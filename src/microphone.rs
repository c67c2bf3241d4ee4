/// Microphone audio source
///
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated capture
/// thread. Its callback writes PCM bytes into a `BlockingByteBuffer` that the
/// pipeline reads from like any other buffer-backed source.

use crate::audio_buffer::{samples_to_bytes, BlockingByteBuffer};
use crate::source::{AudioSource, SourceError};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Default input device captured as 16-bit mono PCM
pub struct MicrophoneSource {
    buffer: Arc<BlockingByteBuffer>,
    shutdown: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
}

impl MicrophoneSource {
    /// Open the default input device
    ///
    /// Blocks until the stream is playing or failed to start.
    pub fn open(sample_rate: u32, frames_per_buffer: u32) -> Result<Self, SourceError> {
        let buffer = Arc::new(BlockingByteBuffer::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let capture_thread = thread::Builder::new()
            .name("wakeword-mic".to_string())
            .spawn({
                let buffer = buffer.clone();
                let shutdown = shutdown.clone();
                move || capture_loop(sample_rate, frames_per_buffer, buffer, shutdown, ready_tx)
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "Microphone open: {} Hz mono, {} frames per buffer",
                    sample_rate, frames_per_buffer
                );
                Ok(Self {
                    buffer,
                    shutdown,
                    capture_thread: Some(capture_thread),
                })
            }
            Ok(Err(e)) => {
                let _ = capture_thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = capture_thread.join();
                Err(SourceError::Device("capture thread exited during startup".to_string()))
            }
        }
    }

    /// Stop the stream and release the device
    ///
    /// Pending and future reads see the end of the stream.
    pub fn close(&mut self) {
        let Some(thread) = self.capture_thread.take() else {
            return;
        };

        self.shutdown.store(true, Ordering::Release);
        thread.thread().unpark();
        if thread.join().is_err() {
            error!("Microphone capture thread panicked");
        }

        self.buffer.close();
        debug!("Microphone closed");
    }
}

impl AudioSource for MicrophoneSource {
    fn read_chunk(&mut self, n: usize) -> Result<Option<Bytes>, SourceError> {
        let chunk = self.buffer.read(n, None);
        if chunk.is_empty() {
            return Err(SourceError::EndOfStream);
        }
        Ok(Some(chunk))
    }

    fn interrupt_handle(&self) -> Option<Arc<BlockingByteBuffer>> {
        Some(self.buffer.clone())
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_loop(
    sample_rate: u32,
    frames_per_buffer: u32,
    buffer: Arc<BlockingByteBuffer>,
    shutdown: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), SourceError>>,
) {
    let stream = match build_stream(sample_rate, frames_per_buffer, buffer) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(SourceError::Device(format!("Failed to start stream: {}", e))));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    while !shutdown.load(Ordering::Acquire) {
        thread::park_timeout(Duration::from_millis(100));
    }

    drop(stream);
}

fn build_stream(
    sample_rate: u32,
    frames_per_buffer: u32,
    buffer: Arc<BlockingByteBuffer>,
) -> Result<cpal::Stream, SourceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| SourceError::Device("No default input device available".to_string()))?;

    if let Ok(name) = device.name() {
        debug!("Using input device: {}", name);
    }

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Fixed(frames_per_buffer),
    };

    device
        .build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                buffer.write(&samples_to_bytes(data));
            },
            move |err| {
                error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| SourceError::Device(format!("Failed to build input stream: {}", e)))
}
