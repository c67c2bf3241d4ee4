/// Audio sources feeding the pipeline runner
///
/// A source hands out fixed-size chunks of little-endian 16-bit mono PCM.

use crate::audio_buffer::{samples_to_bytes, AudioSample, BlockingByteBuffer};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("End of audio stream")]
    EndOfStream,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio device error: {0}")]
    Device(String),
}

/// Blocking supplier of raw PCM chunks
pub trait AudioSource: Send {
    /// Read a chunk of `n` bytes
    ///
    /// Returns `Ok(None)` when no data arrived in time (the caller retries)
    /// and `Err(SourceError::EndOfStream)` once the source is exhausted. A
    /// chunk shorter than `n` only happens right before the end of stream.
    fn read_chunk(&mut self, n: usize) -> Result<Option<Bytes>, SourceError>;

    /// Buffer backing this source, if any
    ///
    /// Shutdown interrupts it to wake a reader blocked in `read_chunk`.
    fn interrupt_handle(&self) -> Option<Arc<BlockingByteBuffer>> {
        None
    }
}

/// Source reading from a shared `BlockingByteBuffer`
///
/// Another thread writes audio into the buffer at its own pace.
#[derive(Debug, Clone)]
pub struct BufferSource {
    buffer: Arc<BlockingByteBuffer>,
    timeout: Option<Duration>,
}

impl BufferSource {
    /// Reads block until a full chunk is buffered
    pub fn new(buffer: Arc<BlockingByteBuffer>) -> Self {
        Self { buffer, timeout: None }
    }

    /// Reads give up after `timeout` and report "no data"
    pub fn with_timeout(buffer: Arc<BlockingByteBuffer>, timeout: Duration) -> Self {
        Self {
            buffer,
            timeout: Some(timeout),
        }
    }

    pub fn buffer(&self) -> &Arc<BlockingByteBuffer> {
        &self.buffer
    }
}

impl AudioSource for BufferSource {
    fn read_chunk(&mut self, n: usize) -> Result<Option<Bytes>, SourceError> {
        let chunk = self.buffer.read(n, self.timeout);

        if chunk.is_empty() {
            if self.buffer.is_closed() {
                return Err(SourceError::EndOfStream);
            }
            return Ok(None);
        }

        Ok(Some(chunk))
    }

    fn interrupt_handle(&self) -> Option<Arc<BlockingByteBuffer>> {
        Some(self.buffer.clone())
    }
}

/// Source over any byte reader (file, pipe, socket, in-memory cursor)
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send> AudioSource for ReaderSource<R> {
    fn read_chunk(&mut self, n: usize) -> Result<Option<Bytes>, SourceError> {
        let mut chunk = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            match self.reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if filled == 0 {
            return Err(SourceError::EndOfStream);
        }

        chunk.truncate(filled);
        Ok(Some(Bytes::from(chunk)))
    }
}

/// Source reading 16-bit mono samples from a WAV file
pub struct WavSource {
    reader: hound::WavReader<BufReader<File>>,
}

impl WavSource {
    /// Open a WAV file; it must be mono, 16-bit integer PCM at `sample_rate`
    pub fn open(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, SourceError> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();

        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(SourceError::UnsupportedFormat(format!(
                "expected mono 16-bit PCM, got {} channel(s) of {}-bit {:?}",
                spec.channels, spec.bits_per_sample, spec.sample_format
            )));
        }

        if spec.sample_rate != sample_rate {
            return Err(SourceError::UnsupportedFormat(format!(
                "expected {} Hz, got {} Hz",
                sample_rate, spec.sample_rate
            )));
        }

        info!(
            "Opened WAV source {} ({} samples)",
            path.as_ref().display(),
            reader.len()
        );

        Ok(Self { reader })
    }

    /// Total samples in the file
    pub fn total_samples(&self) -> u32 {
        self.reader.len()
    }
}

impl AudioSource for WavSource {
    fn read_chunk(&mut self, n: usize) -> Result<Option<Bytes>, SourceError> {
        let samples = self
            .reader
            .samples::<AudioSample>()
            .take(n / 2)
            .collect::<Result<Vec<_>, _>>()?;

        if samples.is_empty() {
            debug!("WAV source exhausted");
            return Err(SourceError::EndOfStream);
        }

        Ok(Some(Bytes::from(samples_to_bytes(&samples))))
    }
}
