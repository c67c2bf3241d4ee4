/// Audio buffer module for handing raw PCM bytes between threads
///
/// A writer appends bytes at any pace while a reader blocks until a full
/// chunk is available. An optional chop length bounds memory when the writer
/// outruns the reader: stale bytes are dropped from the front on read.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

#[derive(Debug, Default)]
struct BufferState {
    data: BytesMut,
    closed: bool,
    interrupted: bool,
}

/// Thread-safe append-only byte buffer with blocking reads
///
/// One writer and one reader is the expected pattern, but every method is
/// safe to call from any thread without external locking.
#[derive(Debug, Default)]
pub struct BlockingByteBuffer {
    state: Mutex<BufferState>,
    written: Condvar,
    chop_len: Option<usize>,
}

impl BlockingByteBuffer {
    /// Create an unbounded buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer that trims itself on read once it exceeds `chop_len` bytes
    ///
    /// The trim keeps only the last `len % chop_len` bytes, so a reader that
    /// fell behind resumes on fresh data. A `chop_len` of 0 disables trimming.
    pub fn with_chop(chop_len: usize) -> Self {
        debug!("Creating blocking byte buffer with chop length: {} bytes", chop_len);

        Self {
            chop_len: (chop_len > 0).then_some(chop_len),
            ..Self::default()
        }
    }

    /// Create a buffer pre-filled with `initial` bytes
    pub fn from_bytes(initial: &[u8]) -> Self {
        let buffer = Self::new();
        buffer.state.lock().data.extend_from_slice(initial);
        buffer
    }

    /// Append bytes and wake any blocked reader (never blocks)
    pub fn write(&self, bytes: &[u8]) {
        let mut state = self.state.lock();

        if state.closed {
            warn!("Dropping {} bytes written to a closed buffer", bytes.len());
            return;
        }

        state.data.extend_from_slice(bytes);
        trace!("Wrote {} bytes, buffer holds {}", bytes.len(), state.data.len());
        drop(state);

        self.written.notify_all();
    }

    /// Remove and return the first `n` bytes
    ///
    /// Blocks until `n` bytes are buffered or `timeout` elapses. `None` waits
    /// forever and `Some(Duration::ZERO)` never waits. A timeout returns an
    /// empty result, which means "no data yet" and is not an error. Once the
    /// buffer is closed the read returns whatever is left, possibly fewer
    /// than `n` bytes.
    ///
    /// While the buffer is interrupted every read returns empty at once and
    /// leaves the buffered bytes in place.
    pub fn read(&self, n: usize, timeout: Option<Duration>) -> Bytes {
        let mut state = self.state.lock();
        if state.interrupted {
            return Bytes::new();
        }
        self.chop(&mut state);

        let deadline = timeout.map(|t| Instant::now() + t);

        while state.data.len() < n && !state.closed && !state.interrupted {
            match deadline {
                None => self.written.wait(&mut state),
                Some(deadline) => {
                    if self.written.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }

        if state.interrupted {
            trace!("Read of {} bytes interrupted", n);
            return Bytes::new();
        }

        if state.data.len() >= n {
            return state.data.split_to(n).freeze();
        }

        if state.closed {
            let remaining = state.data.len();
            return state.data.split_to(remaining).freeze();
        }

        trace!("Read of {} bytes timed out with {} buffered", n, state.data.len());
        Bytes::new()
    }

    /// Remove and return everything currently buffered without waiting
    pub fn read_available(&self) -> Bytes {
        let mut state = self.state.lock();
        let len = state.data.len();
        state.data.split_to(len).freeze()
    }

    /// Mark the end of the stream and wake all readers
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.written.notify_all();
        debug!("Closed blocking byte buffer");
    }

    /// Wake all blocked readers without writing any bytes
    ///
    /// Reads keep returning empty until `resume` is called.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.written.notify_all();
        debug!("Interrupted blocking byte buffer readers");
    }

    /// Let reads block again after `interrupt`
    pub fn resume(&self) {
        self.state.lock().interrupted = false;
    }

    /// Whether the buffer is currently interrupted
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chop length in bytes, if configured
    pub fn chop_len(&self) -> Option<usize> {
        self.chop_len
    }

    fn chop(&self, state: &mut BufferState) {
        let Some(chop_len) = self.chop_len else {
            return;
        };

        let len = state.data.len();
        if len > chop_len {
            let keep = len % chop_len;
            state.data.advance(len - keep);
            debug!("Chopped {} stale bytes, kept {}", len - keep, keep);
        }
    }
}

/// Decode little-endian signed 16-bit mono PCM into samples in [-1, 1)
///
/// A trailing odd byte is ignored.
pub fn bytes_to_audio(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| AudioSample::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode samples as little-endian signed 16-bit PCM
pub fn samples_to_bytes(samples: &[AudioSample]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_after_write_returns_prefix() {
        let buffer = BlockingByteBuffer::new();
        buffer.write(&[1, 2, 3, 4, 5, 6]);

        let chunk = buffer.read(4, Some(Duration::ZERO));
        assert_eq!(&chunk[..], &[1, 2, 3, 4]);
        assert_eq!(buffer.len(), 2);

        let rest = buffer.read(2, None);
        assert_eq!(&rest[..], &[5, 6]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_read_does_not_block_when_data_is_ready() {
        let buffer = BlockingByteBuffer::new();
        buffer.write(&[0; 4096]);

        let start = Instant::now();
        let chunk = buffer.read(2048, None);
        assert_eq!(chunk.len(), 2048);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_read_times_out_with_empty_result() {
        let buffer = BlockingByteBuffer::new();
        buffer.write(&[1, 2, 3]);

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let chunk = buffer.read(10, Some(timeout));
        let elapsed = start.elapsed();

        assert!(chunk.is_empty());
        assert!(elapsed >= timeout, "returned early after {:?}", elapsed);
        assert!(elapsed < timeout + Duration::from_millis(250), "returned late after {:?}", elapsed);
        // Nothing was consumed
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_zero_timeout_is_immediate() {
        let buffer = BlockingByteBuffer::new();

        let start = Instant::now();
        assert!(buffer.read(1, Some(Duration::ZERO)).is_empty());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_blocked_reader_wakes_on_write() {
        let buffer = Arc::new(BlockingByteBuffer::new());
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.read(6, None))
        };

        thread::sleep(Duration::from_millis(20));
        buffer.write(&[1, 2, 3]);
        thread::sleep(Duration::from_millis(20));
        buffer.write(&[4, 5, 6, 7]);

        let chunk = reader.join().unwrap();
        assert_eq!(&chunk[..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_read_available_returns_everything() {
        let buffer = BlockingByteBuffer::new();
        assert!(buffer.read_available().is_empty());

        buffer.write(&[9; 10]);
        assert_eq!(buffer.read_available().len(), 10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chop_drops_stale_bytes_intentionally() {
        // Writer outpaced the reader: 10 bytes buffered with a chop length of 4
        let buffer = BlockingByteBuffer::with_chop(4);
        buffer.write(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

        // 10 % 4 == 2, so only the two newest bytes survive
        let chunk = buffer.read(2, Some(Duration::ZERO));
        assert_eq!(&chunk[..], &[8, 9]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chop_can_leave_buffer_empty() {
        let buffer = BlockingByteBuffer::with_chop(4);
        buffer.write(&[1; 8]);

        assert!(buffer.read(1, Some(Duration::ZERO)).is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chop_ignored_below_threshold() {
        let buffer = BlockingByteBuffer::with_chop(8);
        buffer.write(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let chunk = buffer.read(3, Some(Duration::ZERO));
        assert_eq!(&chunk[..], &[1, 2, 3]);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_close_releases_blocked_reader_with_remainder() {
        let buffer = Arc::new(BlockingByteBuffer::from_bytes(&[1, 2]));
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.read(100, None))
        };

        thread::sleep(Duration::from_millis(20));
        buffer.close();

        let chunk = reader.join().unwrap();
        assert_eq!(&chunk[..], &[1, 2]);
        assert!(buffer.is_closed());
        assert!(buffer.read(1, None).is_empty());
    }

    #[test]
    fn test_interrupt_releases_blocked_reader_without_bytes() {
        let buffer = Arc::new(BlockingByteBuffer::from_bytes(&[1, 2]));
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.read(100, None))
        };

        thread::sleep(Duration::from_millis(20));
        buffer.interrupt();

        // Nothing written, nothing consumed
        assert!(reader.join().unwrap().is_empty());
        assert_eq!(buffer.len(), 2);

        // Stays interrupted even when a full chunk is buffered
        buffer.write(&[3, 4]);
        assert!(buffer.read(4, None).is_empty());
        assert_eq!(buffer.len(), 4);

        buffer.resume();
        assert!(!buffer.is_interrupted());
        assert_eq!(&buffer.read(4, None)[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_write_after_close_is_dropped() {
        let buffer = BlockingByteBuffer::new();
        buffer.close();
        buffer.write(&[1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pcm_decoding() {
        let bytes = samples_to_bytes(&[0, 16384, -32768, 32767]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[2..4], &[0x00, 0x40]);

        let audio = bytes_to_audio(&bytes);
        assert_eq!(audio.len(), 4);
        assert_relative_eq!(audio[0], 0.0);
        assert_relative_eq!(audio[1], 0.5);
        assert_relative_eq!(audio[2], -1.0);
        assert_relative_eq!(audio[3], 32767.0 / 32768.0);
    }

    #[test]
    fn test_pcm_decoding_ignores_odd_byte() {
        assert_eq!(bytes_to_audio(&[0, 0, 7]).len(), 1);
    }
}
