/// Sliding feature window
///
/// Keeps the tail of raw audio that has not yet been turned into feature
/// frames, plus a fixed-size matrix of the most recent frames. Every new chunk
/// advances both.

use crate::audio_buffer::bytes_to_audio;
use crate::params::{ListenerParams, ParamsError};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum WindowError {
    #[error("End of audio stream")]
    EndOfStream,

    #[error("Vectorizer produced a frame of width {actual}, expected {expected}")]
    FrameWidth { expected: usize, actual: usize },
}

/// Turns raw audio into feature frames
///
/// Given `samples`, returns one frame per complete window that fits, each of
/// the configured feature width. Must be deterministic: the window relies on
/// re-vectorizing the same tail giving the same frames.
pub trait Vectorizer: Send {
    fn vectorize(&self, samples: &[f32]) -> Vec<Vec<f32>>;
}

/// Row-major matrix of feature frames, oldest row first
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl FeatureMatrix {
    /// Matrix of `rows` zero frames of width `cols`
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Build from rows; returns `None` if the rows differ in width
    pub fn from_rows(rows: &[Vec<f32>]) -> Option<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != cols) {
            return None;
        }

        Some(Self {
            data: rows.concat(),
            rows: rows.len(),
            cols,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Frame at `index` (0 is the oldest)
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact(0) panics, and a zero-width matrix has no data anyway
        self.data.chunks_exact(self.cols.max(1)).take(self.rows)
    }

    /// Flat row-major view
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Drop the oldest `frames.len()` rows and append `frames` at the end
    fn shift_in(&mut self, frames: &[Vec<f32>]) {
        let shift = frames.len();
        debug_assert!(shift <= self.rows);

        self.data.copy_within(shift * self.cols.., 0);

        let start = (self.rows - shift) * self.cols;
        for (i, frame) in frames.iter().enumerate() {
            let offset = start + i * self.cols;
            self.data[offset..offset + self.cols].copy_from_slice(frame);
        }
    }

    fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }
}

/// Append first-order differences to every frame
///
/// Row `i` of the result is `[frame_i, frame_i - frame_{i-1}]`; the first
/// row's delta is zero.
pub fn add_deltas(features: &FeatureMatrix) -> FeatureMatrix {
    let cols = features.cols();
    let mut out = FeatureMatrix::zeros(features.rows(), cols * 2);

    for i in 0..features.rows() {
        let row = features.row(i);
        let offset = i * cols * 2;
        out.data[offset..offset + cols].copy_from_slice(row);

        if i > 0 {
            let prev = features.row(i - 1);
            for (j, (cur, old)) in row.iter().zip(prev).enumerate() {
                out.data[offset + cols + j] = cur - old;
            }
        }
    }

    out
}

/// Rolling raw-audio tail plus the matrix of the latest feature frames
pub struct FeatureWindow {
    vectorizer: Box<dyn Vectorizer>,
    window_samples: usize,
    hop_samples: usize,
    feature_dim: usize,
    tail: Vec<f32>,
    features: FeatureMatrix,
}

impl FeatureWindow {
    /// Create an empty window; fails if `params` are invalid
    pub fn new(params: &ListenerParams, vectorizer: Box<dyn Vectorizer>) -> Result<Self, ParamsError> {
        params.validate()?;

        debug!(
            "Creating feature window: {} frames x {} features, window {} / hop {} samples",
            params.n_frames(),
            params.feature_dim,
            params.window_samples(),
            params.hop_samples()
        );

        Ok(Self {
            vectorizer,
            window_samples: params.window_samples(),
            hop_samples: params.hop_samples(),
            feature_dim: params.feature_dim,
            tail: Vec::with_capacity(params.window_samples() + params.hop_samples()),
            features: FeatureMatrix::zeros(params.n_frames(), params.feature_dim),
        })
    }

    /// Forget all audio and reset every frame to zero
    pub fn reset(&mut self) {
        self.tail.clear();
        self.features.fill_zero();
        debug!("Feature window reset");
    }

    /// Decode a chunk of little-endian 16-bit PCM and ingest it
    ///
    /// An empty chunk means the source is exhausted.
    pub fn ingest_bytes(&mut self, chunk: &[u8]) -> Result<&FeatureMatrix, WindowError> {
        if chunk.is_empty() {
            return Err(WindowError::EndOfStream);
        }

        let samples = bytes_to_audio(chunk);
        self.ingest(&samples)
    }

    /// Append samples and advance the feature matrix by any completed frames
    ///
    /// The returned matrix is borrowed from the window and is only valid
    /// until the next call.
    pub fn ingest(&mut self, samples: &[f32]) -> Result<&FeatureMatrix, WindowError> {
        self.tail.extend_from_slice(samples);

        if self.tail.len() < self.window_samples {
            trace!("Tail at {} of {} samples, no new frames", self.tail.len(), self.window_samples);
            return Ok(&self.features);
        }

        let mut frames = self.vectorizer.vectorize(&self.tail);

        // The samples behind these frames are spent even if the frames are rejected
        let consumed = (frames.len() * self.hop_samples).min(self.tail.len());
        self.tail.drain(..consumed);

        if let Some(bad) = frames.iter().find(|f| f.len() != self.feature_dim) {
            return Err(WindowError::FrameWidth {
                expected: self.feature_dim,
                actual: bad.len(),
            });
        }

        let capacity = self.features.rows();
        if frames.len() > capacity {
            // Older history is fully replaced, nothing to merge
            frames.drain(..frames.len() - capacity);
        }
        self.features.shift_in(&frames);

        trace!("Added {} frames, {} samples left in tail", frames.len(), self.tail.len());
        Ok(&self.features)
    }

    /// Latest feature matrix
    pub fn features(&self) -> &FeatureMatrix {
        &self.features
    }

    /// Samples not yet consumed into a frame
    pub fn pending_samples(&self) -> usize {
        self.tail.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Frames are the mean of each window, repeated across `dim` columns
    /// with a per-column offset so columns are distinguishable.
    pub(crate) struct MeanVectorizer {
        pub window: usize,
        pub hop: usize,
        pub dim: usize,
    }

    impl MeanVectorizer {
        pub(crate) fn for_params(params: &ListenerParams) -> Self {
            Self {
                window: params.window_samples(),
                hop: params.hop_samples(),
                dim: params.feature_dim,
            }
        }
    }

    impl Vectorizer for MeanVectorizer {
        fn vectorize(&self, samples: &[f32]) -> Vec<Vec<f32>> {
            if samples.len() < self.window {
                return Vec::new();
            }
            let count = 1 + (samples.len() - self.window) / self.hop;
            (0..count)
                .map(|i| {
                    let window = &samples[i * self.hop..i * self.hop + self.window];
                    let mean = window.iter().sum::<f32>() / self.window as f32;
                    (0..self.dim).map(|c| mean + c as f32).collect()
                })
                .collect()
        }
    }

    pub(crate) fn small_params() -> ListenerParams {
        // window 10, hop 5, buffer 30 -> 5 frames
        ListenerParams {
            sample_rate: 100,
            window_t: 0.1,
            hop_t: 0.05,
            buffer_t: 0.3,
            feature_dim: 2,
            ..Default::default()
        }
    }

    fn small_window() -> FeatureWindow {
        let params = small_params();
        FeatureWindow::new(&params, Box::new(MeanVectorizer::for_params(&params))).unwrap()
    }

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 / 100.0).collect()
    }

    #[test]
    fn test_new_window_is_zeroed() {
        let window = small_window();
        assert_eq!(window.features().rows(), 5);
        assert_eq!(window.features().cols(), 2);
        assert!(window.features().as_slice().iter().all(|&v| v == 0.0));
        assert_eq!(window.pending_samples(), 0);
    }

    #[test]
    fn test_rejects_invalid_params() {
        let params = ListenerParams {
            buffer_t: 0.05,
            ..small_params()
        };
        assert!(FeatureWindow::new(&params, Box::new(MeanVectorizer::for_params(&params))).is_err());
    }

    #[test]
    fn test_short_input_does_not_vectorize() {
        let mut window = small_window();
        let features = window.ingest(&[1.0; 9]).unwrap().clone();

        assert_eq!(features, FeatureMatrix::zeros(5, 2));
        assert_eq!(window.pending_samples(), 9);
    }

    #[test]
    fn test_single_frame_slides_in() {
        let mut window = small_window();
        let features = window.ingest(&[1.0; 12]).unwrap();

        // One frame (12 < 10 + 5), newest row last
        assert_relative_eq!(features.row(4)[0], 1.0);
        assert_relative_eq!(features.row(4)[1], 2.0);
        assert_eq!(features.row(3), &[0.0, 0.0]);
        // 12 - 1 * hop
        assert_eq!(window.pending_samples(), 7);
    }

    #[test]
    fn test_tail_stays_bounded() {
        let params = small_params();
        let mut window = small_window();

        for chunk in ramp(1000).chunks(3) {
            window.ingest(chunk).unwrap();
            assert!(window.pending_samples() < params.window_samples() + params.hop_samples());
        }
    }

    #[test]
    fn test_overflow_keeps_only_newest_frames() {
        let mut window = small_window();

        // 20 samples -> 3 frames, 5 samples left over
        window.ingest(&[5.0; 20]).unwrap();
        assert_eq!(window.pending_samples(), 5);

        // 105 samples in the tail -> 20 frames, far more than the 5-row capacity
        let audio = ramp(100);
        let features = window.ingest(&audio).unwrap().clone();

        let mut tail = vec![5.0; 5];
        tail.extend_from_slice(&audio);
        let all_frames = MeanVectorizer::for_params(&small_params()).vectorize(&tail);
        assert_eq!(all_frames.len(), 20);

        for (i, frame) in all_frames[15..].iter().enumerate() {
            assert_eq!(features.row(i), frame.as_slice());
        }

        // Nothing from the first pass survives
        assert!(features.iter_rows().all(|row| row[0] != 5.0));
    }

    #[test]
    fn test_matrix_size_is_invariant() {
        let mut window = small_window();

        for len in [0, 1, 4, 9, 10, 11, 15, 60, 3, 200, 7] {
            let features = window.ingest(&ramp(len)).unwrap();
            assert_eq!(features.rows(), 5);
            assert_eq!(features.cols(), 2);
            assert_eq!(features.as_slice().len(), 10);
        }
    }

    #[test]
    fn test_chunking_invariance() {
        let audio = ramp(347);

        let mut whole = small_window();
        let expected = whole.ingest(&audio).unwrap().clone();

        for chunk_size in [1, 2, 3, 7, 10, 64] {
            let mut chunked = small_window();
            for chunk in audio.chunks(chunk_size) {
                chunked.ingest(chunk).unwrap();
            }
            assert_eq!(chunked.features(), &expected, "chunk size {}", chunk_size);
            assert_eq!(chunked.pending_samples(), whole.pending_samples());
        }
    }

    #[test]
    fn test_reset_clears_state() {
        let mut window = small_window();
        window.ingest(&ramp(53)).unwrap();
        assert!(window.features().as_slice().iter().any(|&v| v != 0.0));

        window.reset();
        assert_eq!(window.features(), &FeatureMatrix::zeros(5, 2));
        assert_eq!(window.pending_samples(), 0);
    }

    #[test]
    fn test_empty_chunk_is_end_of_stream() {
        let mut window = small_window();
        assert!(matches!(window.ingest_bytes(&[]), Err(WindowError::EndOfStream)));
    }

    #[test]
    fn test_ingest_bytes_decodes_pcm() {
        let mut window = small_window();
        let bytes = crate::audio_buffer::samples_to_bytes(&[16384; 10]);

        let features = window.ingest_bytes(&bytes).unwrap();
        assert_relative_eq!(features.row(4)[0], 0.5);
    }

    #[test]
    fn test_wrong_frame_width_is_rejected() {
        struct Wide;
        impl Vectorizer for Wide {
            fn vectorize(&self, _samples: &[f32]) -> Vec<Vec<f32>> {
                vec![vec![0.0; 3]]
            }
        }

        let mut window = FeatureWindow::new(&small_params(), Box::new(Wide)).unwrap();
        match window.ingest(&[0.3; 10]) {
            Err(WindowError::FrameWidth { expected, actual }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected FrameWidth error, got {:?}", other.map(|_| ())),
        }

        // Matrix untouched, the hop covered by the rejected frame is dropped
        assert_eq!(window.features(), &FeatureMatrix::zeros(5, 2));
        assert_eq!(window.pending_samples(), 5);
    }

    #[test]
    fn test_rejected_frames_do_not_grow_tail() {
        struct Wide;
        impl Vectorizer for Wide {
            fn vectorize(&self, samples: &[f32]) -> Vec<Vec<f32>> {
                // One frame per hop, all of the wrong width
                vec![vec![0.0; 3]; (samples.len() - 10) / 5 + 1]
            }
        }

        let mut window = FeatureWindow::new(&small_params(), Box::new(Wide)).unwrap();
        for _ in 0..50 {
            assert!(window.ingest(&[0.1; 10]).is_err());
            assert!(window.pending_samples() < 10, "tail grew to {}", window.pending_samples());
        }
        assert_eq!(window.features(), &FeatureMatrix::zeros(5, 2));
    }

    #[test]
    fn test_add_deltas() {
        let matrix = FeatureMatrix::from_rows(&[vec![1.0, 2.0], vec![4.0, 3.0], vec![4.0, 7.0]]).unwrap();
        let with_deltas = add_deltas(&matrix);

        assert_eq!(with_deltas.rows(), 3);
        assert_eq!(with_deltas.cols(), 4);
        assert_eq!(with_deltas.row(0), &[1.0, 2.0, 0.0, 0.0]);
        assert_eq!(with_deltas.row(1), &[4.0, 3.0, 3.0, 1.0]);
        assert_eq!(with_deltas.row(2), &[4.0, 7.0, 0.0, 4.0]);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        assert!(FeatureMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_none());
    }
}
