/// Activation detector
///
/// Debounces the per-chunk probability stream into discrete activations.
/// Prevents several close activations when predictions look like
/// `...!!!..!!...`: a run of high chunks fires once, then a cooldown
/// suppresses re-triggering for a fixed wall-clock span.

use tracing::{debug, trace};

/// Chunk size, in bytes, the cooldown length is calibrated against
pub const REFERENCE_CHUNK_SIZE: usize = 2048;

/// Cooldown length in chunks of `REFERENCE_CHUNK_SIZE` bytes
pub const REFERENCE_COOLDOWN_CHUNKS: usize = 8;

/// Hysteresis state machine over calibrated probabilities
///
/// `activation` counts consecutive high chunks while positive and counts
/// back up to zero from the cooldown value while negative.
#[derive(Debug, Clone)]
pub struct ActivationDetector {
    chunk_size: usize,
    sensitivity: f32,
    trigger_level: u32,
    cooldown: i32,
    activation: i32,
}

impl ActivationDetector {
    /// `chunk_size` is in bytes and only sizes the cooldown
    pub fn new(chunk_size: usize, sensitivity: f32, trigger_level: u32) -> Self {
        let cooldown = cooldown_for(chunk_size);

        debug!(
            "Activation detector: sensitivity={}, trigger_level={}, cooldown={} chunks",
            sensitivity, trigger_level, -cooldown
        );

        Self {
            chunk_size,
            sensitivity,
            trigger_level,
            cooldown,
            activation: 0,
        }
    }

    /// Feed one probability; returns true if it caused an activation
    pub fn update(&mut self, prob: f32) -> bool {
        let chunk_activated = prob > 1.0 - self.sensitivity;

        if chunk_activated || self.activation < 0 {
            self.activation += 1;
            let has_activated = i64::from(self.activation) > i64::from(self.trigger_level);

            if has_activated || (chunk_activated && self.activation < 0) {
                self.activation = self.cooldown;
            }

            if has_activated {
                debug!("Activation fired, cooling down for {} chunks", -self.cooldown);
                return true;
            }
        } else if self.activation > 0 {
            self.activation -= 1;
        }

        trace!("prob={:.3} activation={}", prob, self.activation);
        false
    }

    /// Return to the idle state
    pub fn reset(&mut self) {
        self.activation = 0;
    }

    /// Current counter value
    pub fn activation(&self) -> i32 {
        self.activation
    }

    pub fn is_cooling_down(&self) -> bool {
        self.activation < 0
    }

    /// Counter value entered after an activation
    pub fn cooldown(&self) -> i32 {
        self.cooldown
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    pub fn trigger_level(&self) -> u32 {
        self.trigger_level
    }
}

/// Negative counter value covering the reference cooldown span
///
/// Uses floor division, so chunk sizes that do not divide the reference
/// evenly round towards a longer cooldown.
fn cooldown_for(chunk_size: usize) -> i32 {
    let reference = (REFERENCE_COOLDOWN_CHUNKS * REFERENCE_CHUNK_SIZE) as i64;
    (-reference).div_euclid(chunk_size.max(1) as i64) as i32
}
