/// Score calibration
///
/// Maps the network's raw output onto a probability that is stable across
/// models, so one sensitivity setting behaves the same for all of them.

use crate::params::{ListenerParams, ParamsError};
use tracing::debug;

/// Maps a raw network score to a probability in [0, 1]
///
/// Implementations must be pure and monotonic in `raw`.
pub trait Calibrator: Send {
    fn calibrate(&self, raw: f32) -> f32;
}

/// Uses the raw score as the probability
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Calibrator for PassThrough {
    fn calibrate(&self, raw: f32) -> f32 {
        raw
    }
}

/// Calibrates through the cumulative distribution of the model's raw outputs
///
/// The distribution is a mixture of Gaussians over the logit of the raw
/// score, one per `(mu, std)` pair. The cumulative value is then re-centred
/// so that `center` lands on 0.5.
#[derive(Debug, Clone)]
pub struct ThresholdDecoder {
    min_out: f64,
    out_range: f64,
    cumulative: Vec<f64>,
    center: f64,
}

impl ThresholdDecoder {
    pub const RESOLUTION: usize = 200;
    pub const MIN_Z: f64 = -4.0;
    pub const MAX_Z: f64 = 4.0;

    pub fn new(mu_stds: &[(f64, f64)], center: f64) -> Self {
        let min_out = mu_stds
            .iter()
            .map(|&(mu, std)| mu + Self::MIN_Z * std)
            .fold(f64::INFINITY, f64::min)
            .trunc();
        let max_out = mu_stds
            .iter()
            .map(|&(mu, std)| mu + Self::MAX_Z * std)
            .fold(f64::NEG_INFINITY, f64::max)
            .trunc();
        let out_range = max_out - min_out;

        let points = Self::RESOLUTION * out_range.max(0.0) as usize;
        let step = if points > 1 { out_range / (points - 1) as f64 } else { 0.0 };
        let norm = (Self::RESOLUTION * mu_stds.len()) as f64;

        let mut total = 0.0;
        let cumulative = (0..points)
            .map(|i| {
                let x = min_out + i as f64 * step;
                total += mu_stds.iter().map(|&(mu, std)| gaussian_pdf(x, mu, std)).sum::<f64>() / norm;
                total
            })
            .collect();

        debug!("Threshold decoder over [{}, {}] with {} points", min_out, max_out, points);

        Self {
            min_out,
            out_range,
            cumulative,
            center,
        }
    }

    pub fn from_params(params: &ListenerParams) -> Result<Self, ParamsError> {
        params.validate()?;
        Ok(Self::new(&params.threshold_config, params.threshold_center))
    }

    fn cumulative_at(&self, raw: f64) -> f64 {
        if self.out_range == 0.0 || self.cumulative.is_empty() {
            return if raw > self.min_out { 1.0 } else { 0.0 };
        }

        let ratio = ((asigmoid(raw) - self.min_out) / self.out_range).clamp(0.0, 1.0);
        let index = (ratio * (self.cumulative.len() - 1) as f64 + 0.5) as usize;
        self.cumulative[index]
    }
}

impl Calibrator for ThresholdDecoder {
    fn calibrate(&self, raw: f32) -> f32 {
        // Saturated outputs pass through untouched
        if raw <= 0.0 {
            return 0.0;
        }
        if raw >= 1.0 {
            return 1.0;
        }

        let cp = self.cumulative_at(raw as f64);
        let prob = if cp < self.center {
            0.5 * cp / self.center
        } else {
            0.5 + 0.5 * (cp - self.center) / (1.0 - self.center)
        };

        prob.clamp(0.0, 1.0) as f32
    }
}

/// Inverse of the logistic sigmoid
fn asigmoid(x: f64) -> f64 {
    -(1.0 / x - 1.0).ln()
}

fn gaussian_pdf(x: f64, mu: f64, std: f64) -> f64 {
    let z = (x - mu) / std;
    (-0.5 * z * z).exp() / (std * (2.0 * std::f64::consts::PI).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sigmoid(x: f64) -> f32 {
        (1.0 / (1.0 + (-x).exp())) as f32
    }

    fn default_decoder() -> ThresholdDecoder {
        ThresholdDecoder::from_params(&ListenerParams::default()).unwrap()
    }

    #[test]
    fn test_saturated_outputs_pass_through() {
        let decoder = default_decoder();
        assert_eq!(decoder.calibrate(0.0), 0.0);
        assert_eq!(decoder.calibrate(1.0), 1.0);
        assert_eq!(decoder.calibrate(-0.5), 0.0);
    }

    #[test]
    fn test_distribution_mean_maps_above_half() {
        // At the mean the cumulative value is ~0.5, re-centred around 0.2
        let decoder = default_decoder();
        let prob = decoder.calibrate(sigmoid(6.0));
        assert_relative_eq!(prob, 0.6875, epsilon = 0.02);
    }

    #[test]
    fn test_center_maps_to_half() {
        // Phi(-0.8416) ~= 0.2, so mu - 0.8416 * std sits on the center
        let decoder = default_decoder();
        let prob = decoder.calibrate(sigmoid(6.0 - 0.8416 * 4.0));
        assert_relative_eq!(prob, 0.5, epsilon = 0.02);
    }

    #[test]
    fn test_calibration_is_monotonic() {
        let decoder = default_decoder();
        let mut last = 0.0;
        for i in 1..1000 {
            let prob = decoder.calibrate(i as f32 / 1000.0);
            assert!(prob >= last, "not monotonic at {}", i);
            assert!((0.0..=1.0).contains(&prob));
            last = prob;
        }
    }

    #[test]
    fn test_rejects_invalid_params() {
        let params = ListenerParams {
            threshold_config: vec![],
            ..Default::default()
        };
        assert!(ThresholdDecoder::from_params(&params).is_err());
    }

    #[test]
    fn test_pass_through() {
        assert_eq!(PassThrough.calibrate(0.42), 0.42);
    }
}
