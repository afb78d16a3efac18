use ndarray::{ArrayView2, Zip};
use serde::{Deserialize, Serialize};

use crate::types::{CoaddError, CoaddResult, ImagePixel, MaskPixel};

/// Gaussian sigma per unit interquartile range
const IQR_TO_SIGMA: f64 = 0.741;

/// Parameters of a sigma-clipped statistic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsControl {
    /// Clip at this many standard deviations
    pub num_sigma_clip: f64,
    /// Number of clipping iterations
    pub num_iter: usize,
    /// Pixels whose mask intersects this are ignored
    pub and_mask: MaskPixel,
}

impl Default for StatisticsControl {
    fn default() -> Self {
        Self {
            num_sigma_clip: 3.0,
            num_iter: 2,
            and_mask: 0,
        }
    }
}

impl StatisticsControl {
    /// Default clipping that ignores the given mask bits
    pub fn with_and_mask(and_mask: MaskPixel) -> Self {
        Self {
            and_mask,
            ..Self::default()
        }
    }
}

/// Result of a sigma-clipped statistic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub mean: f64,
    pub stdev: f64,
    /// Number of pixels in the final clipped sample
    pub num_used: usize,
}

/// Sigma-clipped mean of `values`, skipping non-finite and masked pixels
///
/// Starts from the median, with a robust width estimate of 0.741 × the
/// interquartile range. Each iteration keeps the values within
/// `num_sigma_clip` widths of the current centre and recomputes the mean and
/// standard deviation from them.
pub fn clipped_mean(
    values: ArrayView2<'_, ImagePixel>,
    mask: Option<ArrayView2<'_, MaskPixel>>,
    control: &StatisticsControl,
) -> CoaddResult<ClippedStats> {
    let mut sample: Vec<f64> = Vec::with_capacity(values.len());
    match mask {
        Some(mask) => {
            if mask.dim() != values.dim() {
                return Err(CoaddError::InvalidParameter(format!(
                    "value and mask dimensions differ: {:?} != {:?}",
                    values.dim(),
                    mask.dim()
                )));
            }
            Zip::from(values).and(mask).for_each(|&v, &m| {
                if v.is_finite() && m & control.and_mask == 0 {
                    sample.push(v as f64);
                }
            });
        }
        None => sample.extend(values.iter().filter(|v| v.is_finite()).map(|&v| v as f64)),
    }

    if sample.is_empty() {
        return Err(CoaddError::DegenerateStatistic(
            "no unmasked finite pixels".to_string(),
        ));
    }

    sample.sort_by(|a, b| a.total_cmp(b));
    let mut center = quantile(&sample, 0.5);
    let mut sigma = IQR_TO_SIGMA * (quantile(&sample, 0.75) - quantile(&sample, 0.25));
    let (mut mean, mut stdev) = mean_stdev(&sample);
    let mut num_used = sample.len();

    for iteration in 0..control.num_iter {
        let limit = control.num_sigma_clip * sigma;
        let kept: Vec<f64> = sample
            .iter()
            .copied()
            .filter(|&v| (v - center).abs() <= limit)
            .collect();
        if kept.is_empty() {
            log::debug!("Clipping iteration {} rejected every pixel; stopping", iteration);
            break;
        }
        let (kept_mean, kept_stdev) = mean_stdev(&kept);
        mean = kept_mean;
        stdev = kept_stdev;
        num_used = kept.len();
        center = mean;
        sigma = stdev;
    }

    if !mean.is_finite() {
        return Err(CoaddError::DegenerateStatistic(format!(
            "clipped mean is not finite ({})",
            mean
        )));
    }
    Ok(ClippedStats { mean, stdev, num_used })
}

/// Linear-interpolated quantile of a sorted, non-empty sample
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn mean_stdev(sample: &[f64]) -> (f64, f64) {
    let n = sample.len() as f64;
    let mean = sample.iter().sum::<f64>() / n;
    if sample.len() < 2 {
        return (mean, 0.0);
    }
    let var = sample.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}
