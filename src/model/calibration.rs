//! Reliability (decile) calibration and probabilistic scoring.
//!
//! Predictions must already be valid probabilities. Anything outside [0, 1]
//! is reported as an error rather than clipped.

use serde::Serialize;

use super::error::ModelError;

pub const BIN_COUNT: usize = 10;

/// Thresholds for the high-confidence sharpness bands.
pub const SHARPNESS_THRESHOLDS: [f64; 3] = [0.7, 0.8, 0.9];

/// Bounds probabilities away from 0/1 inside the log only.
const LOG_LOSS_EPS: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationBin {
    pub index: usize,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_predicted: Option<f64>,
    pub empirical_frequency: Option<f64>,
}

impl CalibrationBin {
    pub fn abs_error(&self) -> Option<f64> {
        Some((self.mean_predicted? - self.empirical_frequency?).abs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharpnessBand {
    pub threshold: f64,
    pub count: usize,
    /// Fraction of all predictions at or above the threshold.
    pub share: f64,
    pub win_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub bins: Vec<CalibrationBin>,
    /// Largest |mean predicted − empirical frequency| over non-empty bins.
    pub max_abs_error: Option<f64>,
    pub brier_score: Option<f64>,
    pub log_loss: Option<f64>,
    pub n_predictions: usize,
    pub sharpness: Vec<SharpnessBand>,
}

/// Decile for a probability; 1.0 lands in the last bin.
pub fn bin_index(p: f64) -> usize {
    ((p * BIN_COUNT as f64) as usize).min(BIN_COUNT - 1)
}

pub fn check_probability(p: f64) -> Result<f64, ModelError> {
    if p.is_finite() && (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(ModelError::InvalidProbability(p))
    }
}

pub fn squared_error(p: f64, won: bool) -> f64 {
    let y = if won { 1.0 } else { 0.0 };
    (p - y).powi(2)
}

pub fn log_loss_term(p: f64, won: bool) -> f64 {
    let p = p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
    if won {
        -p.ln()
    } else {
        -(1.0 - p).ln()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BinAccumulator {
    count: usize,
    wins: usize,
    sum_predicted: f64,
}

pub fn calibrate(predictions: &[(f64, bool)]) -> Result<CalibrationReport, ModelError> {
    let mut acc = [BinAccumulator::default(); BIN_COUNT];
    let mut brier_sum = 0.0;
    let mut log_loss_sum = 0.0;

    for &(p, won) in predictions {
        let p = check_probability(p)?;
        let bin = &mut acc[bin_index(p)];
        bin.count += 1;
        bin.sum_predicted += p;
        if won {
            bin.wins += 1;
        }
        brier_sum += squared_error(p, won);
        log_loss_sum += log_loss_term(p, won);
    }

    let bins: Vec<CalibrationBin> = acc
        .iter()
        .enumerate()
        .map(|(index, a)| {
            let n = a.count as f64;
            CalibrationBin {
                index,
                lower: index as f64 / BIN_COUNT as f64,
                upper: (index + 1) as f64 / BIN_COUNT as f64,
                count: a.count,
                mean_predicted: (a.count > 0).then(|| a.sum_predicted / n),
                empirical_frequency: (a.count > 0).then(|| a.wins as f64 / n),
            }
        })
        .collect();

    let max_abs_error = bins
        .iter()
        .filter_map(CalibrationBin::abs_error)
        .fold(None, |m: Option<f64>, e| Some(m.map_or(e, |m| m.max(e))));

    let n = predictions.len();
    let mean = |sum: f64| (n > 0).then(|| sum / n as f64);

    Ok(CalibrationReport {
        bins,
        max_abs_error,
        brier_score: mean(brier_sum),
        log_loss: mean(log_loss_sum),
        n_predictions: n,
        sharpness: sharpness(predictions),
    })
}

fn sharpness(predictions: &[(f64, bool)]) -> Vec<SharpnessBand> {
    SHARPNESS_THRESHOLDS
        .iter()
        .map(|&threshold| {
            let (count, wins) = predictions
                .iter()
                .filter(|(p, _)| *p >= threshold)
                .fold((0usize, 0usize), |(c, w), (_, won)| (c + 1, w + *won as usize));
            SharpnessBand {
                threshold,
                count,
                share: if predictions.is_empty() {
                    0.0
                } else {
                    count as f64 / predictions.len() as f64
                },
                win_rate: (count > 0).then(|| wins as f64 / count as f64),
            }
        })
        .collect()
}
