use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::backtest::{BacktestReport, WindowOutcome, WindowResult};
use crate::model::calibration::CalibrationBin;
use crate::model::stabilizer::StabilizedBucket;

/// One (level, key) of the stabilized model table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilizedModelRow {
    /// 1 (finest) ..= 5 (innings only)
    pub level: i64,
    /// e.g. "inn=2|over=16+|phase=death|wkts=3-5|rr=high"
    pub bucket_key: String,
    pub innings: i64,
    pub over_bucket: Option<String>,
    pub over_phase: Option<String>,
    pub wickets_bucket: Option<String>,
    pub run_rate_bucket: Option<String>,
    pub elo_diff_bucket: Option<String>,
    pub count: i64,
    pub wins: i64,
    pub win_rate: f64,
    pub standard_error: f64,
    pub ci_lower_95: f64,
    pub ci_upper_95: f64,
    /// "unstable" | "moderate" | "stable"
    pub stability: String,
    pub stabilized_probability: f64,
    /// "1".."5" or "global"
    pub resolved_level: String,
}

impl From<&StabilizedBucket> for StabilizedModelRow {
    fn from(b: &StabilizedBucket) -> Self {
        let owned = |s: Option<&'static str>| s.map(str::to_string);
        StabilizedModelRow {
            level: b.key.level.number() as i64,
            bucket_key: b.key.to_string(),
            innings: b.key.innings as i64,
            over_bucket: owned(b.key.over),
            over_phase: owned(b.key.phase),
            wickets_bucket: owned(b.key.wickets),
            run_rate_bucket: owned(b.key.run_rate),
            elo_diff_bucket: owned(b.key.elo),
            count: b.count as i64,
            wins: b.wins as i64,
            win_rate: b.win_rate,
            standard_error: b.standard_error,
            ci_lower_95: b.ci_lower_95,
            ci_upper_95: b.ci_upper_95,
            stability: b.stability.as_str().to_string(),
            stabilized_probability: b.stabilized_probability,
            resolved_level: b.resolved_at.to_string(),
        }
    }
}

/// One invocation of the backtest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRun {
    pub id: Option<i64>,
    pub train_years: i64,
    pub test_years: i64,
    pub min_samples: i64,
    pub rows_used: i64,
    pub rows_rejected: i64,
    pub windows_total: i64,
    pub windows_scored: i64,
    pub windows_failed: i64,
    pub windows_empty: i64,
    pub mean_brier: Option<f64>,
    pub mean_accuracy: Option<f64>,
    pub total_predictions: i64,
    pub pooled_max_abs_error: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl BacktestRun {
    pub fn from_report(report: &BacktestReport, rows_used: usize, rows_rejected: usize) -> Self {
        BacktestRun {
            id: None,
            train_years: report.config.train_years as i64,
            test_years: report.config.test_years as i64,
            min_samples: report.config.min_samples as i64,
            rows_used: rows_used as i64,
            rows_rejected: rows_rejected as i64,
            windows_total: report.windows.len() as i64,
            windows_scored: report.windows_scored as i64,
            windows_failed: report.windows_failed as i64,
            windows_empty: report.windows_empty as i64,
            mean_brier: report.mean_brier,
            mean_accuracy: report.mean_accuracy,
            total_predictions: report.total_predictions as i64,
            pooled_max_abs_error: report.pooled_calibration.max_abs_error,
            created_at: Utc::now(),
        }
    }
}

/// A row of the backtest results table. The final row of a run has
/// `status = "aggregate"` and no window bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestWindowRow {
    pub run_id: i64,
    pub window_index: Option<i64>,
    pub train_start: Option<NaiveDate>,
    pub train_end: Option<NaiveDate>,
    pub test_start: Option<NaiveDate>,
    pub test_end: Option<NaiveDate>,
    /// "scored" | "empty" | "failed" | "aggregate"
    pub status: String,
    pub failure_reason: Option<String>,
    pub train_rows: Option<i64>,
    pub n_test_predictions: i64,
    pub test_matches: Option<i64>,
    pub brier_score: Option<f64>,
    pub log_loss: Option<f64>,
    pub accuracy: Option<f64>,
    pub avg_predicted_prob: Option<f64>,
}

impl BacktestWindowRow {
    pub fn from_window(run_id: i64, w: &WindowResult) -> Self {
        let mut row = BacktestWindowRow {
            run_id,
            window_index: Some(w.window.index as i64),
            train_start: Some(w.window.train_start),
            train_end: Some(w.window.train_end),
            test_start: Some(w.window.test_start),
            test_end: Some(w.window.test_end),
            status: String::new(),
            failure_reason: None,
            train_rows: Some(w.train_rows as i64),
            n_test_predictions: 0,
            test_matches: None,
            brier_score: None,
            log_loss: None,
            accuracy: None,
            avg_predicted_prob: None,
        };
        match &w.outcome {
            WindowOutcome::Scored(m) => {
                row.status = "scored".into();
                row.n_test_predictions = m.n_test_predictions as i64;
                row.test_matches = Some(m.test_matches as i64);
                row.brier_score = Some(m.brier_score);
                row.log_loss = Some(m.log_loss);
                row.accuracy = Some(m.accuracy);
                row.avg_predicted_prob = Some(m.avg_predicted_prob);
            }
            WindowOutcome::Empty => row.status = "empty".into(),
            WindowOutcome::Failed { reason } => {
                row.status = "failed".into();
                row.failure_reason = Some(reason.clone());
            }
        }
        row
    }

    pub fn aggregate(run_id: i64, report: &BacktestReport) -> Self {
        BacktestWindowRow {
            run_id,
            window_index: None,
            train_start: None,
            train_end: None,
            test_start: None,
            test_end: None,
            status: "aggregate".into(),
            failure_reason: None,
            train_rows: None,
            n_test_predictions: report.total_predictions as i64,
            test_matches: None,
            brier_score: report.mean_brier,
            log_loss: None,
            accuracy: report.mean_accuracy,
            avg_predicted_prob: None,
        }
    }
}

/// One decile of the pooled calibration report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBinRow {
    pub run_id: i64,
    pub bin_index: i64,
    pub lower: f64,
    pub upper: f64,
    pub count: i64,
    pub mean_predicted: Option<f64>,
    pub empirical_frequency: Option<f64>,
}

impl CalibrationBinRow {
    pub fn from_bin(run_id: i64, bin: &CalibrationBin) -> Self {
        CalibrationBinRow {
            run_id,
            bin_index: bin.index as i64,
            lower: bin.lower,
            upper: bin.upper,
            count: bin.count as i64,
            mean_predicted: bin.mean_predicted,
            empirical_frequency: bin.empirical_frequency,
        }
    }
}
