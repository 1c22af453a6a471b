//! Walk-forward backtest.
//!
//! Windows are aligned to calendar years. Window `k` trains on
//! `[Y0 + k·test, Y0 + k·test + train)` and tests on the `test` years right
//! after it, so a model never sees a match dated on or after the first match
//! it is scored on. Each window builds its own [`BucketStore`] from its
//! training slice and drops it when scoring is done.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::buckets::OVER_PHASES;
use super::calibration::{calibrate, log_loss_term, squared_error, CalibrationReport};
use super::error::ModelError;
use super::rows::MatchStateRow;
use super::stabilizer::{estimate, Resolution, ResolutionCounts, DEFAULT_MIN_SAMPLES};
use super::store::BucketStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BacktestConfig {
    pub train_years: u32,
    pub test_years: u32,
    pub min_samples: u64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            train_years: 3,
            test_years: 1,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl BacktestConfig {
    fn validate(&self) -> Result<(), ModelError> {
        if self.train_years == 0 || self.test_years == 0 {
            return Err(ModelError::InvalidWindowConfig {
                train_years: self.train_years,
                test_years: self.test_years,
            });
        }
        Ok(())
    }
}

/// Half-open date intervals for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSpec {
    /// 1-based, in date order
    pub index: usize,
    pub train_start: NaiveDate,
    pub train_end: NaiveDate,
    pub test_start: NaiveDate,
    pub test_end: NaiveDate,
}

impl WindowSpec {
    pub fn in_train(&self, date: NaiveDate) -> bool {
        self.train_start <= date && date < self.train_end
    }

    pub fn in_test(&self, date: NaiveDate) -> bool {
        self.test_start <= date && date < self.test_end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseScore {
    pub phase: &'static str,
    pub count: usize,
    pub brier_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowMetrics {
    pub n_test_predictions: usize,
    pub test_matches: usize,
    pub brier_score: f64,
    pub log_loss: f64,
    pub accuracy: f64,
    pub avg_predicted_prob: f64,
    pub resolutions: ResolutionCounts,
    pub phase_brier: Vec<PhaseScore>,
    pub calibration: CalibrationReport,
    #[serde(skip)]
    pub predictions: Vec<(f64, bool)>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WindowOutcome {
    Scored(WindowMetrics),
    /// No rows dated inside the test interval.
    Empty,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowResult {
    pub window: WindowSpec,
    pub train_rows: usize,
    pub outcome: WindowOutcome,
}

impl WindowResult {
    pub fn metrics(&self) -> Option<&WindowMetrics> {
        match &self.outcome {
            WindowOutcome::Scored(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub config: BacktestConfig,
    pub windows: Vec<WindowResult>,
    pub windows_scored: usize,
    pub windows_failed: usize,
    pub windows_empty: usize,
    /// Mean of per-window Brier scores over scored windows.
    pub mean_brier: Option<f64>,
    /// Mean of per-window accuracies over scored windows.
    pub mean_accuracy: Option<f64>,
    pub total_predictions: usize,
    /// Where every out-of-sample estimate resolved, summed over windows.
    pub resolutions: ResolutionCounts,
    /// Calibration over every out-of-sample prediction from every window.
    pub pooled_calibration: CalibrationReport,
}

// ── Window planning ──────────────────────────────────────────────────────────

fn jan_first(year: i32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(NaiveDate::MAX)
}

/// Window boundaries for the calendar span covered by `dates`.
///
/// Only the dates matter: order and duplicates are irrelevant. The number of
/// windows is `floor((span_years - train_years) / test_years)`.
pub fn plan_windows<I>(dates: I, config: &BacktestConfig) -> Result<Vec<WindowSpec>, ModelError>
where
    I: IntoIterator<Item = NaiveDate>,
{
    config.validate()?;

    let (first, last) = dates
        .into_iter()
        .fold(None, |acc: Option<(NaiveDate, NaiveDate)>, d| match acc {
            None => Some((d, d)),
            Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
        })
        .ok_or(ModelError::EmptyInput)?;

    let first_year = first.year();
    let span_years = (last.year() - first_year + 1) as u32;
    let requested_years = config
        .train_years
        .checked_add(config.test_years)
        .ok_or(ModelError::InvalidWindowConfig {
            train_years: config.train_years,
            test_years: config.test_years,
        })?;
    if requested_years > span_years {
        return Err(ModelError::InsufficientWindowSpan {
            requested_years,
            available_years: span_years,
        });
    }

    let train = config.train_years as i32;
    let test = config.test_years as i32;
    let end_year = last.year() + 1;

    let mut windows = Vec::new();
    let mut start = first_year;
    while start + train + test <= end_year {
        windows.push(WindowSpec {
            index: windows.len() + 1,
            train_start: jan_first(start),
            train_end: jan_first(start + train),
            test_start: jan_first(start + train),
            test_end: jan_first(start + train + test),
        });
        start += test;
    }
    Ok(windows)
}

// ── Window execution ─────────────────────────────────────────────────────────

/// Build a store from the window's training rows and score its test rows.
///
/// `rows` must already be in date order.
pub fn run_window(rows: &[MatchStateRow], window: WindowSpec, min_samples: u64) -> WindowResult {
    let store = BucketStore::build(rows.iter().filter(|r| window.in_train(r.date)));
    let test: Vec<&MatchStateRow> = rows.iter().filter(|r| window.in_test(r.date)).collect();
    let train_rows = store.row_count();

    let outcome = if test.is_empty() {
        debug!("Window {}: no test rows in [{}, {})", window.index, window.test_start, window.test_end);
        WindowOutcome::Empty
    } else {
        match score_window(&store, &test, min_samples) {
            Ok(metrics) => {
                info!(
                    "Window {:2}: train={}..{} test={}..{} rows={} matches={} brier={:.6} logloss={:.6} acc={:.4}",
                    window.index,
                    window.train_start,
                    window.train_end,
                    window.test_start,
                    window.test_end,
                    metrics.n_test_predictions,
                    metrics.test_matches,
                    metrics.brier_score,
                    metrics.log_loss,
                    metrics.accuracy
                );
                WindowOutcome::Scored(metrics)
            }
            Err(e) => {
                warn!("Window {} failed: {}", window.index, e);
                WindowOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    };

    WindowResult {
        window,
        train_rows,
        outcome,
    }
}

fn score_window(
    store: &BucketStore,
    test: &[&MatchStateRow],
    min_samples: u64,
) -> Result<WindowMetrics, ModelError> {
    let mut predictions = Vec::with_capacity(test.len());
    let mut resolutions = ResolutionCounts::default();
    let mut matches = BTreeSet::new();
    let mut phases: Vec<(&'static str, usize, f64)> =
        OVER_PHASES.labels().map(|p| (p, 0, 0.0)).collect();

    let mut brier_sum = 0.0;
    let mut log_loss_sum = 0.0;
    let mut correct = 0usize;

    for row in test {
        let est = estimate(store, row, min_samples)?;
        let p = est.probability;
        let se = squared_error(p, row.team_won);

        brier_sum += se;
        log_loss_sum += log_loss_term(p, row.team_won);
        if (p >= 0.5) == row.team_won {
            correct += 1;
        }
        resolutions.record(est.resolution);
        matches.insert(row.match_id.as_str());

        let phase = OVER_PHASES.label(row.over as f64);
        if let Some(slot) = phases.iter_mut().find(|(name, _, _)| *name == phase) {
            slot.1 += 1;
            slot.2 += se;
        }
        predictions.push((p, row.team_won));
    }

    let n = predictions.len() as f64;
    let calibration = calibrate(&predictions)?;
    Ok(WindowMetrics {
        n_test_predictions: predictions.len(),
        test_matches: matches.len(),
        brier_score: brier_sum / n,
        log_loss: log_loss_sum / n,
        accuracy: correct as f64 / n,
        avg_predicted_prob: predictions.iter().map(|(p, _)| p).sum::<f64>() / n,
        resolutions,
        phase_brier: phases
            .into_iter()
            .filter(|(_, count, _)| *count > 0)
            .map(|(phase, count, sum)| PhaseScore {
                phase,
                count,
                brier_score: sum / count as f64,
            })
            .collect(),
        calibration,
        predictions,
    })
}

// ── Orchestration ────────────────────────────────────────────────────────────

fn sorted_by_date(mut rows: Vec<MatchStateRow>) -> Vec<MatchStateRow> {
    // Stable: same-day rows keep their input order.
    rows.sort_by_key(|r| r.date);
    rows
}

/// Run every window in order on the current thread.
pub fn run(rows: &[MatchStateRow], config: BacktestConfig) -> Result<BacktestReport, ModelError> {
    let windows = plan_windows(rows.iter().map(|r| r.date), &config)?;
    let ordered = sorted_by_date(rows.to_vec());
    let results = windows
        .into_iter()
        .map(|window| run_window(&ordered, window, config.min_samples))
        .collect();
    summarize(config, results)
}

/// Run every window on the blocking pool. Windows share the row set
/// read-only and each owns its store; results come back in window order.
pub async fn run_concurrent(
    rows: Vec<MatchStateRow>,
    config: BacktestConfig,
) -> Result<BacktestReport, ModelError> {
    let windows = plan_windows(rows.iter().map(|r| r.date), &config)?;
    let ordered: Arc<[MatchStateRow]> = sorted_by_date(rows).into();

    let handles: Vec<_> = windows
        .into_iter()
        .map(|window| {
            let rows = Arc::clone(&ordered);
            let handle = tokio::task::spawn_blocking(move || {
                run_window(&rows, window, config.min_samples)
            });
            (window, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (window, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Window {} worker did not finish: {}", window.index, e);
                WindowResult {
                    window,
                    train_rows: 0,
                    outcome: WindowOutcome::Failed {
                        reason: format!("worker did not finish: {}", e),
                    },
                }
            }
        };
        results.push(result);
    }
    summarize(config, results)
}

fn summarize(
    config: BacktestConfig,
    windows: Vec<WindowResult>,
) -> Result<BacktestReport, ModelError> {
    let scored: Vec<&WindowMetrics> = windows.iter().filter_map(WindowResult::metrics).collect();
    let windows_failed = windows
        .iter()
        .filter(|w| matches!(w.outcome, WindowOutcome::Failed { .. }))
        .count();
    let windows_empty = windows
        .iter()
        .filter(|w| matches!(w.outcome, WindowOutcome::Empty))
        .count();

    let mean = |f: fn(&WindowMetrics) -> f64| {
        (!scored.is_empty()).then(|| scored.iter().map(|m| f(m)).sum::<f64>() / scored.len() as f64)
    };
    let mean_brier = mean(|m| m.brier_score);
    let mean_accuracy = mean(|m| m.accuracy);

    let pooled: Vec<(f64, bool)> = scored
        .iter()
        .flat_map(|m| m.predictions.iter().copied())
        .collect();
    let pooled_calibration = calibrate(&pooled)?;

    let mut resolutions = ResolutionCounts::default();
    for m in &scored {
        resolutions.merge(&m.resolutions);
    }

    info!(
        "Backtest finished: {} windows ({} scored, {} failed, {} empty), {} predictions ({} global), mean brier={}, mean acc={}",
        windows.len(),
        scored.len(),
        windows_failed,
        windows_empty,
        pooled.len(),
        resolutions.get(Resolution::Global),
        mean_brier.map_or("n/a".to_string(), |b| format!("{:.6}", b)),
        mean_accuracy.map_or("n/a".to_string(), |a| format!("{:.4}", a)),
    );

    Ok(BacktestReport {
        config,
        windows_scored: scored.len(),
        windows_failed,
        windows_empty,
        mean_brier,
        mean_accuracy,
        total_predictions: pooled.len(),
        resolutions,
        pooled_calibration,
        windows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rows::tests::row;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// A few rows per year for `years`, both innings.
    fn seasons(years: std::ops::RangeInclusive<i32>) -> Vec<MatchStateRow> {
        let mut rows = Vec::new();
        for year in years {
            for m in 0..6 {
                let d = format!("{}-0{}-1{}", year, 3 + m % 6, m);
                rows.push(row(&d, 1, 4 + m as u32, 1, m % 2 == 0));
                rows.push(row(&d, 2, 14 + m as u32, 4, m % 2 == 1));
            }
        }
        rows
    }

    fn config() -> BacktestConfig {
        BacktestConfig {
            train_years: 3,
            test_years: 1,
            min_samples: 5,
        }
    }

    #[test]
    fn window_count_follows_span() {
        // 2005..=2022 spans 18 years -> 15 windows of 3+1.
        let rows = seasons(2005..=2022);
        let windows = plan_windows(rows.iter().map(|r| r.date), &config()).unwrap();
        assert_eq!(windows.len(), 15);
        assert_eq!(windows[0].train_start, date("2005-01-01"));
        assert_eq!(windows[0].test_start, date("2008-01-01"));
        assert_eq!(windows[14].test_start, date("2022-01-01"));
        assert_eq!(windows[14].test_end, date("2023-01-01"));
    }

    #[test]
    fn window_count_with_wider_steps() {
        let rows = seasons(2010..=2019);
        let cfg = BacktestConfig {
            train_years: 3,
            test_years: 2,
            ..config()
        };
        let windows = plan_windows(rows.iter().map(|r| r.date), &cfg).unwrap();
        // floor((10 - 3) / 2)
        assert_eq!(windows.len(), 3);
        for pair in windows.windows(2) {
            assert_eq!(pair[1].train_start.year() - pair[0].train_start.year(), 2);
        }
    }

    #[test]
    fn window_plan_ignores_row_order() {
        let rows = seasons(2008..=2016);
        let mut shuffled = rows.clone();
        shuffled.shuffle(&mut StdRng::seed_from_u64(7));
        let a = plan_windows(rows.iter().map(|r| r.date), &config()).unwrap();
        let b = plan_windows(shuffled.iter().map(|r| r.date), &config()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn span_too_short_is_rejected_up_front() {
        let rows = seasons(2019..=2021);
        let err = run(&rows, config()).unwrap_err();
        assert_eq!(
            err,
            ModelError::InsufficientWindowSpan {
                requested_years: 4,
                available_years: 3
            }
        );
    }

    #[test]
    fn zero_years_is_a_config_error() {
        let rows = seasons(2010..=2015);
        let cfg = BacktestConfig {
            test_years: 0,
            ..config()
        };
        assert!(matches!(
            run(&rows, cfg),
            Err(ModelError::InvalidWindowConfig { .. })
        ));
    }

    #[test]
    fn oversized_window_config_is_rejected_without_overflow() {
        let rows = seasons(2010..=2015);
        let cfg = BacktestConfig {
            train_years: u32::MAX,
            test_years: 1,
            ..config()
        };
        assert_eq!(
            run(&rows, cfg).unwrap_err(),
            ModelError::InvalidWindowConfig {
                train_years: u32::MAX,
                test_years: 1
            }
        );
        let cfg = BacktestConfig {
            train_years: u32::MAX - 1,
            test_years: 1,
            ..config()
        };
        assert!(matches!(
            run(&rows, cfg),
            Err(ModelError::InsufficientWindowSpan { .. })
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(run(&[], config()).unwrap_err(), ModelError::EmptyInput);
    }

    #[test]
    fn no_training_row_postdates_a_test_row() {
        let rows = seasons(2009..=2016);
        let windows = plan_windows(rows.iter().map(|r| r.date), &config()).unwrap();
        for w in windows {
            let max_train = rows.iter().filter(|r| w.in_train(r.date)).map(|r| r.date).max();
            let min_test = rows.iter().filter(|r| w.in_test(r.date)).map(|r| r.date).min();
            if let (Some(tr), Some(te)) = (max_train, min_test) {
                assert!(tr < te, "window {} leaks: {} >= {}", w.index, tr, te);
            }
        }
    }

    #[test]
    fn windows_are_scored_only_from_their_training_slice() {
        // Everything before 2015 the batting side loses; from 2015 it always wins.
        let mut rows = Vec::new();
        for year in 2012..=2015 {
            for i in 0..10 {
                let d = format!("{}-05-{:02}", year, i + 1);
                rows.push(row(&d, 1, 5, 1, year >= 2015));
            }
        }
        let report = run(&rows, config()).unwrap();
        assert_eq!(report.windows.len(), 1);
        let m = report.windows[0].metrics().unwrap();
        // Trained on 2012-2014 losses only, so it predicts 0 and misses every 2015 win.
        assert_eq!(report.windows[0].train_rows, 30);
        assert_eq!(m.n_test_predictions, 10);
        assert_relative_eq!(m.accuracy, 0.0);
        assert_relative_eq!(m.brier_score, 1.0);
    }

    #[test]
    fn accuracy_counts_threshold_hits() {
        // Training: one bucket with 60% wins -> every test prediction is 0.6.
        let mut rows = Vec::new();
        for i in 0..10 {
            for year in 2016..=2018 {
                let d = format!("{}-04-{:02}", year, i + 1);
                rows.push(row(&d, 2, 10, 2, i < 6));
            }
        }
        // Test year: 6 of 10 batting sides win.
        for i in 0..10 {
            let d = format!("2019-04-{:02}", i + 1);
            rows.push(row(&d, 2, 10, 2, i < 6));
        }
        let report = run(&rows, config()).unwrap();
        let m = report.windows[0].metrics().unwrap();
        assert_eq!(m.n_test_predictions, 10);
        assert_relative_eq!(m.accuracy, 0.6, epsilon = 1e-12);
        assert_relative_eq!(m.avg_predicted_prob, 0.6, epsilon = 1e-12);
        assert_eq!(m.resolutions.get(Resolution::Bucket(crate::model::buckets::Level::Full)), 10);
        assert_eq!(report.mean_accuracy, Some(m.accuracy));
        assert_eq!(report.total_predictions, 10);
        assert_eq!(report.resolutions, m.resolutions);
    }

    #[test]
    fn window_metrics_split_by_phase_and_match() {
        // Training: powerplay chases win 80%, death-over chases 30%.
        let mut rows = Vec::new();
        for year in 2016..=2018 {
            for i in 0..10 {
                let d = format!("{}-04-{:02}", year, i + 1);
                rows.push(row(&d, 2, 3, 1, i < 8));
                rows.push(row(&d, 2, 18, 1, i < 3));
            }
        }
        // Two test matches, one powerplay and one death row each. The first is won.
        for (d, won) in [("2019-05-01", true), ("2019-05-02", false)] {
            rows.push(row(d, 2, 3, 1, won));
            rows.push(row(d, 2, 18, 1, won));
        }

        let report = run(&rows, config()).unwrap();
        assert_eq!(report.windows.len(), 1);
        let m = report.windows[0].metrics().unwrap();
        assert_eq!(m.n_test_predictions, 4);
        assert_eq!(m.test_matches, 2);

        assert_eq!(m.phase_brier.len(), 2);
        let powerplay = &m.phase_brier[0];
        assert_eq!((powerplay.phase, powerplay.count), ("powerplay", 2));
        assert_relative_eq!(powerplay.brier_score, (0.04 + 0.64) / 2.0, epsilon = 1e-12);
        let death = &m.phase_brier[1];
        assert_eq!((death.phase, death.count), ("death", 2));
        assert_relative_eq!(death.brier_score, (0.49 + 0.09) / 2.0, epsilon = 1e-12);
        assert_relative_eq!(m.brier_score, 0.315, epsilon = 1e-12);

        let log_loss = -(0.8f64.ln() + 0.3f64.ln() + 0.2f64.ln() + 0.7f64.ln()) / 4.0;
        assert_relative_eq!(m.log_loss, log_loss, epsilon = 1e-12);
        assert_relative_eq!(m.avg_predicted_prob, 0.55, epsilon = 1e-12);

        // Deciles for 0.3 and 0.8, each observed at 50%.
        let filled: Vec<_> = m.calibration.bins.iter().filter(|b| b.count > 0).collect();
        assert_eq!(filled.len(), 2);
        assert!(filled.iter().all(|b| b.count == 2));
        assert_relative_eq!(m.calibration.max_abs_error.unwrap(), 0.3, epsilon = 1e-12);
        assert_eq!(m.calibration.n_predictions, 4);
    }

    #[test]
    fn missing_innings_fails_only_that_window() {
        // Second innings first appears in 2016, so the first window cannot
        // score its 2016 chase rows.
        let mut rows = Vec::new();
        for year in 2013..=2017 {
            for i in 0..5 {
                let d = format!("{}-06-{:02}", year, i + 1);
                rows.push(row(&d, 1, 8, 2, i % 2 == 0));
                if year >= 2016 {
                    rows.push(row(&d, 2, 8, 2, i % 2 == 1));
                }
            }
        }
        let report = run(&rows, config()).unwrap();
        assert_eq!(report.windows.len(), 2);
        assert!(matches!(
            report.windows[0].outcome,
            WindowOutcome::Failed { .. }
        ));
        assert!(report.windows[1].metrics().is_some());
        assert_eq!(report.windows_failed, 1);
        assert_eq!(report.windows_scored, 1);
    }

    #[test]
    fn gap_year_yields_empty_window() {
        let mut rows = seasons(2010..=2012);
        rows.extend(seasons(2014..=2014));
        let report = run(&rows, config()).unwrap();
        // 2010..2014 spans 5 years: windows test 2013 (empty) and 2014.
        assert_eq!(report.windows.len(), 2);
        assert!(matches!(report.windows[0].outcome, WindowOutcome::Empty));
        assert_eq!(report.windows_empty, 1);
        assert!(report.mean_brier.is_some());
    }

    #[test]
    fn predictions_stay_in_unit_range() {
        let report = run(&seasons(2005..=2014), config()).unwrap();
        for w in &report.windows {
            if let Some(m) = w.metrics() {
                assert!(m.predictions.iter().all(|(p, _)| (0.0..=1.0).contains(p)));
                assert!(m.brier_score >= 0.0 && m.brier_score <= 1.0);
            }
        }
        assert!(report.pooled_calibration.max_abs_error.is_some());
    }

    #[tokio::test]
    async fn concurrent_run_matches_sequential() {
        let rows = seasons(2006..=2015);
        let sequential = run(&rows, config()).unwrap();
        let concurrent = run_concurrent(rows, config()).await.unwrap();

        assert_eq!(sequential.windows.len(), concurrent.windows.len());
        for (a, b) in sequential.windows.iter().zip(&concurrent.windows) {
            assert_eq!(a.window, b.window);
            assert_eq!(a.train_rows, b.train_rows);
            let (ma, mb) = (a.metrics().unwrap(), b.metrics().unwrap());
            assert_eq!(ma.brier_score, mb.brier_score);
            assert_eq!(ma.predictions, mb.predictions);
        }
        assert_eq!(sequential.mean_brier, concurrent.mean_brier);
    }
}
