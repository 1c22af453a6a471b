use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::backtest::BacktestReport;

pub mod models;
use models::*;

/// Thread-safe SQLite handle (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Stabilized model ──────────────────────────────────────────────────────

    /// Replace the stabilized model table with a freshly built one
    pub fn replace_stabilized_model(&self, rows: &[StabilizedModelRow]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM stabilized_model", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO stabilized_model (
                    level, bucket_key, innings, over_bucket, over_phase,
                    wickets_bucket, run_rate_bucket, elo_diff_bucket,
                    count, wins, win_rate, standard_error, ci_lower_95, ci_upper_95,
                    stability, stabilized_probability, resolved_level
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.level,
                    r.bucket_key,
                    r.innings,
                    r.over_bucket,
                    r.over_phase,
                    r.wickets_bucket,
                    r.run_rate_bucket,
                    r.elo_diff_bucket,
                    r.count,
                    r.wins,
                    r.win_rate,
                    r.standard_error,
                    r.ci_lower_95,
                    r.ci_upper_95,
                    r.stability,
                    r.stabilized_probability,
                    r.resolved_level,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ── Backtest results ──────────────────────────────────────────────────────

    /// Persist a whole backtest run: the run summary, one row per window plus
    /// the aggregate row, and the pooled calibration deciles. Returns the run id.
    pub fn record_backtest(
        &self,
        report: &BacktestReport,
        rows_used: usize,
        rows_rejected: usize,
    ) -> Result<i64> {
        let run = BacktestRun::from_report(report, rows_used, rows_rejected);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO backtest_runs (
                train_years, test_years, min_samples, rows_used, rows_rejected,
                windows_total, windows_scored, windows_failed, windows_empty,
                mean_brier, mean_accuracy, total_predictions, pooled_max_abs_error,
                created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                run.train_years,
                run.test_years,
                run.min_samples,
                run.rows_used,
                run.rows_rejected,
                run.windows_total,
                run.windows_scored,
                run.windows_failed,
                run.windows_empty,
                run.mean_brier,
                run.mean_accuracy,
                run.total_predictions,
                run.pooled_max_abs_error,
                run.created_at,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO backtest_windows (
                    run_id, window_index, train_start, train_end, test_start, test_end,
                    status, failure_reason, train_rows, n_test_predictions, test_matches,
                    brier_score, log_loss, accuracy, avg_predicted_prob
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            )?;
            let rows = report
                .windows
                .iter()
                .map(|w| BacktestWindowRow::from_window(run_id, w))
                .chain(std::iter::once(BacktestWindowRow::aggregate(run_id, report)));
            for w in rows {
                stmt.execute(params![
                    w.run_id,
                    w.window_index,
                    w.train_start,
                    w.train_end,
                    w.test_start,
                    w.test_end,
                    w.status,
                    w.failure_reason,
                    w.train_rows,
                    w.n_test_predictions,
                    w.test_matches,
                    w.brier_score,
                    w.log_loss,
                    w.accuracy,
                    w.avg_predicted_prob,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO calibration_bins (
                    run_id, bin_index, lower, upper, count, mean_predicted, empirical_frequency
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            )?;
            for bin in &report.pooled_calibration.bins {
                let b = CalibrationBinRow::from_bin(run_id, bin);
                stmt.execute(params![
                    b.run_id,
                    b.bin_index,
                    b.lower,
                    b.upper,
                    b.count,
                    b.mean_predicted,
                    b.empirical_frequency,
                ])?;
            }
        }

        tx.commit()?;
        Ok(run_id)
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS stabilized_model (
    level                  INTEGER NOT NULL,
    bucket_key             TEXT    NOT NULL,
    innings                INTEGER NOT NULL,
    over_bucket            TEXT,
    over_phase             TEXT,
    wickets_bucket         TEXT,
    run_rate_bucket        TEXT,
    elo_diff_bucket        TEXT,
    count                  INTEGER NOT NULL,
    wins                   INTEGER NOT NULL,
    win_rate               REAL    NOT NULL,
    standard_error         REAL    NOT NULL,
    ci_lower_95            REAL    NOT NULL,
    ci_upper_95            REAL    NOT NULL,
    stability              TEXT    NOT NULL,
    stabilized_probability REAL    NOT NULL,
    resolved_level         TEXT    NOT NULL,
    PRIMARY KEY (level, bucket_key),
    CHECK (wins >= 0 AND wins <= count)
);

CREATE TABLE IF NOT EXISTS backtest_runs (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    train_years          INTEGER NOT NULL,
    test_years           INTEGER NOT NULL,
    min_samples          INTEGER NOT NULL,
    rows_used            INTEGER NOT NULL,
    rows_rejected        INTEGER NOT NULL,
    windows_total        INTEGER NOT NULL,
    windows_scored       INTEGER NOT NULL,
    windows_failed       INTEGER NOT NULL,
    windows_empty        INTEGER NOT NULL,
    mean_brier           REAL,
    mean_accuracy        REAL,
    total_predictions    INTEGER NOT NULL,
    pooled_max_abs_error REAL,
    created_at           TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS backtest_windows (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id             INTEGER NOT NULL,
    window_index       INTEGER,
    train_start        TEXT,
    train_end          TEXT,
    test_start         TEXT,
    test_end           TEXT,
    status             TEXT    NOT NULL,
    failure_reason     TEXT,
    train_rows         INTEGER,
    n_test_predictions INTEGER NOT NULL,
    test_matches       INTEGER,
    brier_score        REAL,
    log_loss           REAL,
    accuracy           REAL,
    avg_predicted_prob REAL,
    FOREIGN KEY (run_id) REFERENCES backtest_runs(id)
);

CREATE TABLE IF NOT EXISTS calibration_bins (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id              INTEGER NOT NULL,
    bin_index           INTEGER NOT NULL,
    lower               REAL    NOT NULL,
    upper               REAL    NOT NULL,
    count               INTEGER NOT NULL,
    mean_predicted      REAL,
    empirical_frequency REAL,
    FOREIGN KEY (run_id) REFERENCES backtest_runs(id)
);

CREATE INDEX IF NOT EXISTS idx_backtest_windows_run ON backtest_windows(run_id);
CREATE INDEX IF NOT EXISTS idx_calibration_bins_run ON calibration_bins(run_id);
"#;
