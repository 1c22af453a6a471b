use std::path::PathBuf;

use clap::Parser;

use crate::model::BacktestConfig;

/// Cricket in-play win probability: bucket model, walk-forward backtest and calibration
#[derive(Parser, Debug, Clone)]
#[command(name = "cricket-winprob", version, about)]
pub struct Config {
    /// CSV of per-over match states (match_id, date, innings, over, ...)
    #[arg(long, env = "INPUT_PATH", default_value = "data/over_state_snapshots.csv")]
    pub input_path: PathBuf,

    /// SQLite database the output tables are written to
    #[arg(long, env = "DATABASE_PATH", default_value = "winprob.db")]
    pub database_path: String,

    /// Width of each training window in calendar years
    #[arg(long, env = "TRAIN_YEARS", default_value = "3")]
    pub train_years: u32,

    /// Width of each test window (and the step between windows) in calendar years
    #[arg(long, env = "TEST_YEARS", default_value = "1")]
    pub test_years: u32,

    /// Minimum observations for a bucket to be trusted
    #[arg(long, env = "MIN_SAMPLES", default_value = "50")]
    pub min_samples: u64,

    /// Run backtest windows one after another instead of concurrently
    #[arg(long, env = "SEQUENTIAL_WINDOWS", default_value = "false")]
    pub sequential_windows: bool,

    /// Print the full backtest report as JSON to stdout
    #[arg(long, env = "PRINT_SUMMARY", default_value = "false")]
    pub print_summary: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.train_years == 0 {
            anyhow::bail!("train_years must be at least 1");
        }
        if self.test_years == 0 {
            anyhow::bail!("test_years must be at least 1");
        }
        if self.min_samples == 0 {
            anyhow::bail!("min_samples must be at least 1");
        }
        Ok(())
    }

    pub fn backtest(&self) -> BacktestConfig {
        BacktestConfig {
            train_years: self.train_years,
            test_years: self.test_years,
            min_samples: self.min_samples,
        }
    }
}
