use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

mod config;
mod db;
mod input;
mod model;

use config::Config;
use db::models::StabilizedModelRow;
use db::Database;
use model::backtest::{run, run_concurrent};
use model::buckets::Level;
use model::stabilizer::{stabilized_model, Resolution};
use model::{BucketStore, StabilizedModel};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let backtest_config = config.backtest();

    info!(
        "Walk-forward backtest: train={}y test={}y min_samples={} ({})",
        config.train_years,
        config.test_years,
        config.min_samples,
        if config.sequential_windows {
            "sequential"
        } else {
            "concurrent"
        }
    );

    // Load input
    let loaded = input::load_csv(&config.input_path)?;
    if loaded.rows.is_empty() {
        bail!(
            "No valid match-state rows in {} ({} rejected)",
            config.input_path.display(),
            loaded.rejected.len()
        );
    }
    if !loaded.rejected.is_empty() {
        warn!("{} malformed rows were dropped", loaded.rejected.len());
    }
    let rows_used = loaded.rows.len();
    let rows_rejected = loaded.rejected.len();

    // Full-data store for the published model table
    let store = BucketStore::build(&loaded.rows);
    for innings in [1u8, 2] {
        if !store.has_innings(innings) {
            warn!("Input has no innings-{} rows; those states cannot be estimated", innings);
        }
    }
    let model = stabilized_model(&store, config.min_samples)
        .context("Failed to build stabilized model")?;
    log_fallback_summary(&model);

    // Backtest
    let report = if config.sequential_windows {
        run(&loaded.rows, backtest_config)
    } else {
        run_concurrent(loaded.rows, backtest_config).await
    }
    .context("Backtest aborted")?;

    let pooled = &report.pooled_calibration;
    if let (Some(max_err), Some(brier)) = (pooled.max_abs_error, pooled.brier_score) {
        info!(
            "Pooled calibration: {} predictions, max abs error={:.4}, brier={:.6}",
            pooled.n_predictions, max_err, brier
        );
    }

    // Persist
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let table: Vec<StabilizedModelRow> = model.buckets.iter().map(StabilizedModelRow::from).collect();
    db.replace_stabilized_model(&table)?;
    let run_id = db.record_backtest(&report, rows_used, rows_rejected)?;
    info!(
        "Wrote {} stabilized buckets and backtest run #{} ({} windows)",
        table.len(),
        run_id,
        report.windows.len()
    );

    if config.print_summary {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}

fn log_fallback_summary(model: &StabilizedModel) {
    let counts = &model.level1_fallbacks;
    let total = counts.total();
    if total == 0 {
        return;
    }
    info!(
        "Level-1 buckets: {} (min_samples={}); resolution breakdown:",
        total, model.min_samples
    );
    for level in Level::ALL {
        let n = counts.get(Resolution::Bucket(level));
        info!(
            "  level {}: {} ({:.1}%)",
            level.number(),
            n,
            100.0 * n as f64 / total as f64
        );
    }
    let global = counts.get(Resolution::Global);
    info!(
        "  global: {} ({:.1}%)",
        global,
        100.0 * global as f64 / total as f64
    );
}
