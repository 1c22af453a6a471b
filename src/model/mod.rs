pub mod backtest;
pub mod buckets;
pub mod calibration;
pub mod error;
pub mod rows;
pub mod stabilizer;
pub mod store;

pub use backtest::BacktestConfig;
pub use stabilizer::StabilizedModel;
pub use store::BucketStore;
