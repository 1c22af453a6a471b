use thiserror::Error;

/// Why an input row was rejected before it could reach the model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedReason {
    #[error("innings must be 1 or 2, got {0}")]
    InvalidInnings(i64),
    #[error("over number must be >= 1, got {0}")]
    InvalidOver(i64),
    #[error("wickets must be within 0..=10, got {0}")]
    InvalidWickets(i64),
    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("{field} is too large, got {value}")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("{0} is not a finite number")]
    NonFinite(&'static str),
    #[error("second-innings row is missing {0}")]
    MissingChaseField(&'static str),
    #[error("unparseable date '{0}'")]
    InvalidDate(String),
    #[error("unparseable outcome '{0}'")]
    InvalidOutcome(String),
    #[error("record could not be decoded: {0}")]
    Decode(String),
}

/// A match-state row that cannot be used. Recovered locally: the row is
/// dropped from both build and test sets and counted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed row (match {match_id}, line {line}): {reason}")]
pub struct MalformedRowError {
    pub match_id: String,
    pub line: u64,
    pub reason: MalformedReason,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// The store holds zero rows for the queried innings, so even the global
    /// prior is undefined. Fatal for the window that hit it.
    #[error("no training data for innings {innings}")]
    NoTrainingData { innings: u8 },

    /// `train + test` years do not fit inside the data's calendar span.
    /// Raised before any window executes.
    #[error(
        "window needs {requested_years} years (train + test) but data spans only {available_years}"
    )]
    InsufficientWindowSpan {
        requested_years: u32,
        available_years: u32,
    },

    #[error("train_years and test_years must both be >= 1 (got {train_years}/{test_years})")]
    InvalidWindowConfig { train_years: u32, test_years: u32 },

    #[error("no valid match-state rows to evaluate")]
    EmptyInput,

    /// A prediction outside [0, 1]. Always a bug upstream; never clipped.
    #[error("probability {0} is outside [0, 1]")]
    InvalidProbability(f64),
}
