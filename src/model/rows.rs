use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::{MalformedReason, MalformedRowError};

/// One end-of-over observation of a T20 innings, as produced by the upstream
/// state-derivation step. Never mutated once validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchStateRow {
    pub match_id: String,
    pub date: NaiveDate,
    /// 1 or 2
    pub innings: u8,
    /// 1-indexed over number the snapshot was taken at
    pub over: u32,
    pub balls_remaining: u32,
    pub runs: u32,
    pub wickets: u8,
    /// Runs required to win; second innings only
    pub target: Option<u32>,
    /// Second innings only
    pub required_run_rate: Option<f64>,
    /// Batting team Elo minus bowling team Elo
    pub elo_diff: Option<f64>,
    /// Did the batting team go on to win
    pub team_won: bool,
}

impl MatchStateRow {
    /// Runs per over so far.
    pub fn current_run_rate(&self) -> f64 {
        self.runs as f64 / self.over as f64
    }

    /// Required minus current run rate. Positive means the chase is behind.
    pub fn chase_pressure(&self) -> Option<f64> {
        self.required_run_rate
            .map(|rrr| rrr - self.current_run_rate())
    }

    /// Validate a decoded CSV record. `line` is only used for error reporting.
    pub fn from_raw(raw: RawStateRecord, line: u64) -> Result<Self, MalformedRowError> {
        let reject = |reason: MalformedReason| MalformedRowError {
            match_id: raw.match_id.clone(),
            line,
            reason,
        };

        let innings = match raw.innings {
            1 | 2 => raw.innings as u8,
            other => return Err(reject(MalformedReason::InvalidInnings(other))),
        };
        if raw.over < 1 {
            return Err(reject(MalformedReason::InvalidOver(raw.over)));
        }
        let over = to_u32("over", raw.over).map_err(reject)?;
        if !(0..=10).contains(&raw.wickets) {
            return Err(reject(MalformedReason::InvalidWickets(raw.wickets)));
        }
        let runs = to_u32("runs", raw.runs).map_err(reject)?;
        let balls_remaining = to_u32("balls_remaining", raw.balls_remaining).map_err(reject)?;
        if let Some(elo) = raw.elo_diff {
            if !elo.is_finite() {
                return Err(reject(MalformedReason::NonFinite("elo_diff")));
            }
        }

        let (target, required_run_rate) = if innings == 2 {
            let target = raw
                .target
                .ok_or_else(|| reject(MalformedReason::MissingChaseField("target")))?;
            let target = to_u32("target", target).map_err(reject)?;
            let rrr = raw
                .required_run_rate
                .ok_or_else(|| reject(MalformedReason::MissingChaseField("required_run_rate")))?;
            if !rrr.is_finite() {
                return Err(reject(MalformedReason::NonFinite("required_run_rate")));
            }
            (Some(target), Some(rrr))
        } else {
            // First-innings rows carry no chase context even if the column is filled.
            (None, None)
        };

        let date = NaiveDate::parse_from_str(raw.date.trim(), "%Y-%m-%d")
            .map_err(|_| reject(MalformedReason::InvalidDate(raw.date.clone())))?;
        let team_won = parse_outcome(&raw.team_won)
            .ok_or_else(|| reject(MalformedReason::InvalidOutcome(raw.team_won.clone())))?;

        Ok(MatchStateRow {
            match_id: raw.match_id.clone(),
            date,
            innings,
            over,
            balls_remaining,
            runs,
            wickets: raw.wickets as u8,
            target,
            required_run_rate,
            elo_diff: raw.elo_diff,
            team_won,
        })
    }
}

/// Untyped record exactly as it appears in the input table.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStateRecord {
    pub match_id: String,
    pub date: String,
    pub innings: i64,
    pub over: i64,
    pub balls_remaining: i64,
    pub runs: i64,
    pub wickets: i64,
    pub target: Option<i64>,
    pub required_run_rate: Option<f64>,
    pub elo_diff: Option<f64>,
    pub team_won: String,
}

/// Non-negative count that must fit the row's `u32` fields.
fn to_u32(field: &'static str, value: i64) -> Result<u32, MalformedReason> {
    if value < 0 {
        return Err(MalformedReason::Negative {
            field,
            value: value as f64,
        });
    }
    u32::try_from(value).map_err(|_| MalformedReason::OutOfRange { field, value })
}

fn parse_outcome(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}
