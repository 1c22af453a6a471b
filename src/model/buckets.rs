//! Discretisation of match state into bucket keys.
//!
//! Every boundary lives in one of the static [`BinTable`]s below. The same
//! tables are used when the store is built and when it is queried, and the
//! stabilized model table reports the same labels.
//!
//! Over bins nest inside over phases (powerplay 1-6, middle 7-15, death 16+),
//! so each level is a strict coarsening of the previous one.

use std::fmt;

use serde::Serialize;

use super::rows::MatchStateRow;

// ── Binning tables ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upper {
    /// `value <= x`
    Inclusive(f64),
    /// `value < x`
    Exclusive(f64),
    /// Catch-all last bin.
    Open,
}

#[derive(Debug, Clone, Copy)]
pub struct Bin {
    pub label: &'static str,
    pub upper: Upper,
}

/// Ordered bins; a value falls into the first bin whose upper bound admits it.
#[derive(Debug)]
pub struct BinTable {
    pub bins: &'static [Bin],
}

impl BinTable {
    pub fn label(&self, value: f64) -> &'static str {
        for bin in self.bins {
            let admits = match bin.upper {
                Upper::Inclusive(x) => value <= x,
                Upper::Exclusive(x) => value < x,
                Upper::Open => true,
            };
            if admits {
                return bin.label;
            }
        }
        // Tables always end with an open bin.
        self.bins[self.bins.len() - 1].label
    }

    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.bins.iter().map(|b| b.label)
    }
}

const fn bin(label: &'static str, upper: Upper) -> Bin {
    Bin { label, upper }
}

pub static OVER_BINS: BinTable = BinTable {
    bins: &[
        bin("1-3", Upper::Inclusive(3.0)),
        bin("4-6", Upper::Inclusive(6.0)),
        bin("7-10", Upper::Inclusive(10.0)),
        bin("11-15", Upper::Inclusive(15.0)),
        bin("16+", Upper::Open),
    ],
};

pub static OVER_PHASES: BinTable = BinTable {
    bins: &[
        bin("powerplay", Upper::Inclusive(6.0)),
        bin("middle", Upper::Inclusive(15.0)),
        bin("death", Upper::Open),
    ],
};

pub static WICKET_BINS: BinTable = BinTable {
    bins: &[
        bin("0-2", Upper::Inclusive(2.0)),
        bin("3-5", Upper::Inclusive(5.0)),
        bin("6-10", Upper::Open),
    ],
};

/// Second innings: required run rate minus current run rate.
pub static CHASE_PRESSURE_BINS: BinTable = BinTable {
    bins: &[
        bin("very_low", Upper::Inclusive(-4.0)),
        bin("low", Upper::Inclusive(-1.0)),
        bin("neutral", Upper::Inclusive(1.0)),
        bin("high", Upper::Inclusive(4.0)),
        bin("very_high", Upper::Open),
    ],
};

pub static ELO_DIFF_BINS: BinTable = BinTable {
    bins: &[
        bin("strong_disadvantage", Upper::Exclusive(-75.0)),
        bin("moderate_disadvantage", Upper::Exclusive(-25.0)),
        bin("neutral", Upper::Inclusive(25.0)),
        bin("moderate_advantage", Upper::Inclusive(75.0)),
        bin("strong_advantage", Upper::Open),
    ],
};

/// Run-rate label for every first-innings row. Without a target there is no
/// chase pressure, so innings 1 is never split on run rate.
pub const FIRST_INNINGS: &str = "first_innings";

/// Label used when the Elo differential is unknown.
pub const ELO_UNKNOWN: &str = "neutral";

// ── Levels ───────────────────────────────────────────────────────────────────

/// Granularity level, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Level {
    /// innings, over, wickets, run rate, elo
    Full = 1,
    /// innings, over, wickets, run rate
    WithoutElo = 2,
    /// innings, over, wickets
    OverWickets = 3,
    /// innings, over phase
    Phase = 4,
    /// innings
    Innings = 5,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Full,
        Level::WithoutElo,
        Level::OverWickets,
        Level::Phase,
        Level::Innings,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn coarser(self) -> Option<Level> {
        match self {
            Level::Full => Some(Level::WithoutElo),
            Level::WithoutElo => Some(Level::OverWickets),
            Level::OverWickets => Some(Level::Phase),
            Level::Phase => Some(Level::Innings),
            Level::Innings => None,
        }
    }
}

// ── Keys ─────────────────────────────────────────────────────────────────────

/// A bucket identity at one level. Fields dropped at that level are `None`.
/// `phase` is a function of `over`, so carrying it at levels 1-3 never splits
/// a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BucketKey {
    pub level: Level,
    pub innings: u8,
    pub over: Option<&'static str>,
    pub phase: Option<&'static str>,
    pub wickets: Option<&'static str>,
    pub run_rate: Option<&'static str>,
    pub elo: Option<&'static str>,
}

impl BucketKey {
    /// The Level-1 key for a row.
    pub fn finest(row: &MatchStateRow) -> Self {
        let over = row.over as f64;
        let run_rate = match row.chase_pressure() {
            Some(pressure) => CHASE_PRESSURE_BINS.label(pressure),
            None => FIRST_INNINGS,
        };
        let elo = row
            .elo_diff
            .map(|d| ELO_DIFF_BINS.label(d))
            .unwrap_or(ELO_UNKNOWN);

        BucketKey {
            level: Level::Full,
            innings: row.innings,
            over: Some(OVER_BINS.label(over)),
            phase: Some(OVER_PHASES.label(over)),
            wickets: Some(WICKET_BINS.label(row.wickets as f64)),
            run_rate: Some(run_rate),
            elo: Some(elo),
        }
    }

    /// Drop the next discriminating feature. `None` at Level 5.
    pub fn coarser(&self) -> Option<BucketKey> {
        let level = self.level.coarser()?;
        let mut key = self.clone();
        key.level = level;
        match level {
            Level::WithoutElo => key.elo = None,
            Level::OverWickets => key.run_rate = None,
            Level::Phase => {
                key.over = None;
                key.wickets = None;
            }
            Level::Innings => key.phase = None,
            Level::Full => unreachable!("Full is never a coarsening"),
        }
        Some(key)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inn={}", self.innings)?;
        let parts = [
            ("over", self.over),
            ("phase", self.phase),
            ("wkts", self.wickets),
            ("rr", self.run_rate),
            ("elo", self.elo),
        ];
        for (name, value) in parts {
            if let Some(v) = value {
                write!(f, "|{}={}", name, v)?;
            }
        }
        Ok(())
    }
}

/// The row's five keys, finest to coarsest.
pub fn build_keys(row: &MatchStateRow) -> [BucketKey; 5] {
    let l1 = BucketKey::finest(row);
    let l2 = step(&l1);
    let l3 = step(&l2);
    let l4 = step(&l3);
    let l5 = step(&l4);
    [l1, l2, l3, l4, l5]
}

fn step(key: &BucketKey) -> BucketKey {
    key.coarser()
        .unwrap_or_else(|| unreachable!("level {:?} has a coarser level", key.level))
}
