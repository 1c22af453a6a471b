use std::collections::BTreeMap;

use serde::Serialize;

use super::buckets::{build_keys, BucketKey};
use super::error::ModelError;
use super::rows::MatchStateRow;

/// Buckets below this many samples are flagged unstable in the audit.
pub const UNSTABLE_BELOW: u64 = 30;
/// Buckets at or above this many samples are flagged stable in the audit.
pub const STABLE_FROM: u64 = 50;

/// z-score for a two-sided 95% interval.
const Z_95: f64 = 1.96;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub count: u64,
    pub wins: u64,
}

impl BucketStats {
    fn record(&mut self, won: bool) {
        self.count += 1;
        if won {
            self.wins += 1;
        }
    }

    /// `wins / count`; undefined for an empty bucket.
    pub fn win_rate(&self) -> Option<f64> {
        (self.count > 0).then(|| self.wins as f64 / self.count as f64)
    }

    /// Binomial standard error of the win rate.
    pub fn standard_error(&self) -> Option<f64> {
        let p = self.win_rate()?;
        Some((p * (1.0 - p) / self.count as f64).sqrt())
    }

    /// Normal-approximation 95% interval, bounded to [0, 1].
    pub fn confidence_interval_95(&self) -> Option<(f64, f64)> {
        let p = self.win_rate()?;
        let se = self.standard_error()?;
        Some(((p - Z_95 * se).max(0.0), (p + Z_95 * se).min(1.0)))
    }

    pub fn stability(&self) -> Stability {
        if self.count < UNSTABLE_BELOW {
            Stability::Unstable
        } else if self.count < STABLE_FROM {
            Stability::Moderate
        } else {
            Stability::Stable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Unstable,
    Moderate,
    Stable,
}

impl Stability {
    pub fn as_str(self) -> &'static str {
        match self {
            Stability::Unstable => "unstable",
            Stability::Moderate => "moderate",
            Stability::Stable => "stable",
        }
    }
}

/// Win/count aggregates for every (level, key) seen in one training set.
///
/// Built in one shot and never mutated afterwards; each backtest window owns
/// a fresh store, so shared references can be read from any thread.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BucketStore {
    buckets: BTreeMap<BucketKey, BucketStats>,
    innings_totals: BTreeMap<u8, BucketStats>,
    rows: usize,
}

impl BucketStore {
    pub fn build<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a MatchStateRow>,
    {
        let mut store = BucketStore::default();
        for row in rows {
            for key in build_keys(row) {
                store.buckets.entry(key).or_default().record(row.team_won);
            }
            store
                .innings_totals
                .entry(row.innings)
                .or_default()
                .record(row.team_won);
            store.rows += 1;
        }
        store
    }

    /// Stats for a key. Empty buckets are reported as absent.
    pub fn lookup(&self, key: &BucketKey) -> Option<&BucketStats> {
        self.buckets.get(key).filter(|s| s.count > 0)
    }

    /// Overall record for one innings across every training row.
    pub fn innings_prior(&self, innings: u8) -> Result<BucketStats, ModelError> {
        self.innings_totals
            .get(&innings)
            .copied()
            .filter(|s| s.count > 0)
            .ok_or(ModelError::NoTrainingData { innings })
    }

    pub fn has_innings(&self, innings: u8) -> bool {
        self.innings_prior(innings).is_ok()
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// All buckets ordered by level, then key.
    pub fn iter(&self) -> impl Iterator<Item = (&BucketKey, &BucketStats)> {
        self.buckets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::buckets::Level;
    use crate::model::rows::tests::row;
    use approx::assert_relative_eq;

    fn sample_rows() -> Vec<MatchStateRow> {
        let mut rows = Vec::new();
        for i in 0..40 {
            rows.push(row("2018-03-01", 1, 3, 1, i % 3 == 0));
            rows.push(row("2018-03-01", 2, 18, 7, i % 4 == 0));
        }
        rows
    }

    #[test]
    fn every_level_counts_every_row() {
        let rows = sample_rows();
        let store = BucketStore::build(&rows);
        assert_eq!(store.row_count(), rows.len());
        for level in Level::ALL {
            let total: u64 = store
                .iter()
                .filter(|(k, _)| k.level == level)
                .map(|(_, s)| s.count)
                .sum();
            assert_eq!(total, rows.len() as u64, "level {:?}", level);
        }
    }

    #[test]
    fn wins_never_exceed_count() {
        let store = BucketStore::build(&sample_rows());
        for (_, s) in store.iter() {
            assert!(s.wins <= s.count);
            let p = s.win_rate().unwrap();
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn innings_prior_matches_level_five() {
        let rows = sample_rows();
        let store = BucketStore::build(&rows);
        let keys = build_keys(&rows[1]);
        let l5 = store.lookup(&keys[4]).copied().unwrap();
        assert_eq!(store.innings_prior(2).unwrap(), l5);
        assert_eq!(l5.wins, 10);
    }

    #[test]
    fn missing_innings_has_no_prior() {
        let rows: Vec<_> = sample_rows().into_iter().filter(|r| r.innings == 1).collect();
        let store = BucketStore::build(&rows);
        assert_eq!(
            store.innings_prior(2),
            Err(ModelError::NoTrainingData { innings: 2 })
        );
        assert!(!store.has_innings(2));
    }

    #[test]
    fn build_is_idempotent() {
        let rows = sample_rows();
        assert_eq!(BucketStore::build(&rows), BucketStore::build(&rows));
    }

    #[test]
    fn empty_build_has_no_buckets() {
        let store = BucketStore::build(&Vec::<MatchStateRow>::new());
        assert!(store.is_empty());
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn stability_audit_fields() {
        let s = BucketStats { count: 100, wins: 60 };
        assert_relative_eq!(s.standard_error().unwrap(), (0.24f64 / 100.0).sqrt(), epsilon = 1e-12);
        let (lo, hi) = s.confidence_interval_95().unwrap();
        assert!(lo < 0.6 && hi > 0.6);
        assert_eq!(s.stability(), Stability::Stable);
        assert_eq!(BucketStats { count: 29, wins: 1 }.stability(), Stability::Unstable);
        assert_eq!(BucketStats { count: 30, wins: 1 }.stability(), Stability::Moderate);

        let empty = BucketStats::default();
        assert_eq!(empty.win_rate(), None);
        assert_eq!(empty.confidence_interval_95(), None);
    }

    #[test]
    fn interval_stays_inside_unit_range() {
        let s = BucketStats { count: 5, wins: 5 };
        let (lo, hi) = s.confidence_interval_95().unwrap();
        assert!(lo >= 0.0 && hi <= 1.0);
    }
}
