//! Hierarchical stabilization: pick the finest bucket with enough support.
//!
//! The walk is an explicit ordered pass over precomputed keys (Level 1 to
//! Level 5). No level is skipped even if a coarser one has more samples. If
//! nothing meets the threshold the innings-wide prior is used and the estimate
//! is tagged [`Resolution::Global`].

use std::fmt;

use serde::{Serialize, Serializer};

use super::buckets::{build_keys, BucketKey, Level};
use super::error::ModelError;
use super::rows::MatchStateRow;
use super::store::{BucketStats, BucketStore, Stability};

pub const DEFAULT_MIN_SAMPLES: u64 = 50;

/// Where an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    Bucket(Level),
    /// No bucket met the threshold; innings-wide prior.
    Global,
}

impl Resolution {
    /// 0..=4 for levels 1..=5, 5 for the global prior.
    pub fn index(self) -> usize {
        match self {
            Resolution::Bucket(level) => level.number() as usize - 1,
            Resolution::Global => 5,
        }
    }

    #[cfg(test)]
    pub fn is_global(self) -> bool {
        matches!(self, Resolution::Global)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Bucket(level) => write!(f, "{}", level.number()),
            Resolution::Global => f.write_str("global"),
        }
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StabilizedEstimate {
    pub resolution: Resolution,
    pub count: u64,
    pub wins: u64,
    /// Always within [0, 1].
    pub probability: f64,
}

impl StabilizedEstimate {
    fn from_stats(resolution: Resolution, stats: BucketStats) -> Self {
        let probability = stats.wins as f64 / stats.count as f64;
        debug_assert!((0.0..=1.0).contains(&probability));
        StabilizedEstimate {
            resolution,
            count: stats.count,
            wins: stats.wins,
            probability,
        }
    }
}

/// Win probability for a row from a finished store.
pub fn estimate(
    store: &BucketStore,
    row: &MatchStateRow,
    min_samples: u64,
) -> Result<StabilizedEstimate, ModelError> {
    let keys = build_keys(row);
    walk(store, &keys, row.innings, min_samples)
}

/// Same walk, starting from an arbitrary key instead of a row's Level-1 key.
pub fn estimate_from_key(
    store: &BucketStore,
    key: &BucketKey,
    min_samples: u64,
) -> Result<StabilizedEstimate, ModelError> {
    let chain: Vec<BucketKey> =
        std::iter::successors(Some(key.clone()), |k| k.coarser()).collect();
    walk(store, &chain, key.innings, min_samples)
}

fn walk(
    store: &BucketStore,
    chain: &[BucketKey],
    innings: u8,
    min_samples: u64,
) -> Result<StabilizedEstimate, ModelError> {
    for key in chain {
        if let Some(stats) = store.lookup(key) {
            if stats.count >= min_samples {
                return Ok(StabilizedEstimate::from_stats(
                    Resolution::Bucket(key.level),
                    *stats,
                ));
            }
        }
    }
    let prior = store.innings_prior(innings)?;
    Ok(StabilizedEstimate::from_stats(Resolution::Global, prior))
}

// ── Resolution counts ────────────────────────────────────────────────────────

/// How many estimates resolved at each level, plus the global prior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionCounts([usize; 6]);

impl ResolutionCounts {
    pub fn record(&mut self, resolution: Resolution) {
        self.0[resolution.index()] += 1;
    }

    pub fn get(&self, resolution: Resolution) -> usize {
        self.0[resolution.index()]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    pub fn merge(&mut self, other: &ResolutionCounts) {
        for (a, b) in self.0.iter_mut().zip(other.0) {
            *a += b;
        }
    }
}

impl Serialize for ResolutionCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(6))?;
        for level in Level::ALL {
            let r = Resolution::Bucket(level);
            map.serialize_entry(&format!("level_{}", level.number()), &self.get(r))?;
        }
        map.serialize_entry("global", &self.get(Resolution::Global))?;
        map.end()
    }
}

// ── Stabilized model table ───────────────────────────────────────────────────

/// One row of the stabilized model table.
#[derive(Debug, Clone, Serialize)]
pub struct StabilizedBucket {
    pub key: BucketKey,
    pub count: u64,
    pub wins: u64,
    pub win_rate: f64,
    pub standard_error: f64,
    pub ci_lower_95: f64,
    pub ci_upper_95: f64,
    pub stability: Stability,
    /// Probability served for this bucket after walking to coarser levels.
    pub stabilized_probability: f64,
    pub resolved_at: Resolution,
}

#[derive(Debug, Clone, Serialize)]
pub struct StabilizedModel {
    pub buckets: Vec<StabilizedBucket>,
    /// Where each Level-1 bucket ends up resolving.
    pub level1_fallbacks: ResolutionCounts,
    pub min_samples: u64,
}

/// Every non-empty (level, key) in the store with its audit fields and
/// stabilized probability.
pub fn stabilized_model(
    store: &BucketStore,
    min_samples: u64,
) -> Result<StabilizedModel, ModelError> {
    let mut buckets = Vec::with_capacity(store.len());
    let mut level1_fallbacks = ResolutionCounts::default();

    for (key, stats) in store.iter() {
        let (Some(win_rate), Some(se), Some((lo, hi))) = (
            stats.win_rate(),
            stats.standard_error(),
            stats.confidence_interval_95(),
        ) else {
            continue;
        };
        let resolved = estimate_from_key(store, key, min_samples)?;
        if key.level == Level::Full {
            level1_fallbacks.record(resolved.resolution);
        }
        buckets.push(StabilizedBucket {
            key: key.clone(),
            count: stats.count,
            wins: stats.wins,
            win_rate,
            standard_error: se,
            ci_lower_95: lo,
            ci_upper_95: hi,
            stability: stats.stability(),
            stabilized_probability: resolved.probability,
            resolved_at: resolved.resolution,
        });
    }

    Ok(StabilizedModel {
        buckets,
        level1_fallbacks,
        min_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::rows::tests::row;
    use approx::assert_relative_eq;

    /// `n` copies of a row, the first `wins` of which won.
    fn repeat(base: &MatchStateRow, n: usize, wins: usize) -> Vec<MatchStateRow> {
        (0..n)
            .map(|i| MatchStateRow {
                team_won: i < wins,
                ..base.clone()
            })
            .collect()
    }

    fn base() -> MatchStateRow {
        row("2019-05-05", 2, 12, 4, true)
    }

    #[test]
    fn dense_level_one_bucket_resolves_at_level_one() {
        let rows = repeat(&base(), 100, 60);
        let store = BucketStore::build(&rows);
        let est = estimate(&store, &base(), DEFAULT_MIN_SAMPLES).unwrap();
        assert_eq!(est.resolution, Resolution::Bucket(Level::Full));
        assert_eq!((est.count, est.wins), (100, 60));
        assert_relative_eq!(est.probability, 0.60, epsilon = 1e-12);
    }

    #[test]
    fn sparse_level_one_falls_back_to_level_two() {
        let mut rows = repeat(&base(), 30, 15);
        // Same Level-2 bucket, different Elo bucket.
        let mut other = base();
        other.elo_diff = Some(200.0);
        rows.extend(repeat(&other, 50, 29));

        let store = BucketStore::build(&rows);
        let est = estimate(&store, &base(), DEFAULT_MIN_SAMPLES).unwrap();
        assert_eq!(est.resolution, Resolution::Bucket(Level::WithoutElo));
        assert_eq!((est.count, est.wins), (80, 44));
        assert_relative_eq!(est.probability, 0.55, epsilon = 1e-12);
    }

    #[test]
    fn unseen_key_walks_to_first_supported_level() {
        // Only powerplay data; query a death-overs state.
        let rows = repeat(&row("2019-05-05", 2, 2, 0, true), 60, 30);
        let store = BucketStore::build(&rows);
        let query = row("2019-05-05", 2, 19, 8, false);
        let est = estimate(&store, &query, DEFAULT_MIN_SAMPLES).unwrap();
        assert_eq!(est.resolution, Resolution::Bucket(Level::Innings));
        assert_relative_eq!(est.probability, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn nothing_supported_uses_global_prior() {
        let rows = repeat(&base(), 10, 7);
        let store = BucketStore::build(&rows);
        let est = estimate(&store, &base(), DEFAULT_MIN_SAMPLES).unwrap();
        assert!(est.resolution.is_global());
        assert_relative_eq!(est.probability, 0.7, epsilon = 1e-12);
    }

    #[test]
    fn unseen_innings_is_an_error() {
        let rows = repeat(&row("2019-05-05", 1, 5, 1, true), 100, 50);
        let store = BucketStore::build(&rows);
        assert_eq!(
            estimate(&store, &base(), DEFAULT_MIN_SAMPLES),
            Err(ModelError::NoTrainingData { innings: 2 })
        );
    }

    #[test]
    fn sparser_data_never_resolves_finer() {
        let dense = repeat(&base(), 200, 120);
        let mut last = 0usize;
        for n in [200usize, 120, 60, 49, 20, 5] {
            let store = BucketStore::build(&dense[..n]);
            let est = estimate(&store, &base(), DEFAULT_MIN_SAMPLES).unwrap();
            assert!(est.resolution.index() >= last, "n={} resolved finer", n);
            assert!((0.0..=1.0).contains(&est.probability));
            last = est.resolution.index();
        }
    }

    #[test]
    fn stabilized_model_reports_every_bucket() {
        let mut rows = repeat(&base(), 30, 15);
        let mut other = base();
        other.elo_diff = Some(200.0);
        rows.extend(repeat(&other, 50, 29));
        let store = BucketStore::build(&rows);

        let model = stabilized_model(&store, DEFAULT_MIN_SAMPLES).unwrap();
        assert_eq!(model.buckets.len(), store.len());
        assert_eq!(model.level1_fallbacks.total(), 2);
        assert_eq!(
            model.level1_fallbacks.get(Resolution::Bucket(Level::Full)),
            1
        );
        assert_eq!(
            model.level1_fallbacks.get(Resolution::Bucket(Level::WithoutElo)),
            1
        );
        let sparse = model
            .buckets
            .iter()
            .find(|b| b.key.level == Level::Full && b.count == 30)
            .unwrap();
        assert_eq!(sparse.stability, Stability::Moderate);
        assert_relative_eq!(sparse.stabilized_probability, 0.55, epsilon = 1e-12);
    }

    #[test]
    fn resolution_serializes_as_label() {
        let json = serde_json::to_string(&Resolution::Bucket(Level::Phase)).unwrap();
        assert_eq!(json, "\"4\"");
        let json = serde_json::to_string(&Resolution::Global).unwrap();
        assert_eq!(json, "\"global\"");
    }
}
