//! Result persistence and the aggregates computed over it.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::types::{CategoryKey, Distribution, DistributionMode, PhotoResult, ValueStats};

/// One stored photo result with its free-form analysis log.
#[derive(Debug, Clone)]
pub struct PhotoRecord {
    pub result: PhotoResult,
    pub analysis_log: String,
}

/// Where photo results are kept between jobs.
///
/// Appends come from several workers at once; implementations synchronize
/// internally.
pub trait ResultStore: Send + Sync {
    fn append(&self, record: PhotoRecord);

    /// All results in insertion order.
    fn list(&self) -> Vec<PhotoResult>;

    fn get(&self, id: &str) -> Option<PhotoRecord>;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<PhotoRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryStore {
    fn append(&self, record: PhotoRecord) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    fn list(&self) -> Vec<PhotoResult> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.result.clone())
            .collect()
    }

    fn get(&self, id: &str) -> Option<PhotoRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.result.id == id)
            .cloned()
    }

    fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn round4(v: f32) -> f32 {
    (v * 10_000.0).round() / 10_000.0
}

fn to_distribution(mode: DistributionMode, values: [f32; CategoryKey::COUNT]) -> Distribution {
    let by_category: BTreeMap<CategoryKey, f32> = CategoryKey::ALL
        .into_iter()
        .map(|k| (k, round4(values[k.index()])))
        .collect();
    Distribution { mode, by_category }
}

/// Per-category aggregate over stored results.
///
/// `AvgScore` averages each category's score; `CountRatio` is the share of
/// results whose derived category it is. Items that failed before scoring
/// are left out; no scored results gives all zeros.
pub fn distribution_from_results(results: &[PhotoResult], mode: DistributionMode) -> Distribution {
    let scored: Vec<&PhotoResult> = results.iter().filter(|r| !r.scores.is_unscored()).collect();
    if scored.is_empty() {
        return Distribution::empty(mode);
    }
    let total = scored.len() as f32;
    let mut sums = [0.0f32; CategoryKey::COUNT];
    for result in scored {
        match mode {
            DistributionMode::AvgScore => {
                for (key, score) in result.scores.iter() {
                    sums[key.index()] += score;
                }
            }
            DistributionMode::CountRatio => sums[result.category.index()] += 1.0,
        }
    }
    to_distribution(mode, sums.map(|s| s / total))
}

/// Share of exported files per category, used for both modes.
pub fn distribution_from_counts(
    counts: &[usize; CategoryKey::COUNT],
    mode: DistributionMode,
) -> Distribution {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return Distribution::empty(mode);
    }
    to_distribution(mode, counts.map(|c| c as f32 / total as f32))
}

/// Count valuable, not valuable and unjudged results.
pub fn value_stats(results: &[PhotoResult]) -> ValueStats {
    let mut stats = ValueStats::default();
    for result in results {
        match result.is_valuable {
            Some(true) => stats.valuable += 1,
            Some(false) => stats.not_valuable += 1,
            None => stats.unknown += 1,
        }
    }
    stats
}
