//! Core data types shared by the pipeline, the job manager and callers.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// The fixed set of categories a photo is sorted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKey {
    ScreenshotDocument,
    People,
    FoodCafe,
    NatureLandscape,
    CityStreetTravel,
    PetsAnimals,
    ProductsObjects,
    Other,
}

impl CategoryKey {
    /// Number of categories.
    pub const COUNT: usize = 8;

    /// All categories in enumeration order. Ties are broken by this order.
    pub const ALL: [CategoryKey; Self::COUNT] = [
        CategoryKey::ScreenshotDocument,
        CategoryKey::People,
        CategoryKey::FoodCafe,
        CategoryKey::NatureLandscape,
        CategoryKey::CityStreetTravel,
        CategoryKey::PetsAnimals,
        CategoryKey::ProductsObjects,
        CategoryKey::Other,
    ];

    /// Stable snake_case key, also used as the export directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryKey::ScreenshotDocument => "screenshot_document",
            CategoryKey::People => "people",
            CategoryKey::FoodCafe => "food_cafe",
            CategoryKey::NatureLandscape => "nature_landscape",
            CategoryKey::CityStreetTravel => "city_street_travel",
            CategoryKey::PetsAnimals => "pets_animals",
            CategoryKey::ProductsObjects => "products_objects",
            CategoryKey::Other => "other",
        }
    }

    /// Position in [`CategoryKey::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Parse a key, returning `None` for anything outside the closed set.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    /// Parse a key from an untrusted source, mapping unknown values to `Other`.
    pub fn parse_or_other(s: &str) -> Self {
        Self::parse(s).unwrap_or(CategoryKey::Other)
    }
}

impl fmt::Display for CategoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category probabilities. Values are non-negative and sum to 1,
/// except for the all-zero [`ScoreVector::unscored`] vector carried by items
/// that failed before scoring.
///
/// Serialized as a map keyed by category in enumeration order. Deserializing
/// drops unknown keys, fills missing ones with 0 and renormalizes.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "HashMap<String, f32>")]
pub struct ScoreVector([f32; CategoryKey::COUNT]);

impl ScoreVector {
    /// Build from softmax output in enumeration order.
    ///
    /// Missing trailing entries are treated as 0; the result is renormalized.
    pub fn from_probs(probs: &[f32]) -> Self {
        let mut values = [0.0f32; CategoryKey::COUNT];
        for (slot, p) in values.iter_mut().zip(probs) {
            *slot = *p;
        }
        Self(values).normalized()
    }

    /// All zeros: the item never reached the scorer.
    pub const fn unscored() -> Self {
        Self([0.0; CategoryKey::COUNT])
    }

    pub fn is_unscored(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }

    /// All mass on a single category.
    pub fn one_hot(key: CategoryKey) -> Self {
        let mut values = [0.0f32; CategoryKey::COUNT];
        values[key.index()] = 1.0;
        Self(values)
    }

    /// Build from a loosely-typed map, dropping keys outside the category set.
    pub fn from_map(map: &HashMap<String, f32>) -> Self {
        let mut values = [0.0f32; CategoryKey::COUNT];
        for (k, v) in map {
            if let Some(key) = CategoryKey::parse(k) {
                values[key.index()] = *v;
            }
        }
        Self(values).normalized()
    }

    /// Score for one category.
    pub fn get(&self, key: CategoryKey) -> f32 {
        self.0[key.index()]
    }

    /// Iterate `(category, score)` in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = (CategoryKey, f32)> + '_ {
        CategoryKey::ALL.iter().map(move |k| (*k, self.0[k.index()]))
    }

    /// Raw values in enumeration order.
    pub fn as_array(&self) -> &[f32; CategoryKey::COUNT] {
        &self.0
    }

    /// Sum of all scores.
    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }

    /// Arg-max with first-in-enumeration-order tie-break.
    pub fn top(&self) -> (CategoryKey, f32) {
        let mut best = (CategoryKey::ALL[0], self.0[0]);
        for (key, value) in self.iter().skip(1) {
            if value > best.1 {
                best = (key, value);
            }
        }
        best
    }

    /// Clamp negatives and non-finite values to 0 and rescale to sum 1.
    ///
    /// An all-zero vector stays all-zero.
    pub fn normalized(mut self) -> Self {
        for v in self.0.iter_mut() {
            if !v.is_finite() || *v < 0.0 {
                *v = 0.0;
            }
        }
        let sum = self.sum();
        if sum > 0.0 {
            for v in self.0.iter_mut() {
                *v /= sum;
            }
        }
        self
    }
}

impl Default for ScoreVector {
    fn default() -> Self {
        Self::unscored()
    }
}

impl From<HashMap<String, f32>> for ScoreVector {
    fn from(map: HashMap<String, f32>) -> Self {
        Self::from_map(&map)
    }
}

impl Serialize for ScoreVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(CategoryKey::COUNT))?;
        for (key, value) in self.iter() {
            map.serialize_entry(key.as_str(), &value)?;
        }
        map.end()
    }
}

/// Outcome of routing a photo into the export tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Success,
    Error,
}

/// Result of analyzing one image. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoResult {
    /// Unique record id
    pub id: String,

    /// Exported path on success, source path otherwise
    pub path: String,

    /// Source file name
    pub file_name: String,

    /// Derived category (arg-max of `scores`)
    pub category: CategoryKey,

    /// Score of the derived category
    pub top_score: f32,

    /// Per-category probabilities; all zero when the item failed before scoring
    pub scores: ScoreVector,

    pub export_status: ExportStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Wall time spent on this item
    pub duration_ms: u64,

    /// Engine/model that produced the verdict
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_valuable: Option<bool>,

    /// Keep probability in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valuable_score: Option<f32>,
}

/// A photo result plus its analysis log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoDetail {
    #[serde(flatten)]
    pub result: PhotoResult,

    pub analysis_log: String,
}

/// Aggregate keep/drop counts over recorded results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueStats {
    pub valuable: usize,
    pub not_valuable: usize,
    pub unknown: usize,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Canceled,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Canceled => "canceled",
            JobStatus::Error => "error",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Canceled | JobStatus::Error
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time progress of the live job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub processed: usize,
    pub total: usize,
    pub errors: usize,

    /// Name of the most recently completed file (best effort)
    pub current_file: Option<String>,
}

/// How `get_distribution` aggregates results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMode {
    /// Mean score per category across results
    AvgScore,
    /// Share of results whose derived category is each key
    CountRatio,
}

impl DistributionMode {
    /// Parse `avg_score` / `count_ratio` (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "avg_score" => Some(Self::AvgScore),
            "count_ratio" => Some(Self::CountRatio),
            _ => None,
        }
    }
}

/// Per-category aggregate, values rounded to 4 decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub mode: DistributionMode,
    pub by_category: BTreeMap<CategoryKey, f32>,
}

impl Distribution {
    /// A distribution with every category at 0.
    pub fn empty(mode: DistributionMode) -> Self {
        Self {
            mode,
            by_category: CategoryKey::ALL.iter().map(|k| (*k, 0.0)).collect(),
        }
    }
}

/// Partial text from a streaming remote model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub job_id: String,
    pub file_name: String,
    pub delta: String,
    pub done: bool,
    #[serde(default)]
    pub reset: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse_closed_set() {
        assert_eq!(CategoryKey::parse("people"), Some(CategoryKey::People));
        assert_eq!(
            CategoryKey::parse(" Food_Cafe "),
            Some(CategoryKey::FoodCafe)
        );
        assert_eq!(CategoryKey::parse("vehicles"), None);
        assert_eq!(CategoryKey::parse_or_other("vehicles"), CategoryKey::Other);
    }

    #[test]
    fn test_category_index_matches_all() {
        for (i, key) in CategoryKey::ALL.iter().enumerate() {
            assert_eq!(key.index(), i);
        }
    }

    #[test]
    fn test_score_vector_top_first_tie_wins() {
        let scores = ScoreVector::from_probs(&[0.0, 0.4, 0.0, 0.4, 0.2, 0.0, 0.0, 0.0]);
        assert_eq!(scores.top().0, CategoryKey::People);
    }

    #[test]
    fn test_score_vector_uniform_tie_picks_first() {
        let scores = ScoreVector::from_probs(&[0.125; 8]);
        assert_eq!(scores.top().0, CategoryKey::ScreenshotDocument);
    }

    #[test]
    fn test_score_vector_from_map_drops_unknown_keys() {
        let map = HashMap::from([
            ("people".to_string(), 2.0),
            ("other".to_string(), 2.0),
            ("vehicles".to_string(), 10.0),
        ]);
        let scores = ScoreVector::from_map(&map);
        assert!((scores.sum() - 1.0).abs() < 1e-6);
        assert!((scores.get(CategoryKey::People) - 0.5).abs() < 1e-6);
        assert!((scores.get(CategoryKey::Other) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_score_vector_normalized_clamps_negatives() {
        let scores = ScoreVector::from_probs(&[-1.0, 1.0, f32::NAN, 1.0]);
        assert_eq!(scores.get(CategoryKey::ScreenshotDocument), 0.0);
        assert_eq!(scores.get(CategoryKey::FoodCafe), 0.0);
        assert!((scores.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_vector_serializes_as_keyed_map() {
        let json = serde_json::to_string(&ScoreVector::one_hot(CategoryKey::PetsAnimals)).unwrap();
        assert!(json.starts_with("{\"screenshot_document\":0.0"));
        assert!(json.contains("\"pets_animals\":1.0"));

        let back: ScoreVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back.top().0, CategoryKey::PetsAnimals);
    }

    #[test]
    fn test_photo_detail_flattens_result() {
        let detail = PhotoDetail {
            result: PhotoResult {
                id: "1".into(),
                path: "/out/people/a.jpg".into(),
                file_name: "a.jpg".into(),
                category: CategoryKey::People,
                top_score: 0.9,
                scores: ScoreVector::one_hot(CategoryKey::People),
                export_status: ExportStatus::Success,
                error_message: None,
                duration_ms: 12,
                model: None,
                is_valuable: None,
                valuable_score: None,
            },
            analysis_log: "engine: clip".into(),
        };
        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["fileName"], "a.jpg");
        assert_eq!(value["exportStatus"], "success");
        assert_eq!(value["analysisLog"], "engine: clip");
    }

    #[test]
    fn test_distribution_mode_parse() {
        assert_eq!(
            DistributionMode::parse("avg_score"),
            Some(DistributionMode::AvgScore)
        );
        assert_eq!(
            DistributionMode::parse("COUNT_RATIO"),
            Some(DistributionMode::CountRatio)
        );
        assert_eq!(DistributionMode::parse("median"), None);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Idle.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }
}
