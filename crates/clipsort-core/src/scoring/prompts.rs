//! Fixed prompt texts and their cached embeddings.

use ndarray::Array2;

use crate::embedding::ClipSession;
use crate::error::{PipelineError, PipelineResult};
use crate::math::{l2_normalize, mean_vector};
use crate::types::CategoryKey;

/// Prompts describing each category, in enumeration order.
pub const CATEGORY_PROMPTS: [(CategoryKey, [&str; 3]); CategoryKey::COUNT] = [
    (
        CategoryKey::ScreenshotDocument,
        [
            "a screenshot of a document",
            "a screenshot with text and UI",
            "a photographed document or paper",
        ],
    ),
    (
        CategoryKey::People,
        [
            "a photo of people",
            "a portrait of a person",
            "people in a social scene",
        ],
    ),
    (
        CategoryKey::FoodCafe,
        [
            "a photo of food",
            "a cafe or restaurant scene",
            "a drink or dessert on a table",
        ],
    ),
    (
        CategoryKey::NatureLandscape,
        [
            "a nature landscape photo",
            "mountains, forest, ocean, or sky",
            "a scenic outdoor view",
        ],
    ),
    (
        CategoryKey::CityStreetTravel,
        [
            "a city street photo",
            "a travel landmark or tourist place",
            "buildings and urban scenery",
        ],
    ),
    (
        CategoryKey::PetsAnimals,
        [
            "a photo of an animal",
            "a pet dog or cat",
            "wildlife or animals outdoors",
        ],
    ),
    (
        CategoryKey::ProductsObjects,
        [
            "a photo of an object or product",
            "an item on a table",
            "a close-up of a thing",
        ],
    ),
    (
        CategoryKey::Other,
        [
            "a miscellaneous photo",
            "an abstract or unclear scene",
            "something else",
        ],
    ),
];

pub const KEEP_PROMPTS: [&str; 4] = [
    "a valuable personal photo worth keeping",
    "a meaningful photo to keep in a personal album",
    "a high quality photo worth saving",
    "an important screenshot to keep",
];

pub const DROP_PROMPTS: [&str; 4] = [
    "a low quality photo not worth keeping",
    "a blurry or accidental photo",
    "a duplicate or unimportant screenshot",
    "a meaningless image to delete",
];

/// Text embeddings for the categories and the keep/drop pair.
///
/// Built once per engine and never mutated, so workers share it through an
/// `Arc` without locking.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    /// One L2-normalized row per category, in enumeration order
    categories: Array2<f32>,
    keep: Vec<f32>,
    drop: Vec<f32>,
}

impl PromptEmbeddings {
    /// Embed every prompt in one batch and average each group.
    pub fn compute(session: &mut dyn ClipSession) -> PipelineResult<Self> {
        let mut prompts: Vec<&str> = Vec::with_capacity(3 * CategoryKey::COUNT + 8);
        for (_, texts) in &CATEGORY_PROMPTS {
            prompts.extend_from_slice(texts);
        }
        prompts.extend_from_slice(&KEEP_PROMPTS);
        prompts.extend_from_slice(&DROP_PROMPTS);

        let embeddings = session.embed_texts(&prompts)?;
        if embeddings.len() != prompts.len() {
            return Err(PipelineError::Embedding {
                message: format!(
                    "expected {} prompt embeddings, got {}",
                    prompts.len(),
                    embeddings.len()
                ),
            });
        }

        let mut groups = embeddings.chunks(3);
        let mut categories = Vec::with_capacity(CategoryKey::COUNT);
        for _ in 0..CategoryKey::COUNT {
            let group = groups.next().unwrap_or(&[]);
            categories.push(averaged(group)?);
        }
        let tail = &embeddings[3 * CategoryKey::COUNT..];
        let keep = averaged(&tail[..KEEP_PROMPTS.len()])?;
        let drop = averaged(&tail[KEEP_PROMPTS.len()..])?;

        tracing::debug!(dim = keep.len(), "Prompt embeddings computed");
        Self::from_parts(categories, keep, drop)
    }

    /// Assemble from precomputed, normalized vectors of equal length.
    pub fn from_parts(
        categories: Vec<Vec<f32>>,
        keep: Vec<f32>,
        drop: Vec<f32>,
    ) -> PipelineResult<Self> {
        let dim = keep.len();
        if categories.len() != CategoryKey::COUNT
            || dim == 0
            || drop.len() != dim
            || categories.iter().any(|c| c.len() != dim)
        {
            return Err(PipelineError::Embedding {
                message: "prompt embeddings have inconsistent shapes".to_string(),
            });
        }
        let flat: Vec<f32> = categories.into_iter().flatten().collect();
        let categories = Array2::from_shape_vec((CategoryKey::COUNT, dim), flat).map_err(|e| {
            PipelineError::Embedding {
                message: format!("prompt matrix: {e}"),
            }
        })?;
        Ok(Self {
            categories,
            keep,
            drop,
        })
    }

    pub fn dim(&self) -> usize {
        self.keep.len()
    }

    /// `COUNT × dim` matrix of category embeddings.
    pub fn categories(&self) -> &Array2<f32> {
        &self.categories
    }

    pub fn keep_embedding(&self) -> &[f32] {
        &self.keep
    }

    pub fn drop_embedding(&self) -> &[f32] {
        &self.drop
    }
}

fn averaged(group: &[Vec<f32>]) -> PipelineResult<Vec<f32>> {
    mean_vector(group)
        .map(|mean| l2_normalize(&mean))
        .ok_or_else(|| PipelineError::Embedding {
            message: "empty prompt group".to_string(),
        })
}
