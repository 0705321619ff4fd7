//! Embedding → category scores and keep/drop judgment.
//!
//! Both image and prompt embeddings are L2-normalized, so a dot product is the
//! cosine similarity. Similarities are multiplied by CLIP's logit scale and
//! softmax-normalized: across the 8 categories for the category scores, and
//! across the keep/drop pair for the value judgment.

pub mod prompts;

use std::path::Path;
use std::sync::Arc;

use ndarray::ArrayView1;

use crate::embedding::preprocess::preprocess_bytes;
use crate::embedding::ClipSession;
use crate::error::{PipelineError, PipelineResult};
use crate::math::{cosine_similarity, softmax};
use crate::types::{CategoryKey, ScoreVector};

pub use prompts::PromptEmbeddings;

/// CLIP's learned logit scale (exp of the trained temperature, capped at 100).
pub const LOGIT_SCALE: f32 = 100.0;

/// `keep_prob` at or above this marks a photo valuable.
pub const KEEP_THRESHOLD: f32 = 0.5;

/// Keep/drop outcome for one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueJudgment {
    pub keep_prob: f32,
    pub is_valuable: bool,
}

/// Scoring result for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub scores: ScoreVector,
    pub category: CategoryKey,
    pub top_score: f32,
    /// Present only when value judgment is enabled
    pub value: Option<ValueJudgment>,
}

impl Verdict {
    /// Verdict from a score vector, with no value judgment.
    pub fn from_scores(scores: ScoreVector) -> Self {
        let (category, top_score) = scores.top();
        Self {
            scores,
            category,
            top_score,
            value: None,
        }
    }
}

/// Stateless scorer over a shared prompt set.
#[derive(Debug, Clone)]
pub struct Scorer {
    prompts: Arc<PromptEmbeddings>,
    value_enabled: bool,
}

impl Scorer {
    pub fn new(prompts: Arc<PromptEmbeddings>, value_enabled: bool) -> Self {
        Self {
            prompts,
            value_enabled,
        }
    }

    /// Score an already computed, normalized image embedding.
    pub fn score_embedding(&self, embedding: &[f32]) -> PipelineResult<Verdict> {
        if embedding.len() != self.prompts.dim() {
            return Err(PipelineError::Embedding {
                message: format!(
                    "image embedding has {} dims, prompts have {}",
                    embedding.len(),
                    self.prompts.dim()
                ),
            });
        }

        let image = ArrayView1::from(embedding);
        let logits: Vec<f32> = self
            .prompts
            .categories()
            .dot(&image)
            .iter()
            .map(|cos| cos * LOGIT_SCALE)
            .collect();
        let mut verdict = Verdict::from_scores(ScoreVector::from_probs(&softmax(&logits)));

        if self.value_enabled {
            let keep = cosine_similarity(embedding, self.prompts.keep_embedding()) * LOGIT_SCALE;
            let drop = cosine_similarity(embedding, self.prompts.drop_embedding()) * LOGIT_SCALE;
            let probs = softmax(&[keep, drop]);
            let keep_prob = probs.first().copied().unwrap_or(0.0).clamp(0.0, 1.0);
            verdict.value = Some(ValueJudgment {
                keep_prob,
                is_valuable: keep_prob >= KEEP_THRESHOLD,
            });
        }

        Ok(verdict)
    }

    /// Decode, preprocess, embed once and score.
    ///
    /// Blocking: runs inference on `session`.
    pub fn score_bytes(
        &self,
        session: &mut dyn ClipSession,
        bytes: &[u8],
        path: &Path,
        image_size: u32,
    ) -> PipelineResult<Verdict> {
        let pixels = preprocess_bytes(bytes, path, image_size)?;
        let embedding = session.embed_image(&pixels)?;
        self.score_embedding(&embedding)
    }

    pub fn value_enabled(&self) -> bool {
        self.value_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::l2_normalize;

    /// Prompts where category `i` points along axis `i`, keep along 8, drop along 9.
    fn axis_prompts() -> Arc<PromptEmbeddings> {
        let dim = 10;
        let axis = |i: usize| {
            let mut v = vec![0.0; dim];
            v[i] = 1.0;
            v
        };
        let categories = (0..CategoryKey::COUNT).map(axis).collect();
        Arc::new(PromptEmbeddings::from_parts(categories, axis(8), axis(9)).unwrap())
    }

    #[test]
    fn test_scores_sum_to_one_and_stay_in_range() {
        let scorer = Scorer::new(axis_prompts(), false);
        let embeddings = [
            l2_normalize(&[0.3, -0.2, 0.9, 0.1, 0.0, 0.4, -0.7, 0.2, 0.5, 0.1]),
            l2_normalize(&[1.0; 10]),
            l2_normalize(&[-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        ];
        for embedding in &embeddings {
            let verdict = scorer.score_embedding(embedding).unwrap();
            assert!((verdict.scores.sum() - 1.0).abs() < 1e-4);
            assert!(verdict.scores.iter().all(|(_, s)| (0.0..=1.0).contains(&s)));
            assert!(verdict.value.is_none());
        }
    }

    #[test]
    fn test_category_is_argmax() {
        let scorer = Scorer::new(axis_prompts(), false);
        let mut embedding = vec![0.0; 10];
        embedding[CategoryKey::PetsAnimals.index()] = 1.0;
        let verdict = scorer.score_embedding(&embedding).unwrap();
        assert_eq!(verdict.category, CategoryKey::PetsAnimals);
        assert_eq!(verdict.top_score, verdict.scores.get(CategoryKey::PetsAnimals));
        assert!(verdict.top_score > 0.99);
    }

    #[test]
    fn test_ties_break_by_enumeration_order() {
        let scorer = Scorer::new(axis_prompts(), false);
        // Equal similarity to People and Other.
        let mut embedding = vec![0.0; 10];
        embedding[CategoryKey::Other.index()] = 1.0;
        embedding[CategoryKey::People.index()] = 1.0;
        let verdict = scorer.score_embedding(&l2_normalize(&embedding)).unwrap();
        assert_eq!(verdict.category, CategoryKey::People);
    }

    #[test]
    fn test_value_judgment_threshold() {
        let scorer = Scorer::new(axis_prompts(), true);

        let mut keep = vec![0.0; 10];
        keep[8] = 1.0;
        let value = scorer.score_embedding(&keep).unwrap().value.unwrap();
        assert!(value.keep_prob > 0.99);
        assert!(value.is_valuable);

        let mut drop = vec![0.0; 10];
        drop[9] = 1.0;
        let value = scorer.score_embedding(&drop).unwrap().value.unwrap();
        assert!(value.keep_prob < 0.01);
        assert!(!value.is_valuable);

        // Equidistant: exactly 0.5 counts as valuable.
        let mut even = vec![0.0; 10];
        even[0] = 1.0;
        let value = scorer.score_embedding(&even).unwrap().value.unwrap();
        assert!((value.keep_prob - 0.5).abs() < 1e-6);
        assert_eq!(value.is_valuable, value.keep_prob >= KEEP_THRESHOLD);
    }

    #[test]
    fn test_dimension_mismatch_is_an_error() {
        let scorer = Scorer::new(axis_prompts(), false);
        assert!(scorer.score_embedding(&[1.0, 0.0]).is_err());
    }

    #[test]
    fn test_score_bytes_embeds_once() {
        use crate::embedding::mock::{self, MockFactory};
        use crate::embedding::{ProviderKind, SessionFactory};
        use image::{DynamicImage, RgbImage};
        use std::io::Cursor;

        let factory = MockFactory::new();
        let mut session = factory.build(ProviderKind::Cpu, &mock::options(1)).unwrap();
        let prompts = Arc::new(PromptEmbeddings::compute(session.as_mut()).unwrap());
        let scorer = Scorer::new(prompts, true);

        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 12, image::Rgb([90, 30, 200])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();

        let before = factory.image_calls();
        let verdict = scorer
            .score_bytes(session.as_mut(), buf.get_ref(), Path::new("x.png"), 8)
            .unwrap();
        assert_eq!(factory.image_calls(), before + 1);
        assert!(verdict.value.is_some());
        assert!((verdict.scores.sum() - 1.0).abs() < 1e-4);
    }
}
