//! ONNX Runtime session over a combined CLIP graph.
//!
//! The graph takes `input_ids`, `attention_mask` and `pixel_values` and
//! produces `image_embeds` and `text_embeds` in one run. Both sides are always
//! fed: an image run pairs the pixels with an empty prompt, a text run pairs
//! the prompts with a blank pixel batch.

use std::path::Path;

use ndarray::Array4;
use ort::execution_providers::coreml::ModelFormat as CoreMLModelFormat;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
    OpenVINOExecutionProvider, ROCmExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;

use crate::error::{PipelineError, PipelineResult};
use crate::math::l2_normalize;

use super::{ClipSession, EngineOptions, ProviderKind, SessionFactory};

/// CLIP text context length.
pub const CONTEXT_LENGTH: usize = 77;

/// `<|endoftext|>` id in the stock CLIP vocabulary.
const FALLBACK_EOT_ID: u32 = 49407;

const INPUT_IDS: &[&str] = &["input_ids"];
const ATTENTION_MASK: &[&str] = &["attention_mask"];
const PIXEL_VALUES: &[&str] = &["pixel_values"];
const IMAGE_OUTPUTS: &[&str] = &[
    "image_embeds",
    "image_embeddings",
    "image_features",
    "vision_embeds",
];
const TEXT_OUTPUTS: &[&str] = &["text_embeds", "text_embeddings", "text_features"];

/// Whether `kind` is compiled in and the platform can run it.
pub fn provider_supported(kind: ProviderKind) -> bool {
    match kind {
        ProviderKind::Cpu => true,
        ProviderKind::CoreMl => {
            cfg!(feature = "coreml") && CoreMLExecutionProvider::default().supported_by_platform()
        }
        ProviderKind::Cuda => {
            cfg!(feature = "cuda") && CUDAExecutionProvider::default().supported_by_platform()
        }
        ProviderKind::Rocm => {
            cfg!(feature = "rocm") && ROCmExecutionProvider::default().supported_by_platform()
        }
        ProviderKind::DirectMl => {
            cfg!(feature = "directml")
                && DirectMLExecutionProvider::default().supported_by_platform()
        }
        ProviderKind::OpenVino => {
            cfg!(feature = "openvino")
                && OpenVINOExecutionProvider::default().supported_by_platform()
        }
    }
}

/// ONNX Runtime's own availability report for `kind`.
pub fn runtime_available(kind: ProviderKind) -> bool {
    if !provider_supported(kind) {
        return false;
    }
    let available = match kind {
        ProviderKind::Cpu => return true,
        ProviderKind::CoreMl => CoreMLExecutionProvider::default().is_available(),
        ProviderKind::Cuda => CUDAExecutionProvider::default().is_available(),
        ProviderKind::Rocm => ROCmExecutionProvider::default().is_available(),
        ProviderKind::DirectMl => DirectMLExecutionProvider::default().is_available(),
        ProviderKind::OpenVino => OpenVINOExecutionProvider::default().is_available(),
    };
    available.unwrap_or(false)
}

fn execution_provider(kind: ProviderKind) -> ExecutionProviderDispatch {
    let dispatch = match kind {
        ProviderKind::Cpu => CPUExecutionProvider::default().build(),
        ProviderKind::CoreMl => CoreMLExecutionProvider::default()
            .with_model_format(CoreMLModelFormat::MLProgram)
            .with_static_input_shapes(true)
            .build(),
        ProviderKind::Cuda => CUDAExecutionProvider::default().build(),
        ProviderKind::Rocm => ROCmExecutionProvider::default().build(),
        ProviderKind::DirectMl => DirectMLExecutionProvider::default().build(),
        ProviderKind::OpenVino => OpenVINOExecutionProvider::default().build(),
    };
    dispatch.error_on_failure()
}

/// Builds [`OrtClipSession`]s from the model directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtSessionFactory;

impl SessionFactory for OrtSessionFactory {
    fn build(
        &self,
        kind: ProviderKind,
        options: &EngineOptions,
    ) -> PipelineResult<Box<dyn ClipSession>> {
        Ok(Box::new(OrtClipSession::load(kind, options)?))
    }
}

/// Resolved tensor names of one model.
#[derive(Debug, Clone)]
struct IoNames {
    input_ids: String,
    attention_mask: Option<String>,
    pixel_values: String,
    image_embeds: String,
    text_embeds: String,
}

/// First name containing any candidate, case-insensitively, in candidate order.
fn find_name(names: &[String], candidates: &[&str]) -> Option<String> {
    candidates.iter().find_map(|candidate| {
        names
            .iter()
            .find(|name| name.to_lowercase().contains(candidate))
            .cloned()
    })
}

impl IoNames {
    fn resolve(inputs: &[String], outputs: &[String]) -> PipelineResult<Self> {
        let require = |names: &[String], candidates: &[&str], role: &str| {
            find_name(names, candidates).ok_or_else(|| PipelineError::Embedding {
                message: format!("model has no {role} tensor (found {names:?})"),
            })
        };
        Ok(Self {
            input_ids: require(inputs, INPUT_IDS, "input_ids")?,
            attention_mask: find_name(inputs, ATTENTION_MASK),
            pixel_values: require(inputs, PIXEL_VALUES, "pixel_values")?,
            image_embeds: require(outputs, IMAGE_OUTPUTS, "image embedding")?,
            text_embeds: require(outputs, TEXT_OUTPUTS, "text embedding")?,
        })
    }
}

/// One ONNX Runtime session bound to a single execution provider.
pub struct OrtClipSession {
    session: Session,
    tokenizer: tokenizers::Tokenizer,
    names: IoNames,
    pad_id: i64,
    image_size: usize,
}

impl OrtClipSession {
    /// Load the model and tokenizer and register `kind` as the only provider.
    pub fn load(kind: ProviderKind, options: &EngineOptions) -> PipelineResult<Self> {
        let model_path = options.model_path();
        let tokenizer_path = options.tokenizer_path();
        for path in [&model_path, &tokenizer_path] {
            if !path.is_file() {
                return Err(PipelineError::ModelNotFound { path: path.clone() });
            }
        }

        let unavailable = |e: &dyn std::fmt::Display| PipelineError::ProviderUnavailable {
            provider: kind,
            message: e.to_string(),
        };

        let session = Session::builder()
            .map_err(|e| unavailable(&e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| unavailable(&e))?
            .with_intra_threads(options.intra_threads.max(1))
            .map_err(|e| unavailable(&e))?
            .with_execution_providers([execution_provider(kind)])
            .map_err(|e| unavailable(&e))?
            .commit_from_file(&model_path)
            .map_err(|e| unavailable(&e))?;

        let tokenizer = load_tokenizer(&tokenizer_path)?;
        let pad_id = tokenizer
            .token_to_id("<|endoftext|>")
            .unwrap_or(FALLBACK_EOT_ID) as i64;

        let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let names = IoNames::resolve(&inputs, &outputs)?;

        tracing::debug!(
            provider = %kind,
            intra_threads = options.intra_threads,
            "Loaded CLIP model from {:?} (inputs: {:?}, outputs: {:?})",
            model_path,
            inputs,
            outputs
        );

        Ok(Self {
            session,
            tokenizer,
            names,
            pad_id,
            image_size: options.image_size as usize,
        })
    }

    /// Tokenize to fixed-length ids and mask, padded with `<|endoftext|>`.
    fn encode_fixed(&self, prompts: &[&str]) -> PipelineResult<(Vec<i64>, Vec<i64>)> {
        let mut ids = Vec::with_capacity(prompts.len() * CONTEXT_LENGTH);
        let mut mask = Vec::with_capacity(prompts.len() * CONTEXT_LENGTH);

        for prompt in prompts {
            let encoding =
                self.tokenizer
                    .encode(*prompt, true)
                    .map_err(|e| PipelineError::Embedding {
                        message: format!("Tokenization failed: {e}"),
                    })?;
            let mut row: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
            if row.len() > CONTEXT_LENGTH {
                row.truncate(CONTEXT_LENGTH);
                row[CONTEXT_LENGTH - 1] = self.pad_id;
            }
            let real = row.len();
            row.resize(CONTEXT_LENGTH, self.pad_id);
            ids.extend_from_slice(&row);
            mask.extend((0..CONTEXT_LENGTH).map(|j| i64::from(j < real)));
        }
        Ok((ids, mask))
    }

    /// Run the graph and return the rows of one output, L2-normalized.
    fn run(
        &mut self,
        prompts: &[&str],
        pixel_shape: Vec<i64>,
        pixel_data: Vec<f32>,
        output: Output,
    ) -> PipelineResult<Vec<Vec<f32>>> {
        let batch = prompts.len();
        let (ids, mask) = self.encode_fixed(prompts)?;
        let text_shape = vec![batch as i64, CONTEXT_LENGTH as i64];

        let ids_value = Value::from_array((text_shape.clone(), ids)).map_err(tensor_err)?;
        let pixels_value = Value::from_array((pixel_shape, pixel_data)).map_err(tensor_err)?;

        let mut inputs = ort::inputs![
            self.names.input_ids.as_str() => ids_value,
            self.names.pixel_values.as_str() => pixels_value,
        ];
        if let Some(name) = &self.names.attention_mask {
            let mask_value = Value::from_array((text_shape, mask)).map_err(tensor_err)?;
            inputs.push((name.clone().into(), mask_value.into()));
        }

        let wanted = match output {
            Output::Image => self.names.image_embeds.clone(),
            Output::Text => self.names.text_embeds.clone(),
        };

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| PipelineError::Embedding {
                message: format!("ONNX inference failed: {e}"),
            })?;

        let (_, value) = outputs
            .iter()
            .find(|(name, _)| *name == wanted)
            .ok_or_else(|| PipelineError::Embedding {
                message: format!("Model did not produce {wanted}"),
            })?;

        let (shape, data) =
            value
                .try_extract_tensor::<f32>()
                .map_err(|e| PipelineError::Embedding {
                    message: format!("Failed to extract {wanted} tensor: {e}"),
                })?;

        let dim = match shape.len() {
            1 => data.len(),
            2 => shape[1] as usize,
            _ => {
                return Err(PipelineError::Embedding {
                    message: format!("Unexpected {wanted} shape: {:?}", shape),
                });
            }
        };
        if dim == 0 || data.len() < dim {
            return Err(PipelineError::Embedding {
                message: format!("Empty {wanted} tensor"),
            });
        }

        Ok(data.chunks(dim).map(l2_normalize).collect())
    }
}

#[derive(Clone, Copy)]
enum Output {
    Image,
    Text,
}

impl ClipSession for OrtClipSession {
    fn embed_image(&mut self, pixels: &Array4<f32>) -> PipelineResult<Vec<f32>> {
        let shape: Vec<i64> = pixels.shape().iter().map(|&d| d as i64).collect();
        let batch = pixels.shape()[0].max(1);
        let data: Vec<f32> = pixels.iter().copied().collect();
        let prompts = vec![""; batch];

        self.run(&prompts, shape, data, Output::Image)?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Embedding {
                message: "Model returned no image embedding".to_string(),
            })
    }

    fn embed_texts(&mut self, prompts: &[&str]) -> PipelineResult<Vec<Vec<f32>>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let n = prompts.len();
        let size = self.image_size;
        let shape = vec![n as i64, 3, size as i64, size as i64];
        let data = vec![0.0f32; n * 3 * size * size];

        let rows = self.run(prompts, shape, data, Output::Text)?;
        if rows.len() != n {
            return Err(PipelineError::Embedding {
                message: format!("Expected {n} text embeddings, got {}", rows.len()),
            });
        }
        Ok(rows)
    }
}

fn tensor_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Embedding {
        message: format!("Failed to create input tensor: {e}"),
    }
}

fn load_tokenizer(path: &Path) -> PipelineResult<tokenizers::Tokenizer> {
    tokenizers::Tokenizer::from_file(path).map_err(|e| PipelineError::Embedding {
        message: format!("Failed to load tokenizer: {e}"),
    })
}
