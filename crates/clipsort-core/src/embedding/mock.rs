//! Instrumented in-memory sessions for tests.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ndarray::Array4;

use crate::config::AccelConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::math::l2_normalize;

use super::{ClipSession, EngineOptions, ProviderKind, SessionFactory};

pub(crate) const MOCK_DIM: usize = 16;

/// Options for a mock pool with every accelerator toggled on.
pub(crate) fn options(pool_size: usize) -> EngineOptions {
    EngineOptions {
        model_dir: PathBuf::from("/nonexistent/clipsort-model"),
        model_file: "onnx/mock.onnx".to_string(),
        image_size: 8,
        pool_size,
        intra_threads: 1,
        accel: AccelConfig {
            auto: true,
            coreml: true,
            cuda: true,
            rocm: true,
            directml: true,
            openvino: true,
        },
    }
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    image_calls: AtomicUsize,
    built: Mutex<Vec<ProviderKind>>,
}

/// Factory with injectable failures and concurrency counters.
#[derive(Default)]
pub(crate) struct MockFactory {
    fail_build: HashSet<ProviderKind>,
    fail_warmup: HashSet<ProviderKind>,
    not_compiled: HashSet<ProviderKind>,
    fail_images: bool,
    delay: Duration,
    counters: Arc<Counters>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Session construction fails for `kind`.
    pub(crate) fn fail_build(mut self, kind: ProviderKind) -> Self {
        self.fail_build.insert(kind);
        self
    }

    /// Sessions for `kind` build but every inference fails.
    pub(crate) fn fail_warmup(mut self, kind: ProviderKind) -> Self {
        self.fail_warmup.insert(kind);
        self
    }

    pub(crate) fn not_compiled(mut self, kind: ProviderKind) -> Self {
        self.not_compiled.insert(kind);
        self
    }

    /// Warmup passes, but any non-blank image fails.
    pub(crate) fn fail_images(mut self) -> Self {
        self.fail_images = true;
        self
    }

    /// Hold each image inference for `delay`.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn image_calls(&self) -> usize {
        self.counters.image_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn built(&self) -> Vec<ProviderKind> {
        self.counters
            .built
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

impl SessionFactory for MockFactory {
    fn compiled_in(&self, kind: ProviderKind) -> bool {
        !self.not_compiled.contains(&kind)
    }

    fn runtime_available(&self, kind: ProviderKind) -> bool {
        !self.not_compiled.contains(&kind)
    }

    fn build(
        &self,
        kind: ProviderKind,
        _options: &EngineOptions,
    ) -> PipelineResult<Box<dyn ClipSession>> {
        if self.fail_build.contains(&kind) {
            return Err(PipelineError::ProviderUnavailable {
                provider: kind,
                message: "mock registration failure".to_string(),
            });
        }
        if let Ok(mut built) = self.counters.built.lock() {
            built.push(kind);
        }
        Ok(Box::new(MockSession {
            kind,
            broken: self.fail_warmup.contains(&kind),
            fail_images: self.fail_images,
            delay: self.delay,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockSession {
    kind: ProviderKind,
    broken: bool,
    fail_images: bool,
    delay: Duration,
    counters: Arc<Counters>,
}

impl MockSession {
    fn check(&self) -> PipelineResult<()> {
        if self.broken {
            return Err(PipelineError::Embedding {
                message: format!("mock {} unsupported op", self.kind),
            });
        }
        Ok(())
    }
}

impl ClipSession for MockSession {
    fn embed_image(&mut self, pixels: &Array4<f32>) -> PipelineResult<Vec<f32>> {
        self.check()?;
        if self.fail_images && pixels.iter().any(|v| *v != 0.0) {
            return Err(PipelineError::Embedding {
                message: "mock image inference failure".to_string(),
            });
        }

        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.counters.image_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let mut means = [0.0f32; 3];
        let shape = pixels.shape();
        let per_channel = (shape[2] * shape[3]).max(1) as f32;
        for ((_, c, _, _), v) in pixels.indexed_iter() {
            means[c] += v / per_channel;
        }
        let raw: Vec<f32> = (0..MOCK_DIM)
            .map(|i| ((i as f32 + 1.0) * (means[i % 3] + 1.3)).sin() + 0.01)
            .collect();

        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(l2_normalize(&raw))
    }

    fn embed_texts(&mut self, prompts: &[&str]) -> PipelineResult<Vec<Vec<f32>>> {
        self.check()?;
        Ok(prompts
            .iter()
            .map(|prompt| {
                // FNV-1a
                let mut h: u64 = 0xcbf29ce484222325;
                for b in prompt.bytes() {
                    h ^= b as u64;
                    h = h.wrapping_mul(0x100000001b3);
                }
                let raw: Vec<f32> = (0..MOCK_DIM)
                    .map(|i| ((h >> (i * 4)) & 0xF) as f32 - 7.5)
                    .collect();
                l2_normalize(&raw)
            })
            .collect())
    }
}
