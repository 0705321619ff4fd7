//! Execution provider capability detection.

use serde::Serialize;

use super::provider::DemotedProviders;
use super::{warmup, EngineOptions, ProviderKind, SessionFactory};

/// What is known about one execution provider on this machine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccelCapability {
    pub provider: ProviderKind,
    pub name: String,
    /// Compiled in and supported on this platform
    pub supported: bool,
    /// Passed a build and warmup check (or the runtime check without a model)
    pub available: bool,
    /// User toggle
    pub enabled: bool,
}

/// One [`AccelCapability`] per provider kind, in preference order.
#[derive(Debug, Clone, Serialize)]
pub struct AccelCapabilities {
    pub providers: Vec<AccelCapability>,
}

impl AccelCapabilities {
    pub fn get(&self, kind: ProviderKind) -> Option<&AccelCapability> {
        self.providers.iter().find(|c| c.provider == kind)
    }
}

/// Checks providers without touching any shared state.
///
/// Blocking: building trial sessions loads the model.
pub struct CapabilityDetector<'a> {
    factory: &'a dyn SessionFactory,
    options: &'a EngineOptions,
    demoted: &'a DemotedProviders,
}

impl<'a> CapabilityDetector<'a> {
    pub fn new(
        factory: &'a dyn SessionFactory,
        options: &'a EngineOptions,
        demoted: &'a DemotedProviders,
    ) -> Self {
        Self {
            factory,
            options,
            demoted,
        }
    }

    pub fn detect(&self) -> AccelCapabilities {
        let with_model = self.options.model_present();
        let providers = ProviderKind::PREFERENCE
            .into_iter()
            .map(|kind| self.detect_one(kind, with_model))
            .collect();
        AccelCapabilities { providers }
    }

    fn detect_one(&self, kind: ProviderKind, with_model: bool) -> AccelCapability {
        let supported = self.factory.compiled_in(kind);
        let available = if !supported || self.demoted.is_demoted(kind) {
            false
        } else if with_model {
            self.try_session(kind)
        } else {
            self.factory.runtime_available(kind)
        };

        AccelCapability {
            provider: kind,
            name: kind.display_name().to_string(),
            supported,
            available,
            enabled: kind.enabled_in(&self.options.accel),
        }
    }

    fn try_session(&self, kind: ProviderKind) -> bool {
        let result = self
            .factory
            .build(kind, self.options)
            .and_then(|mut session| warmup(session.as_mut(), self.options.image_size));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(provider = %kind, error = %e, "Capability check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::mock::{self, MockFactory};

    fn options_with_model(dir: &std::path::Path) -> EngineOptions {
        std::fs::create_dir_all(dir.join("onnx")).unwrap();
        std::fs::write(dir.join("onnx/mock.onnx"), b"onnx").unwrap();
        std::fs::write(dir.join("tokenizer.json"), b"{}").unwrap();
        let mut options = mock::options(1);
        options.model_dir = dir.to_path_buf();
        options
    }

    #[test]
    fn test_reports_every_provider() {
        let factory = MockFactory::new();
        let options = mock::options(1);
        let demoted = DemotedProviders::new();
        let caps = CapabilityDetector::new(&factory, &options, &demoted).detect();
        assert_eq!(caps.providers.len(), ProviderKind::PREFERENCE.len());
        let cpu = caps.get(ProviderKind::Cpu).unwrap();
        assert!(cpu.supported && cpu.available && cpu.enabled);
    }

    #[test]
    fn test_warmup_failure_marks_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let options = options_with_model(dir.path());
        let factory = MockFactory::new().fail_warmup(ProviderKind::Cuda);
        let demoted = DemotedProviders::new();
        let caps = CapabilityDetector::new(&factory, &options, &demoted).detect();

        let cuda = caps.get(ProviderKind::Cuda).unwrap();
        assert!(cuda.supported);
        assert!(!cuda.available);
        assert!(caps.get(ProviderKind::CoreMl).unwrap().available);
        // Detection never demotes.
        assert!(demoted.list().is_empty());
    }

    #[test]
    fn test_demoted_and_missing_providers() {
        let factory = MockFactory::new().not_compiled(ProviderKind::Rocm);
        let options = mock::options(1);
        let demoted = DemotedProviders::new();
        demoted.demote(ProviderKind::OpenVino);
        let caps = CapabilityDetector::new(&factory, &options, &demoted).detect();

        let rocm = caps.get(ProviderKind::Rocm).unwrap();
        assert!(!rocm.supported && !rocm.available);
        let openvino = caps.get(ProviderKind::OpenVino).unwrap();
        assert!(openvino.supported && !openvino.available);
    }

    #[test]
    fn test_enabled_mirrors_toggles() {
        let factory = MockFactory::new();
        let mut options = mock::options(1);
        options.accel.directml = false;
        let demoted = DemotedProviders::new();
        let caps = CapabilityDetector::new(&factory, &options, &demoted).detect();
        assert!(!caps.get(ProviderKind::DirectMl).unwrap().enabled);
        assert!(caps.get(ProviderKind::Cuda).unwrap().enabled);
    }
}
