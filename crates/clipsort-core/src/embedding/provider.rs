//! Provider priority chain and the process-wide demotion set.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, RwLock};

use crate::config::AccelConfig;

use super::ProviderKind;

/// Providers whose warmup failed in this process.
///
/// Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct DemotedProviders {
    inner: Arc<RwLock<HashSet<ProviderKind>>>,
}

impl DemotedProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// The set shared by every engine in this process.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<DemotedProviders> = OnceLock::new();
        GLOBAL.get_or_init(DemotedProviders::new).clone()
    }

    /// Permanently drop a provider. CPU is never demoted.
    pub fn demote(&self, kind: ProviderKind) {
        if !kind.is_accelerator() {
            return;
        }
        let mut set = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if set.insert(kind) {
            tracing::warn!(provider = %kind, "Execution provider demoted for this process");
        }
    }

    pub fn is_demoted(&self, kind: ProviderKind) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&kind)
    }

    pub fn list(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }
}

/// Ordered candidate providers with a cursor that moves on failure.
///
/// CPU is always the final candidate.
#[derive(Debug, Clone)]
pub struct ProviderChain {
    candidates: Vec<ProviderKind>,
    cursor: usize,
}

impl ProviderChain {
    /// Build the chain for the given toggles.
    ///
    /// With `auto` off the chain is CPU only. Otherwise every enabled
    /// accelerator that is compiled in and not demoted is tried in
    /// preference order before CPU.
    pub fn build(
        accel: &AccelConfig,
        demoted: &DemotedProviders,
        compiled_in: impl Fn(ProviderKind) -> bool,
    ) -> Self {
        let mut candidates = Vec::new();
        if accel.auto {
            for kind in ProviderKind::PREFERENCE {
                if !kind.is_accelerator() || !kind.enabled_in(accel) {
                    continue;
                }
                if demoted.is_demoted(kind) {
                    tracing::debug!(provider = %kind, "Skipping demoted provider");
                    continue;
                }
                if !compiled_in(kind) {
                    tracing::debug!(provider = %kind, "Skipping provider not compiled in");
                    continue;
                }
                candidates.push(kind);
            }
        }
        candidates.push(ProviderKind::Cpu);
        Self {
            candidates,
            cursor: 0,
        }
    }

    pub fn current(&self) -> Option<ProviderKind> {
        self.candidates.get(self.cursor).copied()
    }

    /// Move to the next candidate and return it.
    pub fn advance(&mut self) -> Option<ProviderKind> {
        if self.cursor < self.candidates.len() {
            self.cursor += 1;
        }
        self.current()
    }

    pub fn candidates(&self) -> &[ProviderKind] {
        &self.candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_on() -> AccelConfig {
        AccelConfig {
            auto: true,
            coreml: true,
            cuda: true,
            rocm: true,
            directml: true,
            openvino: true,
        }
    }

    #[test]
    fn test_chain_without_auto_is_cpu_only() {
        let mut accel = all_on();
        accel.auto = false;
        let chain = ProviderChain::build(&accel, &DemotedProviders::new(), |_| true);
        assert_eq!(chain.candidates(), &[ProviderKind::Cpu]);
    }

    #[test]
    fn test_chain_follows_preference_order() {
        let chain = ProviderChain::build(&all_on(), &DemotedProviders::new(), |_| true);
        assert_eq!(chain.candidates(), &ProviderKind::PREFERENCE);
    }

    #[test]
    fn test_chain_skips_disabled_demoted_and_missing() {
        let mut accel = all_on();
        accel.rocm = false;
        let demoted = DemotedProviders::new();
        demoted.demote(ProviderKind::CoreMl);
        let chain = ProviderChain::build(&accel, &demoted, |k| k != ProviderKind::OpenVino);
        assert_eq!(
            chain.candidates(),
            &[ProviderKind::Cuda, ProviderKind::DirectMl, ProviderKind::Cpu]
        );
    }

    #[test]
    fn test_advance_walks_to_exhaustion() {
        let mut accel = all_on();
        accel.coreml = false;
        accel.rocm = false;
        accel.directml = false;
        accel.openvino = false;
        let mut chain = ProviderChain::build(&accel, &DemotedProviders::new(), |_| true);
        assert_eq!(chain.current(), Some(ProviderKind::Cuda));
        assert_eq!(chain.advance(), Some(ProviderKind::Cpu));
        assert_eq!(chain.advance(), None);
        assert_eq!(chain.advance(), None);
    }

    #[test]
    fn test_cpu_is_never_demoted() {
        let demoted = DemotedProviders::new();
        demoted.demote(ProviderKind::Cpu);
        demoted.demote(ProviderKind::Cuda);
        assert!(!demoted.is_demoted(ProviderKind::Cpu));
        assert_eq!(demoted.list(), vec![ProviderKind::Cuda]);
    }

    #[test]
    fn test_clones_share_state() {
        let demoted = DemotedProviders::new();
        let other = demoted.clone();
        other.demote(ProviderKind::Rocm);
        assert!(demoted.is_demoted(ProviderKind::Rocm));
    }
}
