//! Fixed-capacity session pool with provider fallback at build time.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{PipelineError, PipelineResult};

use super::provider::{DemotedProviders, ProviderChain};
use super::{warmup, ClipSession, EngineOptions, ProviderKind, SessionFactory};

/// Build `options.pool_size` warmed-up sessions, walking the provider chain.
///
/// An accelerator that fails to build or warm up any session is demoted and
/// the whole batch is rebuilt on the next candidate. A CPU failure ends the
/// walk with [`PipelineError::EngineExhausted`].
///
/// Blocking: call from `spawn_blocking`.
pub fn build_with_fallback(
    factory: &dyn SessionFactory,
    options: &EngineOptions,
    demoted: &DemotedProviders,
) -> PipelineResult<(ProviderKind, Vec<Box<dyn ClipSession>>)> {
    let mut chain = ProviderChain::build(&options.accel, demoted, |k| factory.compiled_in(k));
    let size = options.pool_size.max(1);
    let mut last_error = None;

    while let Some(kind) = chain.current() {
        match build_batch(factory, kind, options, size) {
            Ok(sessions) => {
                tracing::info!(provider = %kind, sessions = size, "Session pool ready");
                return Ok((kind, sessions));
            }
            Err(e) if kind.is_accelerator() => {
                tracing::warn!(provider = %kind, error = %e, "Provider failed, falling back");
                demoted.demote(kind);
                last_error = Some(e);
                chain.advance();
            }
            Err(e) => {
                return Err(PipelineError::EngineExhausted {
                    message: e.to_string(),
                });
            }
        }
    }

    Err(PipelineError::EngineExhausted {
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no provider candidates".to_string()),
    })
}

fn build_batch(
    factory: &dyn SessionFactory,
    kind: ProviderKind,
    options: &EngineOptions,
    size: usize,
) -> PipelineResult<Vec<Box<dyn ClipSession>>> {
    let mut sessions = Vec::with_capacity(size);
    for i in 0..size {
        let mut session = factory.build(kind, options)?;
        warmup(session.as_mut(), options.image_size).map_err(|e| {
            PipelineError::ProviderUnavailable {
                provider: kind,
                message: format!("warmup failed: {e}"),
            }
        })?;
        tracing::debug!(provider = %kind, index = i, "Session warmed up");
        sessions.push(session);
    }
    Ok(sessions)
}

/// A bounded set of sessions. At most `size()` callers hold one at a time.
pub struct SessionPool {
    provider: ProviderKind,
    size: usize,
    semaphore: Arc<Semaphore>,
    sessions: Arc<Mutex<Vec<Box<dyn ClipSession>>>>,
    in_use: Arc<AtomicUsize>,
}

impl SessionPool {
    pub fn new(provider: ProviderKind, sessions: Vec<Box<dyn ClipSession>>) -> Self {
        let size = sessions.len();
        Self {
            provider,
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            sessions: Arc::new(Mutex::new(sessions)),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free session. It returns to the pool when the guard drops.
    pub async fn acquire(&self) -> PipelineResult<PooledSession> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Embedding {
                message: "session pool closed".to_string(),
            })?;

        let session = self
            .sessions
            .lock()
            .map_err(|_| PipelineError::Embedding {
                message: "session pool lock poisoned".to_string(),
            })?
            .pop()
            .ok_or_else(|| PipelineError::Embedding {
                message: "session pool is empty".to_string(),
            })?;

        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(in_use = now, size = self.size, "Session checked out");

        Ok(PooledSession {
            session: Some(session),
            sessions: Arc::clone(&self.sessions),
            in_use: Arc::clone(&self.in_use),
            _permit: permit,
        })
    }

    /// Provider every session in this pool runs on.
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions currently checked out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// Exclusive handle on one pooled session.
pub struct PooledSession {
    session: Option<Box<dyn ClipSession>>,
    sessions: Arc<Mutex<Vec<Box<dyn ClipSession>>>>,
    in_use: Arc<AtomicUsize>,
    // Released after the session is back in the vec.
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledSession {
    type Target = dyn ClipSession;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            None => unreachable!("session taken before drop"),
        }
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session.as_mut(),
            None => unreachable!("session taken before drop"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.push(session);
        }
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}
