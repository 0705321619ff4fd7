//! Single active job: identifiers, cancellation and progress publication.
//!
//! Progress is observable two ways. [`JobManager::snapshot`] reads the latest
//! state from a `watch` channel without blocking, and
//! [`JobManager::subscribe`] hands out a `broadcast` receiver. A slow
//! subscriber lags and loses the oldest snapshots; publication never waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::JobError;
use crate::types::{JobState, JobStatus};

/// Buffered progress snapshots per subscriber before the oldest are dropped.
const PROGRESS_BUFFER: usize = 256;

/// Shared, cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct ProgressChannels {
    latest: watch::Sender<Option<JobState>>,
    events: broadcast::Sender<JobState>,
}

impl ProgressChannels {
    fn publish(&self, state: JobState) {
        self.latest.send_replace(Some(state.clone()));
        // No subscribers is fine.
        let _ = self.events.send(state);
    }
}

/// The single active-job slot shared by the manager and its tickets.
#[derive(Clone, Default)]
struct ActiveSlot(Arc<Mutex<Option<ActiveJob>>>);

impl ActiveSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Free the slot if `job_id` still holds it.
    fn release(&self, job_id: &str) {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|a| a.job_id == job_id) {
            *active = None;
        }
    }
}

/// Counters of one job. Every update publishes under the same lock, so
/// concurrent workers never lose an increment and snapshots are ordered.
pub struct ProgressTracker {
    state: Mutex<JobState>,
    channels: ProgressChannels,
    slot: ActiveSlot,
}

impl ProgressTracker {
    fn update(&self, f: impl FnOnce(&mut JobState)) -> JobState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.status.is_terminal() {
            return state.clone();
        }
        f(&mut state);
        // A subscriber that sees the terminal state may start the next job.
        if state.status.is_terminal() {
            self.slot.release(&state.job_id);
        }
        self.channels.publish(state.clone());
        state.clone()
    }

    /// Number of items discovered for this job.
    pub fn set_total(&self, total: usize) -> JobState {
        self.update(|s| s.total = total)
    }

    /// Count one handled item.
    pub fn record(&self, file_name: &str, failed: bool) -> JobState {
        self.update(|s| {
            s.processed += 1;
            if failed {
                s.errors += 1;
            }
            s.current_file = Some(file_name.to_string());
        })
    }

    /// Enter a terminal state.
    pub fn finish(&self, status: JobStatus) -> JobState {
        self.update(|s| {
            s.status = status;
            s.current_file = None;
        })
    }

    /// End the job in `error`, counting the fatal failure.
    pub fn fail(&self) -> JobState {
        self.update(|s| {
            s.status = JobStatus::Error;
            s.errors += 1;
            s.current_file = None;
        })
    }

    pub fn state(&self) -> JobState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct ActiveJob {
    job_id: String,
    cancel: CancelFlag,
}

/// A running job's identity, cancel flag and progress.
///
/// The active-job slot is freed as soon as a terminal state is published.
/// If the job never reached one (error return or panic), dropping the ticket
/// publishes `error` and frees the slot.
pub struct JobTicket {
    pub job_id: String,
    pub cancel: CancelFlag,
    pub progress: ProgressTracker,
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        if !self.progress.state().status.is_terminal() {
            tracing::error!(job_id = %self.job_id, "Job ended without a terminal state");
            self.progress.fail();
        }
        self.progress.slot.release(&self.job_id);
    }
}

/// Owns the single live job.
pub struct JobManager {
    active: ActiveSlot,
    channels: ProgressChannels,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        let (events, _) = broadcast::channel(PROGRESS_BUFFER);
        Self {
            active: ActiveSlot::default(),
            channels: ProgressChannels { latest, events },
        }
    }

    /// Register a new running job, or reject while one is live.
    pub fn start(&self) -> Result<JobTicket, JobError> {
        let mut active = self.active.lock();
        if let Some(job) = active.as_ref() {
            return Err(JobError::AlreadyRunning {
                job_id: job.job_id.clone(),
            });
        }

        let job_id = Uuid::new_v4().to_string();
        let cancel = CancelFlag::default();
        *active = Some(ActiveJob {
            job_id: job_id.clone(),
            cancel: cancel.clone(),
        });

        let initial = JobState {
            job_id: job_id.clone(),
            status: JobStatus::Running,
            processed: 0,
            total: 0,
            errors: 0,
            current_file: None,
        };
        self.channels.publish(initial.clone());
        tracing::info!(%job_id, "Job started");

        Ok(JobTicket {
            job_id,
            cancel,
            progress: ProgressTracker {
                state: Mutex::new(initial),
                channels: self.channels.clone(),
                slot: self.active.clone(),
            },
        })
    }

    /// Request cancellation of `job_id`. Returns false if it is not the live job.
    pub fn cancel(&self, job_id: &str) -> bool {
        let active = self.active.lock();
        match active.as_ref() {
            Some(job) if job.job_id == job_id => {
                if !job.cancel.is_canceled() {
                    tracing::info!(%job_id, "Cancellation requested");
                }
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Latest published state, if any job has started.
    pub fn snapshot(&self) -> Option<JobState> {
        self.channels.latest.borrow().clone()
    }

    /// Push subscription to every published snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<JobState> {
        self.channels.events.subscribe()
    }

    /// Watch the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<Option<JobState>> {
        self.channels.latest.subscribe()
    }

    /// Id of the running job, if any.
    pub fn active_job(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.job_id.clone())
    }
}
