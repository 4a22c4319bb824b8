//! The job manager aggregate.
//!
//! [`JobManager`] owns the request table, the LRM id table, the stop and
//! drained flags and the grace period timer, all behind one lock that is
//! only held for bookkeeping. State file I/O happens on the blocking pool
//! with the lock released.
//!
//! # Entry lifecycle
//!
//! - **Resident**: the job record is in memory.
//! - **Swapped**: the record was written to its state file and freed; only
//!   the cached status remains. Happens when the last lease is released in
//!   the poll-wait phase with event streaming on, and the swap-out timer
//!   fires before anyone takes a new lease.
//! - **Removed**: the last lease was released in a terminal phase.
//!
//! Any lease acquisition brings a swapped job back. A lease requested while
//! a swap-out is writing the state file waits for the write to finish.

mod lease;
mod reload;
mod stop;

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};

use crate::config::ManagerConfig;
use crate::error::{GramError, Result};
use crate::registry::lrm_ids::split_subjobs;
use crate::registry::requests::{AcquireStep, ReleaseOutcome, SwapOutcome};
use crate::registry::{
    CachedStatus, JobKey, JobRecord, LrmIdTable, RequestSummary, RequestTable, SharedJob,
};
use crate::store::JobStore;
use crate::timer::TimerHandle;

pub use lease::JobLease;
pub use stop::StopReport;

#[derive(Debug)]
struct ManagerState {
    requests: RequestTable,
    lrm_ids: LrmIdTable,
    stopping: bool,
    drained: bool,
    grace_period_timer: Option<TimerHandle>,
    last_event_floor: Option<DateTime<Utc>>,
}

struct Shared {
    config: ManagerConfig,
    store: Arc<dyn JobStore>,
    runtime: Handle,
    state: Mutex<ManagerState>,
    drained_tx: watch::Sender<bool>,
}

/// Point-in-time view of the manager for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub stopping: bool,
    pub drained: bool,
    pub requests: usize,
    pub lrm_ids: usize,
}

/// Handle to the job manager. Clones share the same state.
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<Shared>,
}

impl JobManager {
    /// Create a manager bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime, since timers could never
    /// fire.
    pub fn new(config: ManagerConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| GramError::Internal(format!("job manager needs a tokio runtime: {e}")))?;
        let (drained_tx, _) = watch::channel(false);

        let state = ManagerState {
            requests: RequestTable::with_capacity(config.max_requests),
            lrm_ids: LrmIdTable::new(),
            stopping: false,
            drained: false,
            grace_period_timer: None,
            last_event_floor: None,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                runtime,
                state: Mutex::new(state),
                drained_tx,
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    /// Register a new job request with no references.
    ///
    /// The caller is expected to take a lease right away. Disarms the grace
    /// period timer since the registry is no longer empty.
    pub fn add_request(&self, job: JobRecord) -> Result<()> {
        let key = job.key;
        let phase = job.phase;
        let mut state = self.shared.state.lock();

        if state.stopping || state.drained {
            tracing::warn!(job = %key, "Rejecting request, job manager is stopping");
            return Err(GramError::Stopping);
        }
        if let Some(timer) = state.grace_period_timer.take() {
            timer.cancel();
            tracing::debug!("Grace period timer disarmed by new request");
        }

        state.requests.insert(job)?;
        tracing::info!(job = %key, phase = %phase, "Added request");
        Ok(())
    }

    /// Take a lease on a job, reloading it from its state file if it was
    /// swapped out.
    pub async fn acquire(&self, key: &JobKey, reason: &str) -> Result<JobLease> {
        let step = {
            let mut state = self.shared.state.lock();
            match state.requests.acquire(key) {
                Ok(step) => step,
                Err(e) => {
                    tracing::debug!(job = %key, reason, "Adding reference: not found");
                    return Err(e);
                }
            }
        };
        self.finish_acquire(*key, step, reason).await
    }

    /// Take a lease on the job owning an LRM job id.
    ///
    /// Refused once the manager is stopping.
    pub async fn acquire_by_lrm_id(&self, lrm_id: &str, reason: &str) -> Result<JobLease> {
        let (key, step) = {
            let mut state = self.shared.state.lock();
            if state.stopping {
                tracing::debug!(lrm_id, "Manager is stopping, not resolving LRM job id");
                return Err(GramError::Stopping);
            }
            let key = state.lrm_ids.resolve(lrm_id)?;
            let step = state.requests.acquire(&key)?;
            (key, step)
        };
        tracing::debug!(lrm_id, job = %key, "Resolved LRM job id");
        self.finish_acquire(key, step, reason).await
    }

    async fn finish_acquire(&self, key: JobKey, step: AcquireStep, reason: &str) -> Result<JobLease> {
        let mut pending = PendingReference::new(self, key);
        let job = self.resolve_step(&mut pending, step).await?;
        pending.disarm();

        let count = self.reference_count(&key).unwrap_or_default();
        tracing::debug!(job = %key, reason, count, "Added reference");
        Ok(JobLease::new(self.clone(), key, job, reason))
    }

    async fn resolve_step(
        &self,
        pending: &mut PendingReference<'_>,
        mut step: AcquireStep,
    ) -> Result<SharedJob> {
        let key = pending.key;
        loop {
            step = match step {
                AcquireStep::Resident(job) => return Ok(job),
                AcquireStep::Load(notify) => {
                    pending.loading = Some(notify);
                    return self.reload_job(pending).await;
                }
                AcquireStep::Wait(notify) => {
                    // Created before the re-check so a wakeup in between is kept.
                    let notified = notify.notified();
                    let next = self.shared.state.lock().requests.resume_acquire(&key)?;
                    match next {
                        AcquireStep::Wait(current) if Arc::ptr_eq(&current, &notify) => {
                            notified.await;
                            let next = self.shared.state.lock().requests.resume_acquire(&key)?;
                            next
                        }
                        next => next,
                    }
                }
            };
        }
    }

    async fn reload_job(&self, pending: &mut PendingReference<'_>) -> Result<SharedJob> {
        let key = pending.key;
        tracing::info!(job = %key, "Reloading swapped-out request");

        let store = self.shared.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&key))
            .await
            .map_err(|e| GramError::Internal(format!("state file load task failed: {e}")))
            .and_then(|result| result);

        let record = match loaded {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(job = %key, error = %e, "Failed to reload request");
                return Err(e);
            }
        };

        let job = self.shared.state.lock().requests.finish_load(&key, record)?;
        if let Some(notify) = pending.loading.take() {
            notify.notify_waiters();
        }
        Ok(job)
    }

    /// Drop one reference to `key`.
    ///
    /// Normally called through [`JobLease`]. When the count reaches zero a
    /// terminal job is removed, an idle poll-wait job gets a swap-out timer
    /// and anything else stays in memory.
    pub fn release_reference(&self, key: &JobKey, reason: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        let outcome = match state
            .requests
            .release(key, self.shared.config.event_stream_enabled)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(job = %key, reason, error = %e, "Removing spurious reference");
                return Err(e);
            }
        };

        match outcome {
            ReleaseOutcome::Referenced(count) => {
                tracing::debug!(job = %key, reason, count, "Removed reference");
            }
            ReleaseOutcome::Removed { now_empty } => {
                tracing::info!(job = %key, reason, "Cleaning up completed request");
                if now_empty {
                    if state.stopping {
                        self.mark_drained(&mut state);
                    } else {
                        self.arm_grace_period_locked(&mut state);
                    }
                }
            }
            ReleaseOutcome::SwapOutCandidate => {
                tracing::info!(job = %key, reason, "Candidate for swap out from memory");
                let timer = self.schedule_swap_out(*key);
                state.requests.set_swap_out_timer(key, timer);
            }
            ReleaseOutcome::Retained => {
                tracing::debug!(job = %key, reason, count = 0, "Removed reference");
            }
        }
        Ok(())
    }

    fn schedule_swap_out(&self, key: JobKey) -> TimerHandle {
        let manager = Arc::downgrade(&self.shared);
        TimerHandle::schedule(
            &self.shared.runtime,
            self.shared.config.swap_out_delay,
            move |timer_id| async move {
                if let Some(shared) = Weak::upgrade(&manager) {
                    JobManager { shared }.swap_out(key, timer_id).await;
                }
            },
        )
    }

    async fn swap_out(&self, key: JobKey, timer_id: u64) {
        let Some(ticket) = self.shared.state.lock().requests.begin_swap_out(&key, timer_id) else {
            return;
        };
        tracing::info!(job = %key, phase = %ticket.record.phase, "Swapping out idle request");

        let store = self.shared.store.clone();
        let record = ticket.record.clone();
        let saved = match tokio::task::spawn_blocking(move || store.save(&record)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(job = %key, error = %e, "Failed to write state file, keeping request in memory");
                false
            }
            Err(e) => {
                tracing::error!(job = %key, error = %e, "State file write task failed, keeping request in memory");
                false
            }
        };

        let outcome = self.shared.state.lock().requests.finish_swap_out(&ticket, saved);
        ticket.wake_waiters();
        match outcome {
            SwapOutcome::Swapped => tracing::info!(job = %key, "Request swapped out"),
            SwapOutcome::KeptResident => {
                tracing::debug!(job = %key, "Request stays in memory")
            }
            SwapOutcome::Gone => tracing::debug!(job = %key, "Request vanished during swap out"),
        }
    }

    /// Arm the grace period timer if the registry is empty.
    pub fn arm_grace_period_timer(&self) {
        let mut state = self.shared.state.lock();
        self.arm_grace_period_locked(&mut state);
    }

    fn arm_grace_period_locked(&self, state: &mut ManagerState) {
        if !state.requests.is_empty() || state.drained {
            return;
        }
        if let Some(old) = state.grace_period_timer.take() {
            old.cancel();
        }

        let manager = Arc::downgrade(&self.shared);
        let delay = self.shared.config.grace_period_delay;
        let timer = TimerHandle::schedule(&self.shared.runtime, delay, move |timer_id| async move {
            if let Some(shared) = Weak::upgrade(&manager) {
                JobManager { shared }.grace_period_expired(timer_id);
            }
        });
        tracing::info!(delay_ms = delay.as_millis() as u64, "Registry empty, grace period timer armed");
        state.grace_period_timer = Some(timer);
    }

    fn grace_period_expired(&self, timer_id: u64) {
        let mut state = self.shared.state.lock();
        match &state.grace_period_timer {
            Some(timer) if timer.id() == timer_id => {}
            _ => return,
        }
        state.grace_period_timer = None;
        if state.requests.is_empty() {
            tracing::info!("Grace period expired with no requests");
            self.mark_drained(&mut state);
        }
    }

    fn mark_drained(&self, state: &mut ManagerState) {
        if !state.drained {
            state.drained = true;
            self.shared.drained_tx.send_replace(true);
            tracing::info!("Job manager drained");
        }
    }

    /// Wait until the manager has drained: every job left after a stop, or
    /// the grace period ran out on an empty registry.
    pub async fn wait_drained(&self) {
        let mut rx = self.shared.drained_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|drained| *drained).await;
    }

    /// Update the cached status kept for fast status queries.
    pub fn set_status(&self, key: &JobKey, status: CachedStatus) -> Result<()> {
        let result = self.shared.state.lock().requests.set_status(key, status);
        match &result {
            Ok(()) => tracing::debug!(job = %key, phase = %status.phase, "Cached status updated"),
            Err(_) => tracing::debug!(job = %key, "Cannot cache status, request not found"),
        }
        result
    }

    /// Cached status of a job, without reloading it.
    pub fn status(&self, key: &JobKey) -> Result<CachedStatus> {
        self.shared.state.lock().requests.status(key)
    }

    /// True only if the request exists and its job is in memory.
    pub fn exists(&self, key: &JobKey) -> bool {
        self.shared.state.lock().requests.is_resident(key)
    }

    /// Current reference count, or `None` if the request is unknown.
    pub fn reference_count(&self, key: &JobKey) -> Option<usize> {
        self.shared
            .state
            .lock()
            .requests
            .get(key)
            .map(|entry| entry.reference_count())
    }

    /// Cached status, reference count and residency of one request.
    pub fn request(&self, key: &JobKey) -> Result<RequestSummary> {
        self.shared.state.lock().requests.summary(key)
    }

    pub fn requests(&self) -> Vec<RequestSummary> {
        self.shared.state.lock().requests.summaries()
    }

    /// Map an LRM job id (split into sub-ids when event streaming is on) to
    /// its owning job.
    pub fn register_lrm_id(&self, raw_id: &str, owner: &JobKey) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.requests.get(owner).is_none() {
            return Err(GramError::JobNotFound(*owner));
        }
        let split = self.shared.config.event_stream_enabled;
        state.lrm_ids.register(raw_id, owner, split)?;
        tracing::info!(lrm_id = raw_id, job = %owner, "Registered LRM job id");
        Ok(())
    }

    /// Remove the mapping for an exact LRM job id.
    pub fn unregister_lrm_id(&self, lrm_id: &str) -> Result<JobKey> {
        let owner = self.shared.state.lock().lrm_ids.unregister(lrm_id)?;
        tracing::info!(lrm_id, job = %owner, "Unregistered LRM job id");
        Ok(owner)
    }

    /// Drop every mapping a finished job registered for `raw_id`, split the
    /// same way [`register_lrm_id`](Self::register_lrm_id) split it.
    pub fn unregister_job_lrm_ids(&self, raw_id: &str) {
        let ids = if self.shared.config.event_stream_enabled {
            split_subjobs(raw_id)
        } else {
            vec![raw_id]
        };
        for id in ids {
            if let Err(e) = self.unregister_lrm_id(id) {
                tracing::debug!(lrm_id = id, error = %e, "LRM job id already unregistered");
            }
        }
    }

    pub fn resolve_lrm_id(&self, lrm_id: &str) -> Result<JobKey> {
        self.shared.state.lock().lrm_ids.resolve(lrm_id)
    }

    /// Copy of every registered LRM job id.
    pub fn lrm_ids(&self) -> Vec<String> {
        self.shared.state.lock().lrm_ids.ids()
    }

    /// Earliest LRM event timestamp any restored job may have missed.
    pub fn last_event_floor(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().last_event_floor
    }

    fn lower_event_floor(&self, candidate: DateTime<Utc>) {
        let mut state = self.shared.state.lock();
        state.last_event_floor = Some(match state.last_event_floor {
            Some(current) => current.min(candidate),
            None => candidate,
        });
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.state.lock().stopping
    }

    pub fn is_drained(&self) -> bool {
        self.shared.state.lock().drained
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let state = self.shared.state.lock();
        ManagerSnapshot {
            stopping: state.stopping,
            drained: state.drained,
            requests: state.requests.len(),
            lrm_ids: state.lrm_ids.len(),
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// A reference taken on the table whose job has not reached the caller yet.
///
/// Dropped without [`disarm`](Self::disarm), for example when the acquiring
/// future is cancelled or the reload fails, it gives the reference back and
/// wakes anyone waiting on its reload.
struct PendingReference<'a> {
    manager: &'a JobManager,
    key: JobKey,
    loading: Option<Arc<Notify>>,
    armed: bool,
}

impl<'a> PendingReference<'a> {
    fn new(manager: &'a JobManager, key: JobKey) -> Self {
        Self {
            manager,
            key,
            loading: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingReference<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let loader = self.loading.is_some();
        self.manager
            .shared
            .state
            .lock()
            .requests
            .rollback_acquire(&self.key, loader);
        if let Some(notify) = self.loading.take() {
            notify.notify_waiters();
        }
    }
}
