use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{GramError, Result};
use crate::registry::job::{CachedStatus, JobKey, JobRecord};
use crate::timer::{PollTrigger, TimerHandle};

/// A job record shared between the registry and lease holders.
pub type SharedJob = Arc<Mutex<JobRecord>>;

/// Registry entry for one job contact.
///
/// `job` is `None` while the job is swapped out; `status` stays current
/// either way.
#[derive(Debug)]
pub struct RequestRef {
    key: JobKey,
    job: Option<SharedJob>,
    reference_count: usize,
    status: CachedStatus,
    swap_out_timer: Option<TimerHandle>,
    // Poll timer detached from a swapped-out job, reattached on reload.
    parked_poll_timer: Option<PollTrigger>,
    loading: Option<Arc<Notify>>,
    // Set while a swap-out writes the state file; new leases wait on it.
    saving: Option<Arc<Notify>>,
    // Bumped on every lease acquisition so a swap-out can tell whether a
    // lease came and went while it was writing the state file.
    lease_epoch: u64,
}

impl RequestRef {
    fn new(job: JobRecord) -> Self {
        Self {
            key: job.key,
            status: job.status(),
            job: Some(Arc::new(Mutex::new(job))),
            reference_count: 0,
            swap_out_timer: None,
            parked_poll_timer: None,
            loading: None,
            saving: None,
            lease_epoch: 0,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    pub fn status(&self) -> CachedStatus {
        self.status
    }

    pub fn is_resident(&self) -> bool {
        self.job.is_some()
    }

    fn summary(&self) -> RequestSummary {
        RequestSummary {
            key: self.key,
            status: self.status,
            reference_count: self.reference_count,
            resident: self.is_resident(),
        }
    }

    fn cancel_swap_out(&mut self) {
        if let Some(timer) = self.swap_out_timer.take() {
            timer.cancel();
        }
    }
}

/// What a lease acquisition has to do next.
#[derive(Debug)]
pub enum AcquireStep {
    /// The job is in memory.
    Resident(SharedJob),
    /// Another caller is reloading the job, or a swap-out is writing its
    /// state file; wait and look again.
    Wait(Arc<Notify>),
    /// The caller must reload the job and hand it to
    /// [`RequestTable::finish_load`], waking the notify afterwards.
    Load(Arc<Notify>),
}

/// Result of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other references remain.
    Referenced(usize),
    /// The job finished and its entry is gone.
    Removed { now_empty: bool },
    /// Idle in the poll-wait phase: arm the swap-out timer.
    SwapOutCandidate,
    /// Idle but must stay in memory.
    Retained,
}

/// State snapshot to persist for a swap-out.
#[derive(Debug)]
pub struct SwapOutTicket {
    pub record: JobRecord,
    epoch: u64,
    done: Arc<Notify>,
}

impl SwapOutTicket {
    /// Wake the leases that queued up behind the write. Call after
    /// [`RequestTable::finish_swap_out`].
    pub fn wake_waiters(&self) {
        self.done.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    Swapped,
    /// A lease arrived during the write, or the write failed.
    KeptResident,
    Gone,
}

/// Summary row for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub key: JobKey,
    pub status: CachedStatus,
    pub reference_count: usize,
    pub resident: bool,
}

/// Reference-counted table of job requests.
///
/// Pure bookkeeping: callers hold the manager lock around every method and
/// perform I/O and timer work based on the returned outcomes.
#[derive(Debug)]
pub struct RequestTable {
    requests: HashMap<JobKey, RequestRef>,
    max_requests: usize,
}

impl RequestTable {
    pub fn with_capacity(max_requests: usize) -> Self {
        Self {
            requests: HashMap::new(),
            max_requests,
        }
    }

    /// Insert a resident job with no references.
    pub fn insert(&mut self, job: JobRecord) -> Result<()> {
        if self.requests.contains_key(&job.key) {
            return Err(GramError::DuplicateJob(job.key));
        }
        if self.requests.len() >= self.max_requests {
            return Err(GramError::ResourceExhausted(format!(
                "request table is at capacity ({})",
                self.max_requests
            )));
        }
        self.requests.insert(job.key, RequestRef::new(job));
        Ok(())
    }

    pub fn get(&self, key: &JobKey) -> Option<&RequestRef> {
        self.requests.get(key)
    }

    /// Take a reference and say how to reach the job.
    pub fn acquire(&mut self, key: &JobKey) -> Result<AcquireStep> {
        let entry = self
            .requests
            .get_mut(key)
            .ok_or(GramError::JobNotFound(*key))?;
        entry.reference_count += 1;
        entry.lease_epoch += 1;
        entry.cancel_swap_out();
        Ok(Self::next_step(entry))
    }

    /// Look again after waiting on another caller's reload. The reference
    /// taken by [`acquire`](Self::acquire) is kept.
    pub fn resume_acquire(&mut self, key: &JobKey) -> Result<AcquireStep> {
        let entry = self
            .requests
            .get_mut(key)
            .ok_or(GramError::JobNotFound(*key))?;
        Ok(Self::next_step(entry))
    }

    fn next_step(entry: &mut RequestRef) -> AcquireStep {
        if let Some(notify) = &entry.saving {
            return AcquireStep::Wait(notify.clone());
        }
        if let Some(job) = &entry.job {
            return AcquireStep::Resident(job.clone());
        }
        if let Some(notify) = &entry.loading {
            return AcquireStep::Wait(notify.clone());
        }
        let notify = Arc::new(Notify::new());
        entry.loading = Some(notify.clone());
        AcquireStep::Load(notify)
    }

    /// Publish a reloaded job. The job resumes from its restart phase.
    pub fn finish_load(&mut self, key: &JobKey, mut record: JobRecord) -> Result<SharedJob> {
        let entry = self
            .requests
            .get_mut(key)
            .ok_or(GramError::JobNotFound(*key))?;
        entry.loading = None;
        record.phase = record.restart_phase;
        if record.poll_timer.is_none() {
            record.poll_timer = entry.parked_poll_timer.take();
        }
        let job = Arc::new(Mutex::new(record));
        entry.job = Some(job.clone());
        Ok(job)
    }

    /// Undo the reference of a caller that never got its job, because the
    /// reload failed or the caller gave up. `loader` clears the in-flight
    /// reload so the next caller starts a fresh one.
    pub fn rollback_acquire(&mut self, key: &JobKey, loader: bool) {
        if let Some(entry) = self.requests.get_mut(key) {
            if loader {
                entry.loading = None;
            }
            entry.reference_count = entry.reference_count.saturating_sub(1);
        }
    }

    /// Drop one reference and decide what happens to an idle entry.
    ///
    /// `swap_out_enabled` is whether poll-wait jobs may leave memory at all.
    pub fn release(&mut self, key: &JobKey, swap_out_enabled: bool) -> Result<ReleaseOutcome> {
        let entry = self
            .requests
            .get_mut(key)
            .ok_or(GramError::JobNotFound(*key))?;
        if entry.reference_count == 0 {
            return Err(GramError::NotReferenced(*key));
        }
        entry.reference_count -= 1;
        if entry.reference_count > 0 {
            return Ok(ReleaseOutcome::Referenced(entry.reference_count));
        }

        // No lease is left, so nothing holds the job lock for long.
        if let Some(status) = entry
            .job
            .as_ref()
            .and_then(|job| job.try_lock().map(|job| job.status()))
        {
            entry.status = status;
        }

        let phase = entry.status.phase;
        if phase.is_terminal() {
            if let Some(mut removed) = self.requests.remove(key) {
                removed.cancel_swap_out();
            }
            return Ok(ReleaseOutcome::Removed {
                now_empty: self.requests.is_empty(),
            });
        }
        if phase.is_poll_wait() && swap_out_enabled && entry.job.is_some() {
            return Ok(ReleaseOutcome::SwapOutCandidate);
        }
        Ok(ReleaseOutcome::Retained)
    }

    /// Remember the armed swap-out timer, replacing any older one.
    pub fn set_swap_out_timer(&mut self, key: &JobKey, timer: TimerHandle) {
        match self.requests.get_mut(key) {
            Some(entry) if entry.reference_count == 0 => {
                entry.cancel_swap_out();
                entry.swap_out_timer = Some(timer);
            }
            _ => {
                timer.cancel();
            }
        }
    }

    /// Start a swap-out for the timer `timer_id`.
    ///
    /// Returns `None` when the timer was superseded or cancelled, a lease is
    /// held, or the job is not in memory.
    pub fn begin_swap_out(&mut self, key: &JobKey, timer_id: u64) -> Option<SwapOutTicket> {
        let entry = self.requests.get_mut(key)?;
        match &entry.swap_out_timer {
            Some(timer) if timer.id() == timer_id => {}
            _ => return None,
        }
        entry.swap_out_timer = None;
        if entry.reference_count != 0 || entry.saving.is_some() {
            return None;
        }
        let job = entry.job.as_ref()?;
        let record = {
            let mut job = job.try_lock()?;
            job.restart_phase = job.phase;
            job.clone()
        };
        let done = Arc::new(Notify::new());
        entry.saving = Some(done.clone());
        Some(SwapOutTicket {
            record,
            epoch: entry.lease_epoch,
            done,
        })
    }

    /// Finish a swap-out once the state file write has completed.
    ///
    /// Leases taken during the write are parked until this runs, so the job
    /// is untouched while its file is written. If any arrived, the job stays
    /// in memory and they find it resident.
    pub fn finish_swap_out(&mut self, ticket: &SwapOutTicket, saved: bool) -> SwapOutcome {
        let Some(entry) = self.requests.get_mut(&ticket.record.key) else {
            return SwapOutcome::Gone;
        };
        entry.saving = None;
        if !saved || entry.reference_count != 0 || entry.lease_epoch != ticket.epoch {
            return SwapOutcome::KeptResident;
        }
        if let Some(job) = entry.job.take() {
            let poll_timer = job.lock().poll_timer.take();
            entry.parked_poll_timer = poll_timer;
        }
        SwapOutcome::Swapped
    }

    pub fn set_status(&mut self, key: &JobKey, status: CachedStatus) -> Result<()> {
        let entry = self
            .requests
            .get_mut(key)
            .ok_or(GramError::JobNotFound(*key))?;
        entry.status = status;
        Ok(())
    }

    pub fn status(&self, key: &JobKey) -> Result<CachedStatus> {
        self.requests
            .get(key)
            .map(|entry| entry.status)
            .ok_or(GramError::JobNotFound(*key))
    }

    /// True only if the entry exists and its job is in memory.
    pub fn is_resident(&self, key: &JobKey) -> bool {
        self.requests.get(key).is_some_and(RequestRef::is_resident)
    }

    pub fn keys(&self) -> Vec<JobKey> {
        self.requests.keys().copied().collect()
    }

    pub fn summary(&self, key: &JobKey) -> Result<RequestSummary> {
        self.requests
            .get(key)
            .map(RequestRef::summary)
            .ok_or(GramError::JobNotFound(*key))
    }

    pub fn summaries(&self) -> Vec<RequestSummary> {
        let mut rows: Vec<RequestSummary> = self.requests.values().map(RequestRef::summary).collect();
        rows.sort_by_key(|row| row.key);
        rows
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
