use std::time::Duration;

use crate::error::GramError;
use crate::manager::{JobLease, JobManager};
use crate::registry::{CachedStatus, JobKey, JobPhase};
use crate::timer::PollTrigger;

/// What a poll pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// The job is still live; wait for the next wakeup.
    Continue,
    /// The job left the registry or reached a terminal phase.
    Finished,
}

/// Drives one job request between LRM events.
///
/// The poller sleeps until its [`PollTrigger`] fires or, with event
/// streaming off, until the next poll interval. On each wakeup it leases the
/// job, acts on its phase and releases the lease again, so an idle job in
/// the poll-wait phase holds no reference and may be swapped out.
pub struct JobPoller {
    manager: JobManager,
    key: JobKey,
    trigger: PollTrigger,
    interval: Option<Duration>,
}

impl JobPoller {
    pub fn new(manager: JobManager, key: JobKey, trigger: PollTrigger) -> Self {
        let interval = if manager.config().event_stream_enabled {
            None
        } else {
            Some(manager.config().poll_interval)
        };
        Self {
            manager,
            key,
            trigger,
            interval,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Run until the job leaves the registry.
    pub async fn run(self) {
        tracing::debug!(job = %self.key, interval = ?self.interval, "Poller started");
        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                _ = self.trigger.fired() => {
                    tracing::debug!(job = %self.key, "Poll timer fired early");
                }
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }

            if self.poll_once().await == PollStep::Finished {
                break;
            }
        }
        tracing::debug!(job = %self.key, "Poller finished");
    }

    /// Lease the job once and act on its current phase.
    pub async fn poll_once(&self) -> PollStep {
        let lease = match self.manager.acquire(&self.key, "poll").await {
            Ok(lease) => lease,
            Err(e) if e.is_not_found() => return PollStep::Finished,
            Err(e) => {
                tracing::warn!(job = %self.key, error = %e, "Could not lease job for polling");
                return PollStep::Continue;
            }
        };

        let phase = lease.lock().phase;
        match phase {
            JobPhase::Stop => self.finish_stop(lease).await,
            phase if phase.is_failing() => self.finish_failure(lease).await,
            phase if phase.is_terminal() => {
                self.release(lease);
                PollStep::Finished
            }
            JobPhase::Poll2 => {
                // Without an event stream this is where the LRM would be
                // queried; completion arrives through event delivery.
                tracing::trace!(job = %self.key, "Polled job");
                self.release(lease);
                PollStep::Continue
            }
            _ => {
                self.release(lease);
                PollStep::Continue
            }
        }
    }

    /// Persist a stopped job so a restart resumes it, then let it leave.
    async fn finish_stop(&self, lease: JobLease) -> PollStep {
        let record = lease.lock().clone();
        let store = self.manager.store().clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .map_err(|e| GramError::Internal(format!("state file write task failed: {e}")))
            .and_then(|result| result);

        match saved {
            Ok(()) => {
                tracing::info!(job = %self.key, "Stopped job saved for restart");
            }
            Err(e) => {
                tracing::error!(job = %self.key, error = %e, "Failed to save stopped job");
            }
        }

        let status = {
            let mut job = lease.lock();
            job.phase = JobPhase::Done;
            job.unsent_status_change = false;
            job.status()
        };
        self.cache(status);
        self.release(lease);
        PollStep::Finished
    }

    /// Run a failing job on to FAILED_DONE: its LRM ids and state file go
    /// away and releasing the lease removes it.
    async fn finish_failure(&self, lease: JobLease) -> PollStep {
        let (lrm_id, status) = {
            let mut job = lease.lock();
            tracing::info!(job = %self.key, from = %job.phase, "Failed job cleaned up");
            job.phase = JobPhase::FailedDone;
            job.unsent_status_change = true;
            (job.lrm_job_id.clone(), job.status())
        };
        if let Some(lrm_id) = lrm_id {
            self.manager.unregister_job_lrm_ids(&lrm_id);
        }

        let store = self.manager.store().clone();
        let key = self.key;
        let removed = tokio::task::spawn_blocking(move || store.remove(&key))
            .await
            .map_err(|e| GramError::Internal(format!("state file remove task failed: {e}")))
            .and_then(|result| result);
        if let Err(e) = removed {
            tracing::warn!(job = %self.key, error = %e, "Could not remove state file");
        }

        self.cache(status);
        self.release(lease);
        PollStep::Finished
    }

    fn cache(&self, status: CachedStatus) {
        if let Err(e) = self.manager.set_status(&self.key, status) {
            tracing::debug!(job = %self.key, error = %e, "Could not cache job status");
        }
    }

    fn release(&self, lease: JobLease) {
        if let Err(e) = lease.release() {
            tracing::warn!(job = %self.key, error = %e, "Failed to release poll lease");
        }
    }
}

impl std::fmt::Debug for JobPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPoller")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .finish()
    }
}
