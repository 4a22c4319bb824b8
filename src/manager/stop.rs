use crate::manager::{JobLease, JobManager};
use crate::registry::requests::AcquireStep;
use crate::registry::{CachedStatus, JobKey, JobPhase, StopReason};

/// What [`JobManager::stop_all_jobs`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Jobs moved to the STOP phase.
    pub stopped: Vec<JobKey>,
    /// Jobs already done, failing or stopped. They keep their phase but
    /// still record the stop reason and get their poll timer fired.
    pub untouched: Vec<JobKey>,
    /// Jobs that could not be brought back into memory.
    pub failed: Vec<JobKey>,
}

impl JobManager {
    /// Stop accepting work and force every job into the STOP phase.
    ///
    /// Every job is leased first, which reloads swapped-out jobs, then
    /// moved according to [`JobPhase::stop_transition`] under its own lock,
    /// then released so the usual zero-crossing rules apply. Use
    /// [`wait_drained`](Self::wait_drained) to wait for the jobs to leave.
    ///
    /// [`JobPhase::stop_transition`]: crate::registry::JobPhase::stop_transition
    pub async fn stop_all_jobs(&self, reason: StopReason) -> StopReport {
        let steps: Vec<(JobKey, AcquireStep)> = {
            let mut state = self.shared.state.lock();
            state.stopping = true;
            tracing::info!(reason = %reason, requests = state.requests.len(), "Stopping all jobs");

            if state.requests.is_empty() {
                self.mark_drained(&mut state);
            }
            let mut steps = Vec::with_capacity(state.requests.len());
            for key in state.requests.keys() {
                if let Ok(step) = state.requests.acquire(&key) {
                    steps.push((key, step));
                }
            }
            steps
        };

        let mut report = StopReport::default();
        let mut leases: Vec<JobLease> = Vec::with_capacity(steps.len());
        for (key, step) in steps {
            match self.finish_acquire(key, step, "stop all jobs").await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    tracing::error!(job = %key, error = %e, "Could not load job to stop it");
                    report.failed.push(key);
                }
            }
        }

        for lease in &leases {
            let key = *lease.key();
            let status = {
                let mut job = lease.lock();
                job.stop_reason = Some(reason);
                if job.phase != JobPhase::Stop {
                    job.restart_phase = job.phase;
                }
                // Every job is nudged, so failing ones run on to FAILED_DONE.
                if let Some(trigger) = &job.poll_timer {
                    trigger.fire_now();
                }

                let Some(transition) = job.phase.stop_transition() else {
                    tracing::debug!(job = %key, phase = %job.phase, "Job needs no stop");
                    report.untouched.push(key);
                    continue;
                };

                tracing::info!(job = %key, from = %job.phase, to = %transition.next, "Stopping job");
                job.phase = transition.next;
                if transition.unsent_status_change {
                    job.unsent_status_change = true;
                }
                if transition.reregister && job.poll_timer.is_some() {
                    tracing::debug!(job = %key, "Re-registering poll-wait job with the state machine");
                }
                job.status()
            };
            self.cache_stop_status(&key, status);
            report.stopped.push(key);
        }

        for lease in leases {
            if let Err(e) = lease.release() {
                tracing::warn!(error = %e, "Failed to release stop lease");
            }
        }

        tracing::info!(
            stopped = report.stopped.len(),
            untouched = report.untouched.len(),
            failed = report.failed.len(),
            "Stop requested for all jobs"
        );
        report
    }

    fn cache_stop_status(&self, key: &JobKey, status: CachedStatus) {
        if let Err(e) = self.shared.state.lock().requests.set_status(key, status) {
            tracing::debug!(job = %key, error = %e, "Could not cache stop status");
        }
    }
}
