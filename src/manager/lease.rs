use parking_lot::MutexGuard;

use crate::error::Result;
use crate::manager::JobManager;
use crate::registry::{JobKey, JobRecord, SharedJob};

/// A counted reference to a job request.
///
/// While a lease is alive the job stays in memory and its entry cannot be
/// removed. Release it with [`release`](Self::release) to see errors;
/// dropping it releases too and only logs them.
#[must_use = "dropping a lease releases the reference immediately"]
pub struct JobLease {
    manager: JobManager,
    key: JobKey,
    job: SharedJob,
    reason: String,
    released: bool,
}

impl JobLease {
    pub(super) fn new(manager: JobManager, key: JobKey, job: SharedJob, reason: &str) -> Self {
        Self {
            manager,
            key,
            job,
            reason: reason.to_string(),
            released: false,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Lock the job record. Do not hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, JobRecord> {
        self.job.lock()
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release_reference(&self.key, &self.reason)
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release_reference(&self.key, &self.reason) {
            tracing::warn!(job = %self.key, error = %e, "Failed to release dropped lease");
        }
    }
}

impl std::fmt::Debug for JobLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLease")
            .field("key", &self.key)
            .field("reason", &self.reason)
            .finish()
    }
}
