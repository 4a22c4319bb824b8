use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{GramError, Result};
use crate::manager::{JobManager, StopReport};
use crate::registry::{JobKey, JobPhase, JobRecord, StopReason};
use crate::store::{FileStore, JobStore};
use crate::timer::PollTrigger;
use crate::worker::JobPoller;

/// How long shutdown waits for stopped jobs to leave before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure code recorded when a submission cannot register its LRM job id.
pub const FAILURE_LRM_ID_REJECTED: i32 = 1;

/// Completion notice from the LRM for one job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LrmEvent {
    Done,
    Failed { failure_code: i32 },
}

/// The job manager service: job manager, state files, per-job pollers and
/// the HTTP status surface.
#[derive(Clone, Debug)]
pub struct GramService {
    manager: JobManager,
}

impl GramService {
    /// Create the service on the configured state directory, creating the
    /// directory if needed.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let store = FileStore::from_config(&config);
        store.ensure_dir()?;
        tracing::info!(dir = %store.dir().display(), "Using state directory");
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: ManagerConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        Ok(Self {
            manager: JobManager::new(config, store)?,
        })
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Restore persisted jobs and start a poller for each.
    ///
    /// Arms the grace period timer when nothing was restored, so an idle
    /// service drains on its own.
    pub async fn start(&self) -> Result<Vec<JobKey>> {
        let restored = self.manager.load_all().await?;

        for key in &restored {
            let lease = match self.manager.acquire(key, "restart").await {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "Restored job vanished before its poller started");
                    continue;
                }
            };
            let trigger = lease
                .lock()
                .poll_timer
                .get_or_insert_with(PollTrigger::new)
                .clone();
            self.spawn_poller(*key, trigger);
            lease.release()?;
        }

        if restored.is_empty() {
            self.manager.arm_grace_period_timer();
        }
        Ok(restored)
    }

    /// Accept a new job already submitted to the LRM as `lrm_id`.
    ///
    /// The job goes START → SUBMIT → POLL2, its LRM ids are registered and
    /// its state is written so a restart finds it.
    pub async fn submit_job(&self, lrm_id: &str) -> Result<JobKey> {
        let key = JobKey::generate();
        let mut record = JobRecord::new(key);
        record.poll_timer = Some(PollTrigger::new());

        self.manager.add_request(record)?;
        self.submit_request(&key, lrm_id).await?;
        Ok(key)
    }

    /// Carry a request added with [`JobManager::add_request`] through
    /// submission.
    ///
    /// A stop that reached the request before this takes its lease wins:
    /// the job keeps its STOP phase and its poller saves it for restart.
    pub async fn submit_request(&self, key: &JobKey, lrm_id: &str) -> Result<()> {
        let key = *key;
        let lease = self.manager.acquire(&key, "submit").await?;
        let trigger = {
            let mut job = lease.lock();
            if job.phase == JobPhase::Start {
                job.phase = JobPhase::Submit;
            }
            job.lrm_job_id = Some(lrm_id.to_string());
            job.poll_timer.get_or_insert_with(PollTrigger::new).clone()
        };

        if let Err(e) = self.manager.register_lrm_id(lrm_id, &key) {
            let status = {
                let mut job = lease.lock();
                job.phase = JobPhase::FailedDone;
                job.failure_code = FAILURE_LRM_ID_REJECTED;
                job.status()
            };
            let _ = self.manager.set_status(&key, status);
            lease.release()?;
            return Err(e);
        }

        let (record, status) = {
            let mut job = lease.lock();
            if job.phase == JobPhase::Submit {
                job.phase = JobPhase::Poll2;
                job.restart_phase = JobPhase::Poll2;
            }
            (job.clone(), job.status())
        };
        if let Err(e) = self.save(record).await {
            tracing::warn!(job = %key, error = %e, "Could not write state file for new job");
        }
        self.manager.set_status(&key, status)?;

        tracing::info!(job = %key, lrm_id, phase = %status.phase, "Job submitted");
        if status.phase == JobPhase::Stop {
            trigger.fire_now();
        }
        self.spawn_poller(key, trigger);
        lease.release()?;
        Ok(())
    }

    /// Route an LRM completion event to the job owning `lrm_id`.
    ///
    /// The job moves to DONE or FAILED_DONE, its LRM ids are unregistered
    /// and its state file removed; releasing the lease then removes it from
    /// the registry.
    pub async fn deliver_event(&self, lrm_id: &str, event: LrmEvent) -> Result<JobKey> {
        let lease = self.manager.acquire_by_lrm_id(lrm_id, "lrm event").await?;
        let key = *lease.key();

        let (raw_id, status, trigger) = {
            let mut job = lease.lock();
            if job.phase.is_terminal() || job.phase == JobPhase::Stop {
                tracing::debug!(job = %key, phase = %job.phase, "Ignoring event for finished job");
                drop(job);
                lease.release()?;
                return Ok(key);
            }
            match event {
                LrmEvent::Done => {
                    job.phase = JobPhase::Done;
                }
                LrmEvent::Failed { failure_code } => {
                    job.phase = JobPhase::FailedDone;
                    job.failure_code = failure_code;
                }
            }
            job.last_event_at = Some(Utc::now());
            job.unsent_status_change = true;
            (job.lrm_job_id.clone(), job.status(), job.poll_timer.clone())
        };
        tracing::info!(job = %key, lrm_id, phase = %status.phase, "LRM event delivered");

        self.manager
            .unregister_job_lrm_ids(raw_id.as_deref().unwrap_or(lrm_id));

        let store = self.manager.store().clone();
        let removed = tokio::task::spawn_blocking(move || store.remove(&key))
            .await
            .map_err(|e| GramError::Internal(format!("state file remove task failed: {e}")))
            .and_then(|result| result);
        if let Err(e) = removed {
            tracing::warn!(job = %key, error = %e, "Could not remove state file");
        }

        self.manager.set_status(&key, status)?;
        if let Some(trigger) = trigger {
            trigger.fire_now();
        }
        lease.release()?;
        Ok(key)
    }

    /// Stop every job and wait for the registry to drain.
    ///
    /// Returns false if jobs were still present after the drain timeout.
    pub async fn shutdown(&self, reason: StopReason) -> bool {
        self.shutdown_with_timeout(reason, DRAIN_TIMEOUT).await.1
    }

    pub async fn shutdown_with_timeout(
        &self,
        reason: StopReason,
        timeout: Duration,
    ) -> (StopReport, bool) {
        let report = self.manager.stop_all_jobs(reason).await;
        let drained = tokio::time::timeout(timeout, self.manager.wait_drained())
            .await
            .is_ok();
        if drained {
            tracing::info!("All jobs stopped");
        } else {
            tracing::warn!(
                remaining = self.manager.requests().len(),
                "Timed out waiting for jobs to stop"
            );
        }
        (report, drained)
    }

    /// Run the service until it drains on its own or `shutdown` fires.
    ///
    /// 1. Restores persisted jobs and starts their pollers
    /// 2. Starts the HTTP status surface if configured
    /// 3. Waits for the grace period to drain an idle service, or for a
    ///    shutdown signal, which stops every job first
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let restored = self.start().await?;
        tracing::info!(
            restored = restored.len(),
            event_stream = self.manager.config().event_stream_enabled,
            "Job manager running"
        );

        if let Some(addr) = self.manager.config().dashboard_addr {
            let state = DashboardState {
                service: self.clone(),
            };
            tokio::spawn(async move {
                run_dashboard(addr, state).await;
            });
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested, stopping all jobs");
                self.shutdown(StopReason::Shutdown).await;
            }
            _ = self.manager.wait_drained() => {
                tracing::info!("No jobs left after grace period, exiting");
            }
        }
        Ok(())
    }

    fn spawn_poller(&self, key: JobKey, trigger: PollTrigger) {
        let poller = JobPoller::new(self.manager.clone(), key, trigger);
        tokio::spawn(poller.run());
    }

    async fn save(&self, record: JobRecord) -> Result<()> {
        let store = self.manager.store().clone();
        tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .map_err(|e| GramError::Internal(format!("state file write task failed: {e}")))?
    }
}
