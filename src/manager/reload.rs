use std::io::ErrorKind;

use crate::error::{GramError, Result};
use crate::manager::JobManager;
use crate::registry::{JobKey, JobRecord};

impl JobManager {
    /// Restore every job found in the state directory.
    ///
    /// Each job comes back resident with no references, resumed at its
    /// restart phase, with its LRM ids registered again. Files that fail to
    /// load are skipped. A missing state directory means nothing to restore.
    ///
    /// Returns the keys that were restored.
    pub async fn load_all(&self) -> Result<Vec<JobKey>> {
        let store = self.store().clone();
        let scanned = tokio::task::spawn_blocking(move || {
            let keys = store.enumerate_keys()?;
            let loaded: Vec<(JobKey, Result<JobRecord>)> =
                keys.into_iter().map(|key| (key, store.load(&key))).collect();
            Ok::<_, GramError>(loaded)
        })
        .await
        .map_err(|e| GramError::Internal(format!("state directory scan task failed: {e}")))?;

        let loaded = match scanned {
            Ok(loaded) => loaded,
            Err(GramError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("State directory does not exist, no jobs to restore");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut restored = Vec::with_capacity(loaded.len());
        for (key, result) in loaded {
            let mut record = match result {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(job = %key, error = %e, "Skipping unreadable state file");
                    continue;
                }
            };
            record.phase = record.restart_phase;
            let lrm_id = record.lrm_job_id.clone();
            let floor = record.event_replay_floor();

            if let Err(e) = self.add_request(record) {
                tracing::warn!(job = %key, error = %e, "Could not restore job");
                if matches!(e, GramError::Stopping) {
                    break;
                }
                continue;
            }
            if let Some(lrm_id) = lrm_id {
                if let Err(e) = self.register_lrm_id(&lrm_id, &key) {
                    tracing::warn!(job = %key, lrm_id = %lrm_id, error = %e, "Could not register LRM job id of restored job");
                }
            }
            self.lower_event_floor(floor);
            restored.push(key);
        }

        tracing::info!(
            restored = restored.len(),
            floor = ?self.last_event_floor(),
            "Restored jobs from state directory"
        );
        Ok(restored)
    }
}
