use std::collections::HashMap;

use crate::error::{GramError, Result};
use crate::registry::job::JobKey;

/// Split a raw LRM job id into its comma separated sub-ids. Empty pieces
/// are skipped.
pub fn split_subjobs(raw: &str) -> Vec<&str> {
    raw.split(',').filter(|id| !id.is_empty()).collect()
}

/// Maps LRM-native job ids to the job contact that owns them.
#[derive(Debug, Default)]
pub struct LrmIdTable {
    ids: HashMap<String, JobKey>,
}

impl LrmIdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `raw` for `owner`. With `split` set, every comma separated
    /// sub-id is registered on its own.
    ///
    /// Sub-ids already owned by `owner` are left as they are. A sub-id owned
    /// by another job fails the call; sub-ids registered before the conflict
    /// stay registered.
    pub fn register(&mut self, raw: &str, owner: &JobKey, split: bool) -> Result<()> {
        let ids = if split { split_subjobs(raw) } else { vec![raw] };

        for id in ids {
            match self.ids.get(id) {
                Some(existing) if existing != owner => {
                    tracing::error!(
                        lrm_id = id,
                        owner = %existing,
                        requested_by = %owner,
                        "LRM job id is registered with a different job contact"
                    );
                    return Err(GramError::LrmIdConflict {
                        lrm_id: id.to_string(),
                        owner: *existing,
                    });
                }
                Some(_) => {
                    tracing::debug!(lrm_id = id, owner = %owner, "LRM job id already registered");
                }
                None => {
                    self.ids.insert(id.to_string(), *owner);
                }
            }
        }
        Ok(())
    }

    /// Remove an exact id (no splitting).
    pub fn unregister(&mut self, lrm_id: &str) -> Result<JobKey> {
        self.ids
            .remove(lrm_id)
            .ok_or_else(|| GramError::LrmIdNotFound(lrm_id.to_string()))
    }

    pub fn resolve(&self, lrm_id: &str) -> Result<JobKey> {
        self.ids
            .get(lrm_id)
            .copied()
            .ok_or_else(|| GramError::LrmIdNotFound(lrm_id.to_string()))
    }

    /// Snapshot of every registered id.
    pub fn ids(&self) -> Vec<String> {
        self.ids.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
