use thiserror::Error;

use crate::registry::JobKey;

#[derive(Error, Debug)]
pub enum GramError {
    #[error("Job contact not found: {0}")]
    JobNotFound(JobKey),

    #[error("LRM job id not found: {0}")]
    LrmIdNotFound(String),

    #[error("LRM job id {lrm_id} is registered with a different job contact ({owner})")]
    LrmIdConflict { lrm_id: String, owner: JobKey },

    #[error("Job contact already registered: {0}")]
    DuplicateJob(JobKey),

    #[error("Job manager is stopping")]
    Stopping,

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Job {0} holds no references")]
    NotReferenced(JobKey),

    #[error("Invalid job contact: {0}")]
    InvalidJobKey(String),

    #[error("State file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GramError {
    /// True for the "not found" family (unknown job contact or LRM id).
    pub fn is_not_found(&self) -> bool {
        matches!(self, GramError::JobNotFound(_) | GramError::LrmIdNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, GramError>;
