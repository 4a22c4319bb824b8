use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GramError;
use crate::registry::phase::JobPhase;
use crate::timer::PollTrigger;

/// Job contact key: two unique 64-bit numbers, rendered as `/<u1>/<u2>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub uniq1: u64,
    pub uniq2: u64,
}

impl JobKey {
    pub fn new(uniq1: u64, uniq2: u64) -> Self {
        Self { uniq1, uniq2 }
    }

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            uniq1: rng.gen(),
            uniq2: rng.gen(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}/", self.uniq1, self.uniq2)
    }
}

impl FromStr for JobKey {
    type Err = GramError;

    /// Accepts `/<u1>/<u2>/` as well as the forms without the leading or
    /// trailing slash.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        let mut parts = trimmed.split('/');

        let parse = |part: Option<&str>| -> Option<u64> {
            let part = part?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            part.parse().ok()
        };

        match (parse(parts.next()), parse(parts.next()), parts.next()) {
            (Some(uniq1), Some(uniq2), None) => Ok(Self { uniq1, uniq2 }),
            _ => Err(GramError::InvalidJobKey(s.to_string())),
        }
    }
}

/// Why a manager-wide stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The job manager credential expired.
    CredentialExpired,
    /// Administrative shutdown of the service.
    Shutdown,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::CredentialExpired => write!(f, "credential_expired"),
            StopReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Coarse status kept on the registry entry, readable without reloading a
/// swapped-out job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedStatus {
    pub phase: JobPhase,
    pub failure_code: i32,
}

/// Full mutable state of one job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub phase: JobPhase,
    /// Phase to resume from when the job is reloaded from its state file.
    pub restart_phase: JobPhase,
    pub failure_code: i32,
    pub stop_reason: Option<StopReason>,
    pub unsent_status_change: bool,
    /// Raw LRM job id, possibly a comma separated list of sub-ids.
    pub lrm_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last LRM event delivered to this job.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Poll timer owned by the state machine. Never persisted.
    #[serde(skip)]
    pub poll_timer: Option<PollTrigger>,
}

impl JobRecord {
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            phase: JobPhase::Start,
            restart_phase: JobPhase::Start,
            failure_code: 0,
            stop_reason: None,
            unsent_status_change: false,
            lrm_job_id: None,
            created_at: Utc::now(),
            last_event_at: None,
            poll_timer: None,
        }
    }

    pub fn status(&self) -> CachedStatus {
        CachedStatus {
            phase: self.phase,
            failure_code: self.failure_code,
        }
    }

    /// Earliest point from which LRM events for this job may need replaying.
    pub fn event_replay_floor(&self) -> DateTime<Utc> {
        self.last_event_at.unwrap_or(self.created_at)
    }
}
