use serde::{Deserialize, Serialize};

/// Job manager phase of a single job request.
///
/// Transitions between phases belong to the job state machine. The registry
/// only reads the phase when the last reference is dropped and forces it
/// during shutdown (see [`JobPhase::stop_transition`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Start,
    TwoPhase,
    TwoPhaseCommitted,
    StageIn,
    Submit,
    Poll1,
    Poll2,
    PollQuery1,
    PollQuery2,
    ProxyRefresh,
    PreCloseOutput,
    TwoPhaseQuery1,
    TwoPhaseQuery2,
    TwoPhaseProxyRefresh,
    StageOut,
    CloseOutput,
    TwoPhaseEnd,
    TwoPhaseEndCommitted,
    FileCleanUp,
    ScratchCleanUp,
    CacheCleanUp,
    Done,
    Failed,
    FailedCloseOutput,
    FailedTwoPhase,
    FailedTwoPhaseCommitted,
    FailedFileCleanUp,
    FailedScratchCleanUp,
    FailedCacheCleanUp,
    FailedDone,
    Stop,
}

/// What a forced stop does to a job in a given phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopTransition {
    pub next: JobPhase,
    /// The client has not yet been told about the new phase.
    pub unsent_status_change: bool,
    /// The state machine must run again right away to act on the stop.
    pub reregister: bool,
}

impl JobPhase {
    pub const ALL: [JobPhase; 31] = [
        JobPhase::Start,
        JobPhase::TwoPhase,
        JobPhase::TwoPhaseCommitted,
        JobPhase::StageIn,
        JobPhase::Submit,
        JobPhase::Poll1,
        JobPhase::Poll2,
        JobPhase::PollQuery1,
        JobPhase::PollQuery2,
        JobPhase::ProxyRefresh,
        JobPhase::PreCloseOutput,
        JobPhase::TwoPhaseQuery1,
        JobPhase::TwoPhaseQuery2,
        JobPhase::TwoPhaseProxyRefresh,
        JobPhase::StageOut,
        JobPhase::CloseOutput,
        JobPhase::TwoPhaseEnd,
        JobPhase::TwoPhaseEndCommitted,
        JobPhase::FileCleanUp,
        JobPhase::ScratchCleanUp,
        JobPhase::CacheCleanUp,
        JobPhase::Done,
        JobPhase::Failed,
        JobPhase::FailedCloseOutput,
        JobPhase::FailedTwoPhase,
        JobPhase::FailedTwoPhaseCommitted,
        JobPhase::FailedFileCleanUp,
        JobPhase::FailedScratchCleanUp,
        JobPhase::FailedCacheCleanUp,
        JobPhase::FailedDone,
        JobPhase::Stop,
    ];

    /// A job whose last reference is dropped in one of these phases is
    /// removed from the registry.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::FailedDone)
    }

    /// Long poll-wait phase, the only phase eligible for swap-out.
    pub fn is_poll_wait(self) -> bool {
        self == JobPhase::Poll2
    }

    /// Failure cleanup phases that end in FAILED_DONE.
    pub fn is_failing(self) -> bool {
        matches!(
            self,
            JobPhase::Failed
                | JobPhase::FailedCloseOutput
                | JobPhase::FailedTwoPhase
                | JobPhase::FailedTwoPhaseCommitted
                | JobPhase::FailedFileCleanUp
                | JobPhase::FailedScratchCleanUp
                | JobPhase::FailedCacheCleanUp
        )
    }

    /// Phase a job is forced into by a manager-wide stop.
    ///
    /// `None` means the job is already failing, done or stopped and is left
    /// alone.
    pub fn stop_transition(self) -> Option<StopTransition> {
        let stop = |unsent_status_change, reregister| StopTransition {
            next: JobPhase::Stop,
            unsent_status_change,
            reregister,
        };

        match self {
            JobPhase::Start => Some(stop(false, false)),

            JobPhase::Poll2 => Some(stop(true, true)),

            JobPhase::TwoPhase
            | JobPhase::TwoPhaseCommitted
            | JobPhase::StageIn
            | JobPhase::Submit
            | JobPhase::Poll1
            | JobPhase::PollQuery1
            | JobPhase::PollQuery2
            | JobPhase::TwoPhaseQuery1
            | JobPhase::TwoPhaseQuery2
            | JobPhase::TwoPhaseProxyRefresh
            | JobPhase::ProxyRefresh => Some(stop(true, false)),

            JobPhase::StageOut
            | JobPhase::CloseOutput
            | JobPhase::PreCloseOutput
            | JobPhase::TwoPhaseEnd
            | JobPhase::TwoPhaseEndCommitted
            | JobPhase::FileCleanUp
            | JobPhase::ScratchCleanUp
            | JobPhase::CacheCleanUp => Some(stop(false, false)),

            JobPhase::Done
            | JobPhase::Failed
            | JobPhase::FailedCloseOutput
            | JobPhase::FailedTwoPhase
            | JobPhase::FailedTwoPhaseCommitted
            | JobPhase::FailedFileCleanUp
            | JobPhase::FailedScratchCleanUp
            | JobPhase::FailedCacheCleanUp
            | JobPhase::FailedDone
            | JobPhase::Stop => None,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobPhase::Start => "start",
            JobPhase::TwoPhase => "two_phase",
            JobPhase::TwoPhaseCommitted => "two_phase_committed",
            JobPhase::StageIn => "stage_in",
            JobPhase::Submit => "submit",
            JobPhase::Poll1 => "poll1",
            JobPhase::Poll2 => "poll2",
            JobPhase::PollQuery1 => "poll_query1",
            JobPhase::PollQuery2 => "poll_query2",
            JobPhase::ProxyRefresh => "proxy_refresh",
            JobPhase::PreCloseOutput => "pre_close_output",
            JobPhase::TwoPhaseQuery1 => "two_phase_query1",
            JobPhase::TwoPhaseQuery2 => "two_phase_query2",
            JobPhase::TwoPhaseProxyRefresh => "two_phase_proxy_refresh",
            JobPhase::StageOut => "stage_out",
            JobPhase::CloseOutput => "close_output",
            JobPhase::TwoPhaseEnd => "two_phase_end",
            JobPhase::TwoPhaseEndCommitted => "two_phase_end_committed",
            JobPhase::FileCleanUp => "file_clean_up",
            JobPhase::ScratchCleanUp => "scratch_clean_up",
            JobPhase::CacheCleanUp => "cache_clean_up",
            JobPhase::Done => "done",
            JobPhase::Failed => "failed",
            JobPhase::FailedCloseOutput => "failed_close_output",
            JobPhase::FailedTwoPhase => "failed_two_phase",
            JobPhase::FailedTwoPhaseCommitted => "failed_two_phase_committed",
            JobPhase::FailedFileCleanUp => "failed_file_clean_up",
            JobPhase::FailedScratchCleanUp => "failed_scratch_clean_up",
            JobPhase::FailedCacheCleanUp => "failed_cache_clean_up",
            JobPhase::FailedDone => "failed_done",
            JobPhase::Stop => "stop",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn all_lists_every_phase_once() {
        let unique: HashSet<JobPhase> = JobPhase::ALL.iter().copied().collect();
        assert_eq!(unique.len(), JobPhase::ALL.len());
    }

    #[test]
    fn only_done_and_failed_done_are_terminal() {
        for phase in JobPhase::ALL {
            let expected = matches!(phase, JobPhase::Done | JobPhase::FailedDone);
            assert_eq!(phase.is_terminal(), expected, "{phase}");
        }
    }

    #[test]
    fn failing_phases_are_exempt_from_stop() {
        for phase in JobPhase::ALL {
            if phase.is_failing() {
                assert!(phase.stop_transition().is_none(), "{phase}");
                assert!(!phase.is_terminal(), "{phase}");
            }
        }
        assert!(!JobPhase::FailedDone.is_failing());
    }

    #[test]
    fn stop_table_covers_every_phase() {
        for phase in JobPhase::ALL {
            match phase.stop_transition() {
                Some(t) => {
                    assert_eq!(t.next, JobPhase::Stop, "{phase}");
                    assert!(!t.reregister || phase == JobPhase::Poll2, "{phase}");
                }
                None => {
                    assert!(
                        phase == JobPhase::Stop
                            || phase == JobPhase::Done
                            || phase.to_string().starts_with("failed"),
                        "{phase} should not be exempt from stop"
                    );
                }
            }
        }
    }

    #[test]
    fn stop_flags_per_phase_group() {
        let t = JobPhase::Start.stop_transition().unwrap();
        assert!(!t.unsent_status_change && !t.reregister);

        let t = JobPhase::Poll2.stop_transition().unwrap();
        assert!(t.unsent_status_change && t.reregister);

        for phase in [
            JobPhase::TwoPhase,
            JobPhase::StageIn,
            JobPhase::Submit,
            JobPhase::PollQuery2,
            JobPhase::TwoPhaseProxyRefresh,
            JobPhase::ProxyRefresh,
        ] {
            let t = phase.stop_transition().unwrap();
            assert!(t.unsent_status_change, "{phase}");
            assert!(!t.reregister, "{phase}");
        }

        for phase in [
            JobPhase::StageOut,
            JobPhase::PreCloseOutput,
            JobPhase::TwoPhaseEndCommitted,
            JobPhase::CacheCleanUp,
        ] {
            let t = phase.stop_transition().unwrap();
            assert!(!t.unsent_status_change, "{phase}");
        }
    }

    #[test]
    fn display_matches_serde_name() {
        for phase in JobPhase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{phase}\""));
        }
    }
}
