//! Per-job driver loops.
//!
//! The phase logic of a real job (staging, LRM submission scripts, two-phase
//! commit) is out of scope. [`JobPoller`] stands in for it with just enough
//! behaviour to exercise the registry:
//!
//! - **Poll-wait**: sleeps on its poll timer, leasing the job only while it
//!   looks at it
//! - **Stop**: saves the job with its restart phase and lets it leave
//! - **Done**: exits once the job is gone from the registry
//!
//! Submission and LRM event delivery live in [`GramService`](crate::service::GramService).

pub mod poller;

pub use poller::{JobPoller, PollStep};
