//! Job registry: the job request table and the LRM id table.
//!
//! - [`RequestTable`]: job contact → reference-counted entry that may have
//!   its job swapped out to disk while a cached status stays in memory
//! - [`LrmIdTable`]: LRM job id (or sub-id) → owning job contact
//!
//! Both are plain data structures. [`JobManager`](crate::manager::JobManager)
//! guards them with one lock and turns their outcomes into timers and I/O.

pub mod job;
pub mod lrm_ids;
pub mod phase;
pub mod requests;

pub use job::{CachedStatus, JobKey, JobRecord, StopReason};
pub use lrm_ids::LrmIdTable;
pub use phase::{JobPhase, StopTransition};
pub use requests::{RequestSummary, RequestTable, SharedJob};
