//! Job lifecycle events.
//!
//! The orchestrator reports each step of a job to an injected
//! [`EventSink`]. Event payloads are JSON objects carrying at least `job_id`
//! once the job exists.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Job created; payload has `job_id`, `object`, `operation`.
pub const JOB_CREATED: &str = "bulk.job.created";
/// Payload uploaded; payload has `job_id`, `rows`, `bytes`.
pub const JOB_UPLOADED: &str = "bulk.job.uploaded";
/// Upload-complete signalled.
pub const JOB_FINALIZED: &str = "bulk.job.finalized";
/// One state query answered; payload has `state` and progress counters.
pub const JOB_POLLED: &str = "bulk.job.polled";
/// Report reconciled; payload has the summary counts.
pub const JOB_COMPLETED: &str = "bulk.job.completed";
/// Run failed; payload has `error_kind` and `error`.
pub const JOB_FAILED: &str = "bulk.job.failed";
