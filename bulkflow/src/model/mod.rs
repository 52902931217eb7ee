//! Data model: job descriptors and state, batches, and outcome reports.

mod batch;
mod job;
mod report;

pub use batch::{Batch, FieldValue, Row};
pub use job::{
    ContentFormat, JobDescriptor, JobHandle, JobId, JobStage, JobState, JobStatus, Operation,
};
pub use report::{JobSummary, OutcomeRecord, OutcomeStatus, ReconciledReport, ReportSummary};
