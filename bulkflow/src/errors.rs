//! Error types for bulk job orchestration.
//!
//! Every failure a caller can observe is an [`OrchestratorError`]. The
//! variants are tagged so retryability and blame (caller data, remote
//! service, transport) are data, not something inferred from an error type
//! hierarchy.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::model::{JobId, JobStage, JobState, OutcomeRecord, OutcomeStatus};
use crate::transport::TransportError;

/// The main error type for bulk job operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The batch or descriptor was rejected before any network call.
    #[error("{0}")]
    InputValidation(#[from] InputValidationError),

    /// A transport call failed fatally, or exhausted its retry budget.
    #[error("{stage} failed after {attempts} attempt(s): {source}")]
    Transport {
        /// The stage whose call failed.
        stage: JobStage,
        /// How many attempts were made.
        attempts: u32,
        /// The last transport error observed.
        source: TransportError,
    },

    /// The remote service returned results that contradict the protocol.
    #[error("{0}")]
    ProtocolViolation(#[from] ProtocolViolationError),

    /// The job reached the `Aborted` or `Failed` terminal state.
    #[error("{0}")]
    JobFailed(Box<JobFailedError>),

    /// Polling exceeded its deadline without reaching a terminal state.
    #[error("job {job_id} did not reach a terminal state within {waited:?} (last state: {last_state})")]
    Timeout {
        /// The job being polled.
        job_id: JobId,
        /// Time spent polling.
        waited: Duration,
        /// The last state observed before giving up.
        last_state: JobState,
    },

    /// The caller's cancellation token fired.
    #[error("bulk job cancelled during {stage}: {reason}")]
    Cancelled {
        /// The stage that was interrupted.
        stage: JobStage,
        /// The cancellation reason.
        reason: String,
    },

    /// The orchestrator options are invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse error tag, used for logging and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`OrchestratorError::InputValidation`].
    InputValidation,
    /// See [`OrchestratorError::Transport`].
    Transport,
    /// See [`OrchestratorError::ProtocolViolation`].
    ProtocolViolation,
    /// See [`OrchestratorError::JobFailed`].
    JobFailed,
    /// See [`OrchestratorError::Timeout`].
    Timeout,
    /// See [`OrchestratorError::Cancelled`].
    Cancelled,
    /// See [`OrchestratorError::Config`].
    Config,
}

impl ErrorKind {
    /// Returns the tag as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InputValidation => "input_validation",
            Self::Transport => "transport",
            Self::ProtocolViolation => "protocol_violation",
            Self::JobFailed => "job_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestratorError {
    /// Returns the coarse tag for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InputValidation(_) => ErrorKind::InputValidation,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::JobFailed(_) => ErrorKind::JobFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns the job failure details if this is a [`OrchestratorError::JobFailed`].
    #[must_use]
    pub fn job_failure(&self) -> Option<&JobFailedError> {
        match self {
            Self::JobFailed(failure) => Some(failure.as_ref()),
            _ => None,
        }
    }

    /// Whether the error is caused by the caller's data rather than the service.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(self, Self::InputValidation(_) | Self::Config(_))
    }
}

impl From<JobFailedError> for OrchestratorError {
    fn from(err: JobFailedError) -> Self {
        Self::JobFailed(Box::new(err))
    }
}

/// The batch or descriptor cannot be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputValidationError {
    /// The batch has no rows.
    #[error("batch is empty")]
    EmptyBatch,

    /// The descriptor itself is unusable.
    #[error("invalid job descriptor: {0}")]
    InvalidDescriptor(String),

    /// A row lacks the correlation key field.
    #[error("row {row} is missing correlation key field `{key}`")]
    MissingKey {
        /// Zero-based row index.
        row: usize,
        /// The correlation key field name.
        key: String,
    },

    /// A row carries a null correlation key value.
    #[error("row {row} has a null value for correlation key `{key}`")]
    NullKey {
        /// Zero-based row index.
        row: usize,
        /// The correlation key field name.
        key: String,
    },

    /// Two rows share a correlation key value.
    #[error("correlation key value `{value}` appears in rows {first_row} and {row}")]
    DuplicateKey {
        /// The repeated key value.
        value: String,
        /// Row where the value first appeared.
        first_row: usize,
        /// Row where it appeared again.
        row: usize,
    },

    /// A row carries a field that the header (first row) does not declare.
    #[error("row {row} has field `{field}` which is not in the header")]
    UnknownField {
        /// Zero-based row index.
        row: usize,
        /// The undeclared field.
        field: String,
    },

    /// Two column names collapse to the same normalized name.
    #[error("columns `{first}` and `{second}` both normalize to `{normalized}`")]
    ColumnCollision {
        /// The first original column name.
        first: String,
        /// The second original column name.
        second: String,
        /// The shared normalized name.
        normalized: String,
    },

    /// The delimited-text options cannot produce a parseable payload.
    #[error("invalid delimiter {0:?}")]
    InvalidDelimiter(char),
}

/// The remote service's result sets contradict the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolationError {
    /// A key appears in two different result partitions.
    #[error("correlation key `{key}` appears in both the {first} and {second} partitions")]
    DuplicateAcrossPartitions {
        /// The key value.
        key: String,
        /// Partition where the key was seen first.
        first: OutcomeStatus,
        /// Partition where it was seen again.
        second: OutcomeStatus,
    },

    /// A key appears twice in the same partition.
    #[error("correlation key `{key}` appears more than once in the {partition} partition")]
    DuplicateWithinPartition {
        /// The key value.
        key: String,
        /// The partition.
        partition: OutcomeStatus,
    },

    /// A key appears in the reports of two different jobs.
    #[error("correlation key `{key}` is reported by more than one job")]
    DuplicateAcrossJobs {
        /// The key value.
        key: String,
    },

    /// A partition reports a key that was never submitted.
    #[error("the {partition} partition reports key `{key}` which is not in the batch")]
    UnexpectedKey {
        /// The key value.
        key: String,
        /// The partition.
        partition: OutcomeStatus,
    },

    /// Submitted keys are absent from every partition.
    #[error("{} submitted key(s) missing from every result partition: {}", .keys.len(), preview(.keys))]
    MissingOutcomes {
        /// The missing key values, in batch order.
        keys: Vec<String>,
    },

    /// The reconciled count does not match the batch size.
    #[error("reconciled {actual} outcome(s) but the batch has {expected} row(s)")]
    CountMismatch {
        /// Rows submitted.
        expected: usize,
        /// Outcomes reconciled.
        actual: usize,
    },

    /// A non-empty partition has no column for the correlation key.
    #[error("the {partition} partition has no `{column}` column")]
    MissingKeyColumn {
        /// The partition.
        partition: OutcomeStatus,
        /// The expected column.
        column: String,
    },

    /// A partition row has an empty correlation key.
    #[error("row {row} of the {partition} partition has an empty correlation key")]
    EmptyKeyValue {
        /// The partition.
        partition: OutcomeStatus,
        /// Zero-based data row index.
        row: usize,
    },

    /// The service reported a state change the job state machine forbids.
    #[error("illegal job state transition {from} -> {to}")]
    IllegalTransition {
        /// State before.
        from: JobState,
        /// State reported.
        to: JobState,
    },
}

fn preview(keys: &[String]) -> String {
    const SHOWN: usize = 5;
    let mut out = keys.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if keys.len() > SHOWN {
        out.push_str(", ...");
    }
    out
}

/// A job ended in `Aborted` or `Failed`.
///
/// Carries whatever diagnostic partitions the service still returned.
#[derive(Debug, Clone, Error)]
#[error("job {job_id} ended in state {state}{}", message_suffix(.error_message.as_deref()))]
pub struct JobFailedError {
    /// The failed job.
    pub job_id: JobId,
    /// The terminal state reached.
    pub state: JobState,
    /// The service's error message, if any.
    pub error_message: Option<String>,
    /// Rows the service reported as failed.
    pub failed: Vec<OutcomeRecord>,
    /// Rows the service never processed.
    pub unprocessed: Vec<OutcomeRecord>,
    /// Set when the diagnostic partitions themselves could not be fetched.
    pub diagnostics_error: Option<String>,
}

fn message_suffix(message: Option<&str>) -> String {
    message.map(|m| format!(": {m}")).unwrap_or_default()
}

impl JobFailedError {
    /// Creates a failure record without diagnostics.
    #[must_use]
    pub fn new(job_id: JobId, state: JobState, error_message: Option<String>) -> Self {
        Self {
            job_id,
            state,
            error_message,
            failed: Vec::new(),
            unprocessed: Vec::new(),
            diagnostics_error: None,
        }
    }
}
