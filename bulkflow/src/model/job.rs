//! Job descriptors, identifiers and the job state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{InputValidationError, ProtocolViolationError};

/// Opaque job identifier assigned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The kind of write a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create new records.
    Insert,
    /// Update existing records matched by the correlation key.
    Update,
}

impl Operation {
    /// Returns the wire name of the operation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload encoding accepted by the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentFormat {
    /// Delimited rows with a header line.
    #[default]
    DelimitedText,
}

impl ContentFormat {
    /// The `contentType` value sent on job creation.
    #[must_use]
    pub const fn wire_name(&self) -> &'static str {
        match self {
            Self::DelimitedText => "CSV",
        }
    }

    /// The HTTP `Content-Type` of an uploaded payload.
    #[must_use]
    pub const fn mime_type(&self) -> &'static str {
        match self {
            Self::DelimitedText => "text/csv; charset=utf-8",
        }
    }
}

/// What a bulk job writes, and how rows are matched to outcomes.
///
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    target_collection: String,
    correlation_key: String,
    operation: Operation,
    #[serde(default)]
    content_format: ContentFormat,
    #[serde(default)]
    declare_schema: bool,
}

impl JobDescriptor {
    /// Creates a descriptor for delimited-text payloads.
    #[must_use]
    pub fn new(
        target_collection: impl Into<String>,
        correlation_key: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            target_collection: target_collection.into(),
            correlation_key: correlation_key.into(),
            operation,
            content_format: ContentFormat::DelimitedText,
            declare_schema: false,
        }
    }

    /// Sends the inferred column schema with the create-job request.
    #[must_use]
    pub fn with_declared_schema(mut self) -> Self {
        self.declare_schema = true;
        self
    }

    /// Sets the payload format.
    #[must_use]
    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.content_format = format;
        self
    }

    /// The logical table or object type being written.
    #[must_use]
    pub fn target_collection(&self) -> &str {
        &self.target_collection
    }

    /// The field used to match input rows to outcome rows.
    #[must_use]
    pub fn correlation_key(&self) -> &str {
        &self.correlation_key
    }

    /// The write operation.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    /// The payload format.
    #[must_use]
    pub const fn content_format(&self) -> ContentFormat {
        self.content_format
    }

    /// Whether the column schema is declared on job creation.
    #[must_use]
    pub const fn declares_schema(&self) -> bool {
        self.declare_schema
    }

    /// Rejects descriptors the service could never accept.
    pub fn validate(&self) -> Result<(), InputValidationError> {
        if self.target_collection.trim().is_empty() {
            return Err(InputValidationError::InvalidDescriptor(
                "target collection is empty".to_string(),
            ));
        }
        if self.correlation_key.trim().is_empty() {
            return Err(InputValidationError::InvalidDescriptor(
                "correlation key is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server-side job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Created, accepting uploads.
    Open,
    /// Finalized and queued.
    UploadComplete,
    /// Being processed.
    InProgress,
    /// Finished; result partitions are available.
    JobComplete,
    /// Stopped before completion.
    Aborted,
    /// Processing failed.
    Failed,
}

impl JobState {
    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::UploadComplete => "UploadComplete",
            Self::InProgress => "InProgress",
            Self::JobComplete => "JobComplete",
            Self::Aborted => "Aborted",
            Self::Failed => "Failed",
        }
    }

    /// No further transitions happen from a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::JobComplete | Self::Aborted | Self::Failed)
    }

    /// Whether the state is the one successful terminal state.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::JobComplete)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same non-terminal state is allowed. Any non-terminal
    /// state may jump to `Aborted` or `Failed`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        use JobState::{Aborted, Failed, InProgress, JobComplete, Open, UploadComplete};
        match (*self, next) {
            (Open, Open | UploadComplete)
            | (UploadComplete, UploadComplete | InProgress | JobComplete)
            | (InProgress, InProgress | JobComplete)
            | (Open | UploadComplete | InProgress, Aborted | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(Self::Open),
            "UploadComplete" => Ok(Self::UploadComplete),
            "InProgress" => Ok(Self::InProgress),
            "JobComplete" => Ok(Self::JobComplete),
            "Aborted" => Ok(Self::Aborted),
            "Failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state `{other}`")),
        }
    }
}

/// A job state observation with its progress counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    /// The observed state.
    pub state: JobState,
    /// Records processed so far.
    pub records_processed: u64,
    /// Records that failed so far.
    pub records_failed: u64,
    /// Service error message, if any.
    pub error_message: Option<String>,
}

impl JobStatus {
    /// Creates a status with zero counters.
    #[must_use]
    pub const fn new(state: JobState) -> Self {
        Self {
            state,
            records_processed: 0,
            records_failed: 0,
            error_message: None,
        }
    }
}

/// The phase of a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Local batch and descriptor checks.
    Validate,
    /// Job creation.
    Submit,
    /// Payload upload.
    Upload,
    /// Upload-complete signal.
    Finalize,
    /// State polling.
    Poll,
    /// Result partition retrieval.
    Collect,
}

impl JobStage {
    /// Returns the stage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Submit => "submit",
            Self::Upload => "upload",
            Self::Finalize => "finalize",
            Self::Poll => "poll",
            Self::Collect => "collect",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live job, owned by one orchestrator invocation.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    descriptor: JobDescriptor,
    state: JobState,
}

impl JobHandle {
    /// Wraps a freshly created job, which starts `Open`.
    #[must_use]
    pub const fn new(job_id: JobId, descriptor: JobDescriptor) -> Self {
        Self {
            job_id,
            descriptor,
            state: JobState::Open,
        }
    }

    /// The service-assigned job id.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The descriptor the job was created from.
    #[must_use]
    pub const fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// The last known state.
    #[must_use]
    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Moves the handle to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: JobState) -> Result<(), ProtocolViolationError> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolViolationError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_wire_name() {
        for state in [
            JobState::Open,
            JobState::UploadComplete,
            JobState::InProgress,
            JobState::JobComplete,
            JobState::Aborted,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("Queued".parse::<JobState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::JobComplete.is_terminal());
        assert!(JobState::Aborted.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::InProgress.is_terminal());
        assert!(JobState::JobComplete.is_success());
        assert!(!JobState::Failed.is_success());
    }

    #[test]
    fn test_handle_follows_state_machine() {
        let descriptor = JobDescriptor::new("Case", "Id", Operation::Update);
        let mut handle = JobHandle::new(JobId::from("750a"), descriptor);
        assert_eq!(handle.state(), JobState::Open);

        handle.transition(JobState::UploadComplete).unwrap();
        handle.transition(JobState::InProgress).unwrap();
        handle.transition(JobState::InProgress).unwrap();
        handle.transition(JobState::JobComplete).unwrap();

        let err = handle.transition(JobState::InProgress).unwrap_err();
        assert_eq!(
            err,
            ProtocolViolationError::IllegalTransition {
                from: JobState::JobComplete,
                to: JobState::InProgress,
            }
        );
    }

    #[test]
    fn test_open_cannot_skip_to_complete() {
        assert!(!JobState::Open.can_transition_to(JobState::JobComplete));
        assert!(JobState::Open.can_transition_to(JobState::Aborted));
        assert!(!JobState::InProgress.can_transition_to(JobState::UploadComplete));
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(JobDescriptor::new("Case", "Id", Operation::Update).validate().is_ok());
        assert!(matches!(
            JobDescriptor::new(" ", "Id", Operation::Insert).validate(),
            Err(InputValidationError::InvalidDescriptor(_))
        ));
        assert!(JobDescriptor::new("Case", "", Operation::Insert).validate().is_err());
    }

    #[test]
    fn test_operation_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Operation::Update).unwrap(), "\"update\"");
        assert_eq!(ContentFormat::DelimitedText.wire_name(), "CSV");
    }
}
