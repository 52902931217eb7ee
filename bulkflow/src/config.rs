//! Orchestrator configuration.
//!
//! Every field has a serde default, so a partial JSON document (or `{}`)
//! yields a usable configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DelimitedOptions;
use crate::errors::OrchestratorError;
use crate::model::{JobId, OutcomeStatus};
use crate::transport::RetryPolicy;

fn default_ingest_path() -> String {
    "/services/data/v54.0/jobs/ingest".to_string()
}

/// Where the bulk ingestion endpoints live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Scheme and host, such as `https://example.my.salesforce.com`.
    pub base_url: String,
    /// Path of the ingest job collection.
    #[serde(default = "default_ingest_path")]
    pub ingest_path: String,
}

impl Endpoints {
    /// Creates endpoints under the default ingest path.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ingest_path: default_ingest_path(),
        }
    }

    /// Sets the ingest path.
    #[must_use]
    pub fn with_ingest_path(mut self, path: impl Into<String>) -> Self {
        self.ingest_path = path.into();
        self
    }

    fn ingest(&self) -> String {
        let path = self.ingest_path.trim_matches('/');
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    /// Job collection: create jobs here.
    #[must_use]
    pub fn jobs_url(&self) -> String {
        format!("{}/", self.ingest())
    }

    /// One job: query state and finalize here.
    #[must_use]
    pub fn job_url(&self, job_id: &JobId) -> String {
        format!("{}/{job_id}/", self.ingest())
    }

    /// Upload target for a job's payload.
    #[must_use]
    pub fn batches_url(&self, job_id: &JobId) -> String {
        format!("{}batches/", self.job_url(job_id))
    }

    /// One result partition of a job.
    #[must_use]
    pub fn results_url(&self, job_id: &JobId, status: OutcomeStatus) -> String {
        let partition = match status {
            OutcomeStatus::Succeeded => "successfulResults",
            OutcomeStatus::Failed => "failedResults",
            OutcomeStatus::Unprocessed => "unprocessedrecords",
        };
        format!("{}{partition}/", self.job_url(job_id))
    }
}

fn default_id_column() -> String {
    "sf__Id".to_string()
}

fn default_created_column() -> String {
    "sf__Created".to_string()
}

fn default_error_column() -> String {
    "sf__Error".to_string()
}

fn default_metadata_prefix() -> String {
    "sf__".to_string()
}

/// Service metadata columns in result partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumns {
    /// Record id assigned by the service.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Whether the record was created.
    #[serde(default = "default_created_column")]
    pub created_column: String,
    /// Per-row error message.
    #[serde(default = "default_error_column")]
    pub error_column: String,
    /// Columns with this prefix are metadata, not echoed input.
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,
}

impl Default for ResultColumns {
    fn default() -> Self {
        Self {
            id_column: default_id_column(),
            created_column: default_created_column(),
            error_column: default_error_column(),
            metadata_prefix: default_metadata_prefix(),
        }
    }
}

impl ResultColumns {
    /// Whether a column carries service metadata.
    #[must_use]
    pub fn is_metadata(&self, column: &str) -> bool {
        (!self.metadata_prefix.is_empty() && column.starts_with(&self.metadata_prefix))
            || column == self.id_column
            || column == self.created_column
            || column == self.error_column
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_poll_duration() -> u64 {
    3600
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_chunk_size() -> usize {
    10_000
}

/// Per-run orchestrator options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkJobOptions {
    /// Timeout of each transport call, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Wait between state queries, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Overall polling deadline, in seconds.
    #[serde(default = "default_max_poll_duration")]
    pub max_poll_duration_secs: u64,
    /// Retry tuning applied to every transport call.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Payload formatting.
    #[serde(default)]
    pub delimited: DelimitedOptions,
    /// Result partition metadata columns.
    #[serde(default)]
    pub result_columns: ResultColumns,
    /// Jobs run at once by `run_many` and `run_chunked`.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Rows per job in `run_chunked`.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for BulkJobOptions {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            poll_interval_secs: default_poll_interval(),
            max_poll_duration_secs: default_max_poll_duration(),
            retry: RetryPolicy::default(),
            delimited: DelimitedOptions::default(),
            result_columns: ResultColumns::default(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl BulkJobOptions {
    /// Creates options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_request_timeout_secs(mut self, seconds: u64) -> Self {
        self.request_timeout_secs = seconds;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval_secs(mut self, seconds: u64) -> Self {
        self.poll_interval_secs = seconds;
        self
    }

    /// Sets the polling deadline.
    #[must_use]
    pub const fn with_max_poll_duration_secs(mut self, seconds: u64) -> Self {
        self.max_poll_duration_secs = seconds;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the payload formatting.
    #[must_use]
    pub fn with_delimited(mut self, delimited: DelimitedOptions) -> Self {
        self.delimited = delimited;
        self
    }

    /// Sets the result metadata columns.
    #[must_use]
    pub fn with_result_columns(mut self, columns: ResultColumns) -> Self {
        self.result_columns = columns;
        self
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs;
        self
    }

    /// Sets the chunk size.
    #[must_use]
    pub const fn with_chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = rows;
        self
    }

    /// Gets the per-call timeout as Duration.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Gets the poll interval as Duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Gets the polling deadline as Duration.
    #[must_use]
    pub const fn max_poll_duration(&self) -> Duration {
        Duration::from_secs(self.max_poll_duration_secs)
    }

    /// Checks the options for values that cannot work.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.request_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_poll_duration_secs == 0 {
            return Err(OrchestratorError::Config(
                "max_poll_duration_secs must be positive".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(OrchestratorError::Config(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        self.retry.validate().map_err(OrchestratorError::Config)?;
        self.delimited
            .validate()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        if self.result_columns.id_column.is_empty() || self.result_columns.error_column.is_empty() {
            return Err(OrchestratorError::Config(
                "result column names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses and validates options from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, OrchestratorError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| OrchestratorError::Config(format!("invalid options JSON: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads, parses and validates options from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }
}
