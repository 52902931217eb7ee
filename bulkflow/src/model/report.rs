//! Per-row outcomes and the reconciled report.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobId, JobStatus};
use crate::errors::ProtocolViolationError;

/// Which result partition a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The service applied the row.
    Succeeded,
    /// The service rejected the row.
    Failed,
    /// The service never processed the row.
    Unprocessed,
}

impl OutcomeStatus {
    /// All partitions, in fetch order.
    pub const ALL: [Self; 3] = [Self::Succeeded, Self::Failed, Self::Unprocessed];

    /// Returns the partition name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unprocessed => "unprocessed",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one submitted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// The row's correlation key value.
    pub correlation_key_value: String,
    /// Partition the row was reported in.
    pub status: OutcomeStatus,
    /// Service error message for failed rows.
    pub error_message: Option<String>,
    /// Record id assigned by the service, when reported.
    pub record_id: Option<String>,
    /// Whether the service created (rather than updated) the record.
    pub created: Option<bool>,
    /// Echoed input fields, excluding service metadata columns.
    pub fields: BTreeMap<String, String>,
}

impl OutcomeRecord {
    /// Creates an outcome with no metadata or echoed fields.
    #[must_use]
    pub fn new(correlation_key_value: impl Into<String>, status: OutcomeStatus) -> Self {
        Self {
            correlation_key_value: correlation_key_value.into(),
            status,
            error_message: None,
            record_id: None,
            created: None,
            fields: BTreeMap::new(),
        }
    }
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Rows in the succeeded partition.
    pub succeeded: usize,
    /// Rows in the failed partition.
    pub failed: usize,
    /// Rows in the unprocessed partition.
    pub unprocessed: usize,
    /// All reconciled rows.
    pub total: usize,
}

impl ReportSummary {
    /// Counts outcomes by status.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a OutcomeRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            match record.status {
                OutcomeStatus::Succeeded => summary.succeeded += 1,
                OutcomeStatus::Failed => summary.failed += 1,
                OutcomeStatus::Unprocessed => summary.unprocessed += 1,
            }
            summary.total += 1;
        }
        summary
    }

    /// Whether `total` equals the sum of the partitions.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.total == self.succeeded + self.failed + self.unprocessed
    }
}

/// A job and the last status observed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    /// The job id.
    pub job_id: JobId,
    /// The terminal status the poller returned.
    pub status: JobStatus,
}

/// Every submitted row's outcome, keyed by correlation key value.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciledReport {
    /// Jobs this report covers. More than one after a chunked run.
    pub jobs: Vec<JobSummary>,
    /// Outcomes keyed by correlation key value.
    pub records: BTreeMap<String, OutcomeRecord>,
    /// Outcome counts.
    pub summary: ReportSummary,
    /// When the first covered job was submitted.
    pub started_at: DateTime<Utc>,
    /// When the last covered job was collected.
    pub finished_at: DateTime<Utc>,
}

impl ReconciledReport {
    /// Builds a single-job report, finishing now.
    #[must_use]
    pub fn new(
        job: JobSummary,
        records: BTreeMap<String, OutcomeRecord>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let summary = ReportSummary::from_records(records.values());
        Self {
            jobs: vec![job],
            records,
            summary,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// The ids of the covered jobs.
    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter().map(|job| &job.job_id)
    }

    /// Looks up one row's outcome.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OutcomeRecord> {
        self.records.get(key)
    }

    /// Number of reconciled rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the report has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keys with the given status, in key order.
    #[must_use]
    pub fn keys_with_status(&self, status: OutcomeStatus) -> Vec<&str> {
        self.records
            .values()
            .filter(|record| record.status == status)
            .map(|record| record.correlation_key_value.as_str())
            .collect()
    }

    /// Folds another job's report into this one.
    pub fn merge(mut self, other: Self) -> Result<Self, ProtocolViolationError> {
        for (key, record) in other.records {
            if self.records.contains_key(&key) {
                return Err(ProtocolViolationError::DuplicateAcrossJobs { key });
            }
            self.records.insert(key, record);
        }
        self.jobs.extend(other.jobs);
        self.summary = ReportSummary::from_records(self.records.values());
        self.started_at = self.started_at.min(other.started_at);
        self.finished_at = self.finished_at.max(other.finished_at);
        Ok(self)
    }

    /// Checks the count invariants against the number of submitted rows.
    pub fn verify_total(&self, expected: usize) -> Result<(), ProtocolViolationError> {
        if !self.summary.is_consistent() || self.summary.total != expected {
            return Err(ProtocolViolationError::CountMismatch {
                expected,
                actual: self.summary.total,
            });
        }
        Ok(())
    }
}
