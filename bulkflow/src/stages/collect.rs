//! Result collection and reconciliation.
//!
//! The service reports outcomes in three partitions. Every submitted key
//! must appear in exactly one of them; anything else is a protocol
//! violation rather than something to paper over.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use super::StageContext;
use crate::codec::{parse, Table};
use crate::config::ResultColumns;
use crate::errors::{OrchestratorError, ProtocolViolationError};
use crate::model::{
    JobHandle, JobId, JobStage, JobStatus, JobSummary, OutcomeRecord, OutcomeStatus,
    ReconciledReport,
};
use crate::transport::{TransportError, TransportRequest};

/// Diagnostic partitions of a job that ended `Failed` or `Aborted`.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Rows reported failed.
    pub failed: Vec<OutcomeRecord>,
    /// Rows never processed.
    pub unprocessed: Vec<OutcomeRecord>,
    /// Why the partitions could not be read, if they could not.
    pub error: Option<String>,
}

/// Fetches result partitions and reconciles them against the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultCollector;

fn non_empty(cell: Option<&Option<String>>) -> Option<&str> {
    cell.and_then(Option::as_deref).filter(|value| !value.is_empty())
}

impl ResultCollector {
    /// Downloads and parses one partition.
    pub async fn fetch_partition(
        ctx: &StageContext<'_>,
        job_id: &JobId,
        status: OutcomeStatus,
    ) -> Result<Table, OrchestratorError> {
        let request = TransportRequest::get(ctx.endpoints.results_url(job_id, status));
        let options = &ctx.options.delimited;
        ctx.send(JobStage::Collect, request, |response| {
            parse(&response.body, options)
                .map_err(|e| TransportError::malformed(format!("{status} partition: {e}")))
        })
        .await
    }

    /// Turns a partition table into outcome records.
    ///
    /// A table without rows may omit the header entirely.
    pub fn outcomes(
        table: &Table,
        status: OutcomeStatus,
        correlation_key: &str,
        columns: &ResultColumns,
    ) -> Result<Vec<OutcomeRecord>, ProtocolViolationError> {
        if table.is_empty() {
            return Ok(Vec::new());
        }
        let key_index =
            table
                .column(correlation_key)
                .ok_or_else(|| ProtocolViolationError::MissingKeyColumn {
                    partition: status,
                    column: correlation_key.to_string(),
                })?;
        let id_index = table.column(&columns.id_column);
        let created_index = table.column(&columns.created_column);
        let error_index = table.column(&columns.error_column);

        let mut seen = HashSet::with_capacity(table.len());
        let mut records = Vec::with_capacity(table.len());
        for (row_index, row) in table.rows.iter().enumerate() {
            let key = non_empty(row.get(key_index)).ok_or(
                ProtocolViolationError::EmptyKeyValue {
                    partition: status,
                    row: row_index,
                },
            )?;
            if !seen.insert(key) {
                return Err(ProtocolViolationError::DuplicateWithinPartition {
                    key: key.to_string(),
                    partition: status,
                });
            }

            let mut record = OutcomeRecord::new(key, status);
            record.record_id = id_index.and_then(|i| non_empty(row.get(i))).map(str::to_string);
            record.error_message = error_index
                .and_then(|i| non_empty(row.get(i)))
                .map(str::to_string);
            record.created = created_index
                .and_then(|i| non_empty(row.get(i)))
                .and_then(|value| value.to_ascii_lowercase().parse().ok());
            record.fields = table
                .header
                .iter()
                .zip(row)
                .filter(|(column, _)| !columns.is_metadata(column))
                .filter_map(|(column, cell)| Some((column.clone(), cell.clone()?)))
                .collect();
            records.push(record);
        }
        Ok(records)
    }

    /// Checks that partitions cover the submitted keys exactly once.
    pub fn reconcile(
        batch_keys: &[String],
        partitions: Vec<Vec<OutcomeRecord>>,
    ) -> Result<BTreeMap<String, OutcomeRecord>, ProtocolViolationError> {
        let expected: HashSet<&str> = batch_keys.iter().map(String::as_str).collect();
        let mut records: BTreeMap<String, OutcomeRecord> = BTreeMap::new();

        for record in partitions.into_iter().flatten() {
            let key = record.correlation_key_value.clone();
            if let Some(first) = records.get(&key) {
                return Err(ProtocolViolationError::DuplicateAcrossPartitions {
                    key,
                    first: first.status,
                    second: record.status,
                });
            }
            if !expected.contains(key.as_str()) {
                return Err(ProtocolViolationError::UnexpectedKey {
                    key,
                    partition: record.status,
                });
            }
            records.insert(key, record);
        }

        let missing: Vec<String> = batch_keys
            .iter()
            .filter(|key| !records.contains_key(key.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ProtocolViolationError::MissingOutcomes { keys: missing });
        }
        Ok(records)
    }

    /// Fetches all three partitions of a completed job and reconciles them.
    pub async fn collect(
        ctx: &StageContext<'_>,
        handle: &JobHandle,
        batch_keys: &[String],
        status: JobStatus,
        started_at: DateTime<Utc>,
    ) -> Result<ReconciledReport, OrchestratorError> {
        let key = handle.descriptor().correlation_key();
        let mut partitions = Vec::with_capacity(OutcomeStatus::ALL.len());
        for outcome in OutcomeStatus::ALL {
            let table = Self::fetch_partition(ctx, handle.job_id(), outcome).await?;
            partitions.push(Self::outcomes(
                &table,
                outcome,
                key,
                &ctx.options.result_columns,
            )?);
        }
        let records = Self::reconcile(batch_keys, partitions)?;
        let job = JobSummary {
            job_id: handle.job_id().clone(),
            status,
        };
        Ok(ReconciledReport::new(job, records, started_at))
    }

    /// Best-effort read of the failed and unprocessed partitions.
    pub async fn collect_diagnostics(ctx: &StageContext<'_>, handle: &JobHandle) -> Diagnostics {
        let mut diagnostics = Diagnostics::default();
        let key = handle.descriptor().correlation_key();
        for outcome in [OutcomeStatus::Failed, OutcomeStatus::Unprocessed] {
            let result = Self::fetch_partition(ctx, handle.job_id(), outcome)
                .await
                .and_then(|table| {
                    Self::outcomes(&table, outcome, key, &ctx.options.result_columns)
                        .map_err(OrchestratorError::from)
                });
            match result {
                Ok(records) if outcome == OutcomeStatus::Failed => diagnostics.failed = records,
                Ok(records) => diagnostics.unprocessed = records,
                Err(e) => {
                    tracing::warn!(
                        job_id = %handle.job_id(),
                        partition = %outcome,
                        error = %e,
                        "Could not read diagnostic partition"
                    );
                    diagnostics.error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        diagnostics
    }
}
