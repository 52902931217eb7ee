//! Bulk job orchestration.
//!
//! One run drives one job through its lifecycle:
//!
//! 1. validate the descriptor and batch, serialize the payload
//! 2. create the job
//! 3. upload the payload
//! 4. signal upload complete
//! 5. poll until the job is terminal
//! 6. fetch and reconcile the result partitions
//!
//! Nothing is sent until validation passes. Every transport call is retried
//! according to [`RetryPolicy`](crate::transport::RetryPolicy).

#[cfg(test)]
mod integration_tests;

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::codec::{Payload, Schema};
use crate::config::{BulkJobOptions, Endpoints};
use crate::errors::{InputValidationError, JobFailedError, OrchestratorError};
use crate::events::{
    EventSink, NoOpEventSink, JOB_COMPLETED, JOB_CREATED, JOB_FAILED, JOB_FINALIZED, JOB_UPLOADED,
};
use crate::model::{Batch, JobDescriptor, JobStage, ReconciledReport};
use crate::observability::StageTimer;
use crate::stages::{
    JobFinalizer, JobPoller, JobSubmitter, PayloadUploader, ResultCollector, StageContext,
};
use crate::transport::Transport;

/// Runs bulk jobs against one service.
///
/// The orchestrator holds no per-job state; concurrent runs share only the
/// transport and the event sink.
#[derive(Clone)]
pub struct BulkJobOrchestrator {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    options: BulkJobOptions,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BulkJobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkJobOrchestrator")
            .field("endpoints", &self.endpoints)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BulkJobOrchestrator {
    /// Creates an orchestrator, rejecting invalid options.
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoints: Endpoints,
        options: BulkJobOptions,
    ) -> Result<Self, OrchestratorError> {
        options.validate()?;
        Ok(Self {
            transport,
            endpoints,
            options,
            events: Arc::new(NoOpEventSink),
        })
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// The options in effect.
    #[must_use]
    pub const fn options(&self) -> &BulkJobOptions {
        &self.options
    }

    /// The service endpoints.
    #[must_use]
    pub const fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn context<'a>(&'a self, cancel: &'a CancellationToken) -> StageContext<'a> {
        StageContext {
            transport: self.transport.as_ref(),
            endpoints: &self.endpoints,
            options: &self.options,
            cancel,
            events: self.events.as_ref(),
        }
    }

    /// Runs one job for the whole batch and returns its reconciled report.
    ///
    /// Per-row failures are reported in the report, not as an error. The
    /// call fails only when the job as a whole cannot be driven to a
    /// trustworthy result.
    pub async fn run(
        &self,
        descriptor: &JobDescriptor,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<ReconciledReport, OrchestratorError> {
        let span = tracing::info_span!(
            "bulk_job",
            run_id = %Uuid::now_v7(),
            object = descriptor.target_collection(),
            operation = descriptor.operation().as_str(),
            rows = batch.len(),
        );
        let result = self.execute(descriptor, batch, cancel).instrument(span.clone()).await;

        let _entered = span.enter();
        match &result {
            Ok(report) => tracing::info!(
                succeeded = report.summary.succeeded,
                failed = report.summary.failed,
                unprocessed = report.summary.unprocessed,
                "Bulk job finished"
            ),
            Err(err) => {
                tracing::warn!(error_kind = %err.kind(), error = %err, "Bulk job failed");
                let job_id = err.job_failure().map(|failure| failure.job_id.clone());
                self.events.try_emit(
                    JOB_FAILED,
                    Some(json!({
                        "object": descriptor.target_collection(),
                        "error_kind": err.kind(),
                        "error": err.to_string(),
                        "job_id": job_id,
                    })),
                );
            }
        }
        result
    }

    async fn execute(
        &self,
        descriptor: &JobDescriptor,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<ReconciledReport, OrchestratorError> {
        let timer = StageTimer::start(JobStage::Validate);
        descriptor.validate()?;
        let batch_keys = batch.validate(descriptor.correlation_key())?;
        let payload = Payload::encode(batch, descriptor.content_format(), &self.options.delimited)?;
        let schema = descriptor.declares_schema().then(|| Schema::infer(batch));
        timer.finish();

        let started_at = Utc::now();
        let ctx = self.context(cancel);

        let timer = StageTimer::start(JobStage::Submit);
        let mut handle = JobSubmitter::create_job(&ctx, descriptor, schema.as_ref()).await?;
        timer.finish();
        self.events.try_emit(
            JOB_CREATED,
            Some(json!({
                "job_id": handle.job_id(),
                "object": descriptor.target_collection(),
                "operation": descriptor.operation().as_str(),
            })),
        );

        let timer = StageTimer::start(JobStage::Upload);
        PayloadUploader::upload(&ctx, handle.job_id(), &payload).await?;
        timer.finish();
        self.events.try_emit(
            JOB_UPLOADED,
            Some(json!({
                "job_id": handle.job_id(),
                "rows": payload.rows,
                "bytes": payload.bytes.len(),
            })),
        );

        let timer = StageTimer::start(JobStage::Finalize);
        JobFinalizer::finalize(&ctx, &mut handle).await?;
        timer.finish();
        self.events
            .try_emit(JOB_FINALIZED, Some(json!({ "job_id": handle.job_id() })));

        let timer = StageTimer::start(JobStage::Poll);
        let status = JobPoller::from_options(&self.options)
            .poll(&ctx, &mut handle, batch.len())
            .await?;
        timer.finish();

        if !status.state.is_success() {
            let diagnostics = ResultCollector::collect_diagnostics(&ctx, &handle).await;
            let mut failure =
                JobFailedError::new(handle.job_id().clone(), status.state, status.error_message);
            failure.failed = diagnostics.failed;
            failure.unprocessed = diagnostics.unprocessed;
            failure.diagnostics_error = diagnostics.error;
            return Err(failure.into());
        }

        let timer = StageTimer::start(JobStage::Collect);
        let report = ResultCollector::collect(&ctx, &handle, &batch_keys, status, started_at).await?;
        report.verify_total(batch.len())?;
        timer.finish();

        self.events.try_emit(
            JOB_COMPLETED,
            Some(json!({
                "job_id": handle.job_id(),
                "summary": report.summary,
            })),
        );
        Ok(report)
    }

    /// Runs several independent jobs, at most `max_concurrent_jobs` at once.
    ///
    /// Results come back in input order. One job failing does not stop the
    /// others.
    pub async fn run_many(
        &self,
        jobs: &[(JobDescriptor, Batch)],
        cancel: &CancellationToken,
    ) -> Vec<Result<ReconciledReport, OrchestratorError>> {
        stream::iter(jobs)
            .map(|(descriptor, batch)| self.run(descriptor, batch, cancel))
            .buffered(self.options.max_concurrent_jobs.max(1))
            .collect()
            .await
    }

    /// Splits a large batch into jobs of `chunk_size` rows and merges their
    /// reports into one.
    ///
    /// The whole batch is validated up front, so a key that is duplicated
    /// across chunks fails before any job is created. Any failed chunk
    /// fails the call with the first error in chunk order.
    pub async fn run_chunked(
        &self,
        descriptor: &JobDescriptor,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<ReconciledReport, OrchestratorError> {
        descriptor.validate()?;
        batch.validate(descriptor.correlation_key())?;

        let jobs: Vec<(JobDescriptor, Batch)> = batch
            .chunks(self.options.chunk_size)
            .into_iter()
            .map(|chunk| (descriptor.clone(), chunk))
            .collect();
        tracing::info!(
            object = descriptor.target_collection(),
            rows = batch.len(),
            jobs = jobs.len(),
            "Running chunked bulk load"
        );

        let mut merged: Option<ReconciledReport> = None;
        for result in self.run_many(&jobs, cancel).await {
            let report = result?;
            merged = Some(match merged {
                None => report,
                Some(acc) => acc.merge(report)?,
            });
        }
        let report = merged.ok_or(InputValidationError::EmptyBatch)?;
        report.verify_total(batch.len())?;
        Ok(report)
    }
}

/// Runs one bulk job with a fresh orchestrator and no cancellation.
pub async fn run_bulk_job(
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    descriptor: &JobDescriptor,
    batch: &Batch,
    options: BulkJobOptions,
) -> Result<ReconciledReport, OrchestratorError> {
    BulkJobOrchestrator::new(transport, endpoints, options)?
        .run(descriptor, batch, &CancellationToken::new())
        .await
}
