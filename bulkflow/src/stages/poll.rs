//! State polling.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep_until, Instant};

use super::StageContext;
use crate::config::BulkJobOptions;
use crate::errors::OrchestratorError;
use crate::events::JOB_POLLED;
use crate::model::{JobHandle, JobId, JobStage, JobState, JobStatus};
use crate::transport::{TransportError, TransportRequest};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobInfo {
    state: String,
    #[serde(default)]
    number_records_processed: u64,
    #[serde(default)]
    number_records_failed: u64,
    #[serde(default)]
    error_message: Option<String>,
}

impl TryFrom<JobInfo> for JobStatus {
    type Error = TransportError;

    fn try_from(info: JobInfo) -> Result<Self, Self::Error> {
        let state = info.state.parse::<JobState>().map_err(TransportError::malformed)?;
        Ok(Self {
            state,
            records_processed: info.number_records_processed,
            records_failed: info.number_records_failed,
            error_message: info.error_message.filter(|m| !m.is_empty()),
        })
    }
}

/// Waits for jobs to reach a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPoller {
    interval: Duration,
    max_duration: Duration,
}

impl JobPoller {
    /// Creates a poller querying every `interval` for at most `max_duration`.
    #[must_use]
    pub const fn new(interval: Duration, max_duration: Duration) -> Self {
        Self {
            interval,
            max_duration,
        }
    }

    /// A poller using the configured interval and deadline.
    #[must_use]
    pub const fn from_options(options: &BulkJobOptions) -> Self {
        Self::new(options.poll_interval(), options.max_poll_duration())
    }

    /// Queries a job's current state once.
    pub async fn query_state(
        &self,
        ctx: &StageContext<'_>,
        job_id: &JobId,
    ) -> Result<JobStatus, OrchestratorError> {
        let request = TransportRequest::get(ctx.endpoints.job_url(job_id));
        ctx.send(JobStage::Poll, request, |response| {
            JobStatus::try_from(response.json::<JobInfo>()?)
        })
        .await
    }

    /// Queries until the job is terminal, the deadline passes, or the
    /// token fires.
    ///
    /// The deadline also bounds each query, retries included. A job
    /// reported `Open` after finalization is treated as not yet picked up. Any other state change the state machine forbids is a
    /// protocol violation.
    pub async fn poll(
        &self,
        ctx: &StageContext<'_>,
        handle: &mut JobHandle,
        expected_rows: usize,
    ) -> Result<JobStatus, OrchestratorError> {
        let started = Instant::now();
        let deadline = started + self.max_duration;

        loop {
            // A query still retrying at the deadline is abandoned.
            let status = tokio::select! {
                biased;
                result = self.query_state(ctx, handle.job_id()) => result?,
                () = sleep_until(deadline) => {
                    return Err(OrchestratorError::Timeout {
                        job_id: handle.job_id().clone(),
                        waited: Instant::now() - started,
                        last_state: handle.state(),
                    });
                }
            };
            let lagging = status.state == JobState::Open && handle.state() == JobState::UploadComplete;
            if !lagging {
                handle.transition(status.state)?;
            }

            tracing::debug!(
                job_id = %handle.job_id(),
                state = %status.state,
                processed = status.records_processed,
                failed = status.records_failed,
                expected = expected_rows,
                "Polled job state"
            );
            ctx.events.try_emit(
                JOB_POLLED,
                Some(json!({
                    "job_id": handle.job_id(),
                    "state": status.state.as_str(),
                    "records_processed": status.records_processed,
                    "records_failed": status.records_failed,
                })),
            );

            if status.state.is_terminal() {
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::Timeout {
                    job_id: handle.job_id().clone(),
                    waited: now - started,
                    last_state: status.state,
                });
            }

            let wake = (now + self.interval).min(deadline);
            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled {
                        stage: JobStage::Poll,
                        reason: ctx.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
                    });
                }
                () = sleep_until(wake) => {}
            }
        }
    }
}
