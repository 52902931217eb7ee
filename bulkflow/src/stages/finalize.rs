//! Upload-complete signalling.

use serde_json::json;

use super::StageContext;
use crate::errors::OrchestratorError;
use crate::model::{JobHandle, JobStage, JobState};
use crate::transport::TransportRequest;

/// Marks jobs ready for processing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFinalizer;

impl JobFinalizer {
    /// Signals that all data is uploaded and moves the handle to `UploadComplete`.
    pub async fn finalize(
        ctx: &StageContext<'_>,
        handle: &mut JobHandle,
    ) -> Result<(), OrchestratorError> {
        let body = json!({ "state": JobState::UploadComplete.as_str() });
        let request = TransportRequest::patch_json(ctx.endpoints.job_url(handle.job_id()), &body);
        ctx.send(JobStage::Finalize, request, |_| Ok(())).await?;
        handle.transition(JobState::UploadComplete)?;
        tracing::debug!(job_id = %handle.job_id(), "Signalled upload complete");
        Ok(())
    }
}
