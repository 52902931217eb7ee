//! Payload upload.

use super::StageContext;
use crate::codec::Payload;
use crate::errors::OrchestratorError;
use crate::model::{JobId, JobStage};
use crate::transport::TransportRequest;

/// Header carrying the base64 MD5 of the body.
pub const CONTENT_MD5: &str = "Content-MD5";

/// Uploads serialized batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadUploader;

impl PayloadUploader {
    /// The upload request for a job's payload.
    #[must_use]
    pub fn request(ctx: &StageContext<'_>, job_id: &JobId, payload: &Payload) -> TransportRequest {
        TransportRequest::put(
            ctx.endpoints.batches_url(job_id),
            payload.content_type,
            payload.bytes.clone(),
        )
        .with_header(CONTENT_MD5, payload.checksum.clone())
    }

    /// Uploads the whole payload in one call.
    ///
    /// Retried uploads resend identical bytes under the same checksum, so the
    /// service can recognize a repeat of an upload it already accepted.
    pub async fn upload(
        ctx: &StageContext<'_>,
        job_id: &JobId,
        payload: &Payload,
    ) -> Result<(), OrchestratorError> {
        let request = Self::request(ctx, job_id, payload);
        ctx.send(JobStage::Upload, request, |_| Ok(())).await?;
        tracing::info!(
            job_id = %job_id,
            rows = payload.rows,
            bytes = payload.bytes.len(),
            "Uploaded payload"
        );
        Ok(())
    }
}
