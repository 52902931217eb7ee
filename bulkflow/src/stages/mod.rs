//! The steps of one bulk job.
//!
//! Each stage issues its calls through [`StageContext::send`], which bounds
//! every attempt by the per-call timeout, retries under the retry policy,
//! abandons in-flight calls when the token fires, and maps transport outcomes
//! into [`OrchestratorError`] tagged with the stage that failed.

mod collect;
mod finalize;
mod poll;
mod submit;
mod upload;

pub use collect::{Diagnostics, ResultCollector};
pub use finalize::JobFinalizer;
pub use poll::JobPoller;
pub use submit::JobSubmitter;
pub use upload::PayloadUploader;

use crate::cancellation::CancellationToken;
use crate::config::{BulkJobOptions, Endpoints};
use crate::errors::OrchestratorError;
use crate::events::EventSink;
use crate::model::JobStage;
use crate::transport::{RetryError, Transport, TransportError, TransportRequest, TransportResponse};

/// Everything a stage needs to talk to the service.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    /// The transport calls go through.
    pub transport: &'a dyn Transport,
    /// Where the service lives.
    pub endpoints: &'a Endpoints,
    /// Timeouts, retry policy and codec options.
    pub options: &'a BulkJobOptions,
    /// Aborts retries and polling.
    pub cancel: &'a CancellationToken,
    /// Receives lifecycle events.
    pub events: &'a dyn EventSink,
}

impl std::fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("endpoints", self.endpoints)
            .field("cancel", self.cancel)
            .finish_non_exhaustive()
    }
}

impl StageContext<'_> {
    /// Sends a request with retries, decoding the response with `decode`.
    ///
    /// Decoding runs inside the retried operation, so a malformed body is
    /// reported as a transport error of kind `Malformed`.
    pub async fn send<T, D>(
        &self,
        stage: JobStage,
        request: TransportRequest,
        decode: D,
    ) -> Result<T, OrchestratorError>
    where
        D: Fn(TransportResponse) -> Result<T, TransportError>,
    {
        let timeout = self.options.request_timeout();
        let request = request.with_timeout(timeout);
        let decode = &decode;
        let transport = self.transport;
        let attempts = self.options.retry.run(stage.as_str(), self.cancel, || {
            let request = request.clone();
            async move {
                let response = tokio::time::timeout(timeout, transport.send(request))
                    .await
                    .map_err(|_| {
                        TransportError::timeout(format!("no response within {}s", timeout.as_secs()))
                    })??;
                decode(response)
            }
        });

        tokio::select! {
            result = attempts => result.map_err(|err| stage_error(stage, err)),
            () = self.cancel.cancelled() => Err(OrchestratorError::Cancelled {
                stage,
                reason: self.cancel.reason().unwrap_or_default(),
            }),
        }
    }
}

/// Maps a retry outcome onto the error surfaced for `stage`.
pub(crate) fn stage_error(stage: JobStage, err: RetryError<TransportError>) -> OrchestratorError {
    match err {
        RetryError::Exhausted { attempts, last } => OrchestratorError::Transport {
            stage,
            attempts,
            source: last,
        },
        RetryError::Rejected { attempts, error } => OrchestratorError::Transport {
            stage,
            attempts,
            source: error,
        },
        RetryError::Cancelled { reason, .. } => OrchestratorError::Cancelled { stage, reason },
    }
}
