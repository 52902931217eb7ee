//! In-memory bulk ingestion service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use crate::codec::{parse, payload_checksum, DelimitedOptions, Table};
use crate::config::Endpoints;
use crate::model::{JobId, JobState, OutcomeStatus};
use crate::transport::{
    Method, Transport, TransportError, TransportRequest, TransportResponse,
};

/// The service call a request was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// `POST` on the job collection.
    CreateJob,
    /// `PUT` of a job's payload.
    Upload,
    /// `PATCH` setting `UploadComplete`.
    Finalize,
    /// `GET` of a job's state.
    QueryState,
    /// `GET` of one result partition.
    Results(OutcomeStatus),
}

/// A request the stub received, with the route it matched.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Matched route, `None` if nothing matched.
    pub route: Option<Route>,
    /// The request as sent.
    pub request: TransportRequest,
}

impl RecordedRequest {
    /// The body parsed as JSON, if it is JSON.
    #[must_use]
    pub fn json(&self) -> Option<serde_json::Value> {
        self.request
            .body
            .as_deref()
            .and_then(|body| serde_json::from_slice(body).ok())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobBody {
    object: String,
    external_id_field_name: String,
    operation: String,
}

#[derive(Debug)]
struct StubJob {
    object: String,
    key: String,
    operation: String,
    state: JobState,
    payload: Option<(String, Vec<u8>)>,
    script: VecDeque<JobState>,
}

/// A scripted stand-in for the remote bulk service.
///
/// Jobs move through the configured state script, one step per state query,
/// after upload completes. Results are derived from the uploaded payload:
/// every row succeeds unless marked failing or unprocessed.
#[derive(Debug)]
pub struct StubBulkService {
    endpoints: Endpoints,
    delimited: DelimitedOptions,
    script: Vec<JobState>,
    error_message: Option<String>,
    failing: HashMap<String, String>,
    unprocessed: HashSet<String>,
    rejected_targets: HashSet<String>,
    overrides: HashMap<OutcomeStatus, Vec<u8>>,
    jobs: DashMap<JobId, StubJob>,
    next_id: AtomicU64,
    faults: Mutex<HashMap<Route, VecDeque<TransportError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl StubBulkService {
    /// A service that completes every job on the second state query.
    #[must_use]
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            endpoints,
            delimited: DelimitedOptions::default(),
            script: vec![JobState::InProgress, JobState::JobComplete],
            error_message: None,
            failing: HashMap::new(),
            unprocessed: HashSet::new(),
            rejected_targets: HashSet::new(),
            overrides: HashMap::new(),
            jobs: DashMap::new(),
            next_id: AtomicU64::new(1),
            faults: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sets the states reported by successive state queries of each job.
    /// The last state sticks once the script runs out.
    #[must_use]
    pub fn with_states(mut self, states: impl IntoIterator<Item = JobState>) -> Self {
        self.script = states.into_iter().collect();
        self
    }

    /// Sets the job-level error message reported with the job state.
    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Sets the payload format the stub expects.
    #[must_use]
    pub fn with_delimited(mut self, options: DelimitedOptions) -> Self {
        self.delimited = options;
        self
    }

    /// Reports the row with this key as failed.
    #[must_use]
    pub fn fail_record(mut self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.failing.insert(key.into(), message.into());
        self
    }

    /// Reports the row with this key as unprocessed.
    #[must_use]
    pub fn leave_unprocessed(mut self, key: impl Into<String>) -> Self {
        self.unprocessed.insert(key.into());
        self
    }

    /// Rejects job creation for this target collection with a 400.
    #[must_use]
    pub fn reject_target(mut self, target: impl Into<String>) -> Self {
        self.rejected_targets.insert(target.into());
        self
    }

    /// Serves these bytes verbatim for a partition of every job.
    #[must_use]
    pub fn override_partition(mut self, status: OutcomeStatus, body: impl Into<Vec<u8>>) -> Self {
        self.overrides.insert(status, body.into());
        self
    }

    /// Queues an error returned by the next call to `route`. Faults queue up
    /// and are consumed in order.
    pub fn inject_fault(&self, route: Route, error: TransportError) {
        self.faults.lock().entry(route).or_default().push_back(error);
    }

    /// Every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Requests received for one route, including failed ones.
    #[must_use]
    pub fn request_count(&self, route: Route) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|recorded| recorded.route == Some(route))
            .count()
    }

    /// Total number of requests received.
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of jobs created.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// The current state of a job, if it exists.
    #[must_use]
    pub fn job_state(&self, job_id: &JobId) -> Option<JobState> {
        self.jobs.get(job_id).map(|job| job.state)
    }

    fn route(&self, request: &TransportRequest) -> Option<(Route, Option<JobId>)> {
        let jobs_url = self.endpoints.jobs_url();
        let rest = request.url.strip_prefix(&jobs_url)?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        let route = match (request.method, segments.as_slice()) {
            (Method::Post, []) => return Some((Route::CreateJob, None)),
            (Method::Get, [_]) => Route::QueryState,
            (Method::Patch, [_]) => Route::Finalize,
            (Method::Put, [_, "batches"]) => Route::Upload,
            (Method::Get, [_, "successfulResults"]) => Route::Results(OutcomeStatus::Succeeded),
            (Method::Get, [_, "failedResults"]) => Route::Results(OutcomeStatus::Failed),
            (Method::Get, [_, "unprocessedrecords"]) => Route::Results(OutcomeStatus::Unprocessed),
            _ => return None,
        };
        Some((route, segments.first().map(|id| JobId::from(*id))))
    }

    fn handle(
        &self,
        route: Route,
        job_id: Option<JobId>,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let Some(job_id) = job_id else {
            return self.create_job(request);
        };
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| TransportError::from_status(404, "job not found"))?;
        match route {
            Route::CreateJob => Err(TransportError::from_status(405, "")),
            Route::Upload => Self::upload(&mut job, request),
            Route::Finalize => Self::finalize(&mut job, request),
            Route::QueryState => Ok(self.query_state(&job_id, &mut job)),
            Route::Results(status) => self.results(&job, status),
        }
    }

    fn create_job(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let body: CreateJobBody = request
            .body
            .as_deref()
            .and_then(|body| serde_json::from_slice(body).ok())
            .ok_or_else(|| TransportError::from_status(400, "malformed job request"))?;
        if self.rejected_targets.contains(&body.object) {
            let error = json!([{
                "errorCode": "INVALIDJOB",
                "message": format!("sObject type '{}' is not supported", body.object),
            }]);
            return Err(TransportError::from_status(400, error.to_string()));
        }

        let id = JobId::from(format!("750{:015}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let response = json!({
            "id": id,
            "object": body.object,
            "operation": body.operation,
            "state": JobState::Open.as_str(),
        });
        self.jobs.insert(
            id,
            StubJob {
                object: body.object,
                key: body.external_id_field_name,
                operation: body.operation,
                state: JobState::Open,
                payload: None,
                script: VecDeque::new(),
            },
        );
        Ok(TransportResponse::new(200, response.to_string()))
    }

    fn upload(job: &mut StubJob, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let bytes = request.body.clone().unwrap_or_default();
        let checksum = payload_checksum(&bytes);
        if request.header("Content-MD5").is_some_and(|sent| sent != checksum) {
            return Err(TransportError::from_status(400, "checksum mismatch"));
        }
        match &job.payload {
            Some((existing, _)) if *existing == checksum => {
                return Ok(TransportResponse::new(201, Vec::new()));
            }
            Some(_) => return Err(TransportError::from_status(409, "payload already uploaded")),
            None => {}
        }
        if job.state != JobState::Open {
            return Err(TransportError::from_status(409, "job is not open"));
        }
        job.payload = Some((checksum, bytes));
        Ok(TransportResponse::new(201, Vec::new()))
    }

    fn finalize(job: &mut StubJob, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let requested = request
            .body
            .as_deref()
            .and_then(|body| serde_json::from_slice::<serde_json::Value>(body).ok())
            .and_then(|body| body["state"].as_str().map(str::to_string));
        if requested.as_deref() != Some(JobState::UploadComplete.as_str()) {
            return Err(TransportError::from_status(400, "unsupported state change"));
        }
        if job.state != JobState::Open {
            return Err(TransportError::from_status(409, "job is not open"));
        }
        job.state = JobState::UploadComplete;
        Ok(TransportResponse::new(
            200,
            json!({ "state": job.state.as_str() }).to_string(),
        ))
    }

    fn query_state(&self, job_id: &JobId, job: &mut StubJob) -> TransportResponse {
        if job.state == JobState::UploadComplete && job.script.is_empty() {
            job.script = self.script.iter().copied().collect();
        }
        if let Some(next) = job.script.pop_front() {
            job.state = next;
            if job.script.is_empty() && !next.is_terminal() {
                job.script.push_back(next);
            }
        }

        let (processed, failed) = if job.state.is_terminal() {
            (self.payload_table(job).len(), self.count_failing(job))
        } else {
            (0, 0)
        };
        let error_message = (!job.state.is_success())
            .then(|| self.error_message.clone())
            .flatten();
        let body = json!({
            "id": job_id,
            "object": job.object,
            "operation": job.operation,
            "state": job.state.as_str(),
            "numberRecordsProcessed": processed,
            "numberRecordsFailed": failed,
            "errorMessage": error_message,
        });
        TransportResponse::new(200, body.to_string())
    }

    fn payload_table(&self, job: &StubJob) -> Table {
        job.payload
            .as_ref()
            .and_then(|(_, bytes)| parse(bytes, &self.delimited).ok())
            .unwrap_or_default()
    }

    fn count_failing(&self, job: &StubJob) -> usize {
        let table = self.payload_table(job);
        let Some(index) = table.column(&job.key) else {
            return 0;
        };
        table
            .rows
            .iter()
            .filter_map(|row| row.get(index).cloned().flatten())
            .filter(|key| self.failing.contains_key(key))
            .count()
    }

    fn classify(&self, job: &StubJob, key: &str) -> OutcomeStatus {
        if self.failing.contains_key(key) {
            OutcomeStatus::Failed
        } else if self.unprocessed.contains(key) || job.state != JobState::JobComplete {
            OutcomeStatus::Unprocessed
        } else {
            OutcomeStatus::Succeeded
        }
    }

    fn results(&self, job: &StubJob, status: OutcomeStatus) -> Result<TransportResponse, TransportError> {
        if let Some(body) = self.overrides.get(&status) {
            return Ok(TransportResponse::new(200, body.clone()));
        }
        if !job.state.is_terminal() {
            return Err(TransportError::from_status(409, "job is not finished"));
        }

        let input = self.payload_table(job);
        let metadata: &[&str] = match status {
            OutcomeStatus::Succeeded => &["sf__Id", "sf__Created"],
            OutcomeStatus::Failed => &["sf__Id", "sf__Error"],
            OutcomeStatus::Unprocessed => &[],
        };
        let mut header: Vec<String> = metadata.iter().map(|c| (*c).to_string()).collect();
        header.extend(input.header.iter().cloned());
        let mut table = Table::new(header);

        let key_index = input.column(&job.key);
        for (index, row) in input.rows.iter().enumerate() {
            let key = key_index
                .and_then(|i| row.get(i).cloned().flatten())
                .unwrap_or_default();
            if self.classify(job, &key) != status {
                continue;
            }
            let mut cells: Vec<Option<String>> = match status {
                OutcomeStatus::Succeeded => {
                    let id = if job.key == "Id" {
                        key.clone()
                    } else {
                        format!("a00{:015}", index + 1)
                    };
                    vec![Some(id), Some((job.operation == "insert").to_string())]
                }
                OutcomeStatus::Failed => vec![None, self.failing.get(&key).cloned()],
                OutcomeStatus::Unprocessed => Vec::new(),
            };
            cells.extend(row.iter().cloned());
            table = table.with_row(cells);
        }
        Ok(TransportResponse::new(200, table.to_bytes(&self.delimited)))
    }
}

#[async_trait]
impl Transport for StubBulkService {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let routed = self.route(&request);
        self.requests.lock().push(RecordedRequest {
            route: routed.as_ref().map(|(route, _)| *route),
            request: request.clone(),
        });
        let Some((route, job_id)) = routed else {
            return Err(TransportError::from_status(404, "no such resource"));
        };

        let fault = self
            .faults
            .lock()
            .get_mut(&route)
            .and_then(VecDeque::pop_front);
        if let Some(fault) = fault {
            return Err(fault);
        }
        self.handle(route, job_id, &request)
    }
}
