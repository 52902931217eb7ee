//! End-to-end runs against the in-memory bulk service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use super::{run_bulk_job, BulkJobOrchestrator};
use crate::cancellation::CancellationToken;
use crate::codec::{DelimitedOptions, FieldType, LineEnding};
use crate::config::BulkJobOptions;
use crate::errors::{ErrorKind, InputValidationError, OrchestratorError, ProtocolViolationError};
use crate::events::{
    CollectingEventSink, JOB_COMPLETED, JOB_CREATED, JOB_FAILED, JOB_FINALIZED, JOB_POLLED,
    JOB_UPLOADED,
};
use crate::model::{Batch, JobDescriptor, JobStage, JobState, Operation, OutcomeStatus, Row};
use crate::stages::{JobFinalizer, JobPoller, JobSubmitter};
use crate::testing::{
    case_batch, case_status_update, fast_options, stub_endpoints, warehouse_batch,
    warehouse_insert, Route, StubBulkService,
};
use crate::transport::{
    Method, MockTransport, RetryPolicy, Transport, TransportError, TransportErrorKind,
    TransportRequest, TransportResponse,
};

fn orchestrator(stub: &Arc<StubBulkService>, options: BulkJobOptions) -> BulkJobOrchestrator {
    BulkJobOrchestrator::new(stub.clone(), stub_endpoints(), options).unwrap()
}

fn stub() -> StubBulkService {
    StubBulkService::new(stub_endpoints())
}

#[tokio::test(start_paused = true)]
async fn test_case_status_update_succeeds() {
    let stub = Arc::new(stub());
    let sink = Arc::new(CollectingEventSink::new());
    let orchestrator = orchestrator(&stub, fast_options()).with_event_sink(sink.clone());

    let report = orchestrator
        .run(&case_status_update(), &case_batch(4), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 4);
    assert_eq!(report.summary.total, 4);
    assert_eq!(report.jobs.len(), 1);
    assert_eq!(report.jobs[0].status.state, JobState::JobComplete);
    assert_eq!(
        stub.job_state(&report.jobs[0].job_id),
        Some(JobState::JobComplete)
    );

    let record = report.get("5000").unwrap();
    assert_eq!(record.status, OutcomeStatus::Succeeded);
    assert_eq!(record.record_id.as_deref(), Some("5000"));
    assert_eq!(record.created, Some(false));
    assert_eq!(record.fields.get("Status").map(String::as_str), Some("Closed"));

    assert_eq!(stub.request_count(Route::CreateJob), 1);
    assert_eq!(stub.request_count(Route::Upload), 1);
    assert_eq!(stub.request_count(Route::Finalize), 1);
    assert_eq!(stub.request_count(Route::QueryState), 2);
    for status in OutcomeStatus::ALL {
        assert_eq!(stub.request_count(Route::Results(status)), 1);
    }

    assert_eq!(
        sink.event_types(),
        vec![JOB_CREATED, JOB_UPLOADED, JOB_FINALIZED, JOB_POLLED, JOB_POLLED, JOB_COMPLETED]
    );
    let upload = stub
        .requests()
        .into_iter()
        .find(|r| r.route == Some(Route::Upload))
        .unwrap()
        .request;
    assert!(upload.header("Content-MD5").is_some());
    assert_eq!(upload.header("Content-Type"), Some("text/csv; charset=utf-8"));
}

#[tokio::test(start_paused = true)]
async fn test_warehouse_insert_declares_schema_and_reports_failures() {
    let stub = Arc::new(stub().fail_record("3", "amount out of range"));
    let report = orchestrator(&stub, fast_options())
        .run(&warehouse_insert(), &warehouse_batch(5), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 4);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.keys_with_status(OutcomeStatus::Failed), vec!["3"]);
    assert_eq!(
        report.get("3").unwrap().error_message.as_deref(),
        Some("amount out of range")
    );
    let inserted = report.get("1").unwrap();
    assert_eq!(inserted.created, Some(true));
    assert!(inserted.record_id.is_some());

    let create = stub
        .requests()
        .into_iter()
        .find(|r| r.route == Some(Route::CreateJob))
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(create["operation"], "insert");
    assert_eq!(create["externalIdFieldName"], "order_id");
    let types: Vec<(String, FieldType)> = serde_json::from_value::<crate::codec::Schema>(
        create["schema"].clone(),
    )
    .unwrap()
    .fields
    .into_iter()
    .map(|field| (field.name, field.field_type))
    .collect();
    assert_eq!(
        types,
        vec![
            ("order_id".to_string(), FieldType::Bigint),
            ("amount".to_string(), FieldType::Double),
            ("shipped".to_string(), FieldType::Boolean),
            ("placed_at".to_string(), FieldType::Timestamp),
            ("discount".to_string(), FieldType::Double),
        ]
    );
}

#[tokio::test]
async fn test_missing_key_sends_nothing() {
    let mut transport = MockTransport::new();
    transport.expect_send().never();
    let orchestrator =
        BulkJobOrchestrator::new(Arc::new(transport), stub_endpoints(), fast_options()).unwrap();

    let batch = Batch::new(vec![
        Row::new().with("Id", "5003").with("Status", "Closed"),
        Row::new().with("Status", "Closed"),
    ]);
    let err = orchestrator
        .run(&case_status_update(), &batch, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_caller_error());
    assert!(matches!(
        err,
        OrchestratorError::InputValidation(InputValidationError::MissingKey { row: 1, .. })
    ));
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let stub = Arc::new(stub());
    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &Batch::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InputValidation(InputValidationError::EmptyBatch)
    ));
    assert_eq!(stub.total_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_outcome_in_two_partitions_is_protocol_violation() {
    let stub = Arc::new(stub().override_partition(
        OutcomeStatus::Failed,
        "sf__Id,sf__Error,Id,Status\n,boom,5000,Closed\n",
    ));
    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::ProtocolViolation(ProtocolViolationError::DuplicateAcrossPartitions {
            key,
            first,
            second,
        }) => {
            assert_eq!(key, "5000");
            assert_eq!(first, OutcomeStatus::Succeeded);
            assert_eq!(second, OutcomeStatus::Failed);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_outcomes_is_protocol_violation() {
    let stub = Arc::new(
        stub().override_partition(OutcomeStatus::Succeeded, "sf__Id,sf__Created,Id,Status\n"),
    );
    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ProtocolViolation(ProtocolViolationError::MissingOutcomes { ref keys })
            if keys == &vec!["5000".to_string(), "5001".to_string()]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_carries_diagnostics() {
    let stub = Arc::new(
        stub()
            .with_states([JobState::InProgress, JobState::Failed])
            .with_error_message("InvalidBatch : Field name not found : Stauts")
            .fail_record("5001", "INVALID_FIELD"),
    );
    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(3), &CancellationToken::new())
        .await
        .unwrap_err();

    let failure = err.job_failure().unwrap();
    assert_eq!(failure.state, JobState::Failed);
    assert_eq!(
        failure.error_message.as_deref(),
        Some("InvalidBatch : Field name not found : Stauts")
    );
    assert_eq!(failure.failed.len(), 1);
    assert_eq!(failure.failed[0].correlation_key_value, "5001");
    assert_eq!(failure.unprocessed.len(), 2);
    assert!(failure.diagnostics_error.is_none());
    assert_eq!(stub.request_count(Route::Results(OutcomeStatus::Succeeded)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_job_carries_diagnostics() {
    let stub = Arc::new(
        stub()
            .with_states([JobState::InProgress, JobState::Aborted])
            .fail_record("5000", "ENTITY_IS_LOCKED"),
    );
    let sink = Arc::new(CollectingEventSink::new());
    let err = orchestrator(&stub, fast_options())
        .with_event_sink(sink.clone())
        .run(&case_status_update(), &case_batch(3), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::JobFailed);
    let failure = err.job_failure().unwrap();
    assert_eq!(failure.state, JobState::Aborted);
    assert_eq!(failure.error_message, None);
    assert_eq!(failure.failed.len(), 1);
    assert_eq!(failure.failed[0].correlation_key_value, "5000");
    assert_eq!(failure.unprocessed.len(), 2);
    assert!(failure.diagnostics_error.is_none());
    assert_eq!(stub.request_count(Route::Results(OutcomeStatus::Succeeded)), 0);
    assert_eq!(sink.events_of(JOB_FAILED).len(), 1);
    assert_eq!(sink.events_of(JOB_COMPLETED).len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let stub = Arc::new(stub());
    stub.inject_fault(Route::CreateJob, TransportError::from_status(503, "busy"));
    stub.inject_fault(Route::CreateJob, TransportError::connect("connection reset"));
    stub.inject_fault(Route::QueryState, TransportError::timeout("read timed out"));

    let report = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(stub.request_count(Route::CreateJob), 3);
    assert_eq!(stub.request_count(Route::QueryState), 3);
    assert_eq!(stub.job_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let stub = Arc::new(stub().reject_target("Case"));
    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Transport {
            stage,
            attempts,
            source,
        } => {
            assert_eq!(stage, JobStage::Submit);
            assert_eq!(attempts, 1);
            assert_eq!(source.kind, TransportErrorKind::Client);
            assert_eq!(source.status, Some(400));
            assert!(source.body.unwrap().contains("INVALIDJOB"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stub.total_requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let stub = Arc::new(stub());
    for _ in 0..3 {
        stub.inject_fault(Route::Upload, TransportError::from_status(503, ""));
    }
    let options =
        fast_options().with_retry(RetryPolicy::new().with_max_attempts(3).with_jitter_ms(0));
    let err = orchestrator(&stub, options)
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Transport {
            stage: JobStage::Upload,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(stub.request_count(Route::Upload), 3);
    assert_eq!(stub.request_count(Route::Finalize), 0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_deadline() {
    let stub = Arc::new(stub().with_states([JobState::InProgress]));
    let options = fast_options().with_max_poll_duration_secs(5);
    let err = orchestrator(&stub, options)
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Timeout {
            waited, last_state, ..
        } => {
            assert!(waited >= Duration::from_secs(5));
            assert_eq!(last_state, JobState::InProgress);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(stub.request_count(Route::QueryState), 6);
}

#[tokio::test(start_paused = true)]
async fn test_poll_deadline_cuts_short_state_query_retries() {
    let stub = Arc::new(stub());
    for _ in 0..50 {
        stub.inject_fault(Route::QueryState, TransportError::from_status(503, "busy"));
    }
    let options = fast_options()
        .with_max_poll_duration_secs(5)
        .with_retry(RetryPolicy::new().with_base_delay_ms(4_000).with_jitter_ms(0));

    let started = tokio::time::Instant::now();
    let err = orchestrator(&stub, options)
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Timeout {
            waited, last_state, ..
        } => {
            assert!(waited >= Duration::from_secs(5));
            assert!(waited < Duration::from_secs(6));
            assert_eq!(last_state, JobState::UploadComplete);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(stub.request_count(Route::QueryState), 2);
}

/// Forwards to the stub but never answers state queries.
struct UnansweredStateQueries {
    inner: Arc<StubBulkService>,
}

#[async_trait]
impl Transport for UnansweredStateQueries {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let last_segment = request.url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        if request.method == Method::Get && last_segment.starts_with("750") {
            return std::future::pending().await;
        }
        self.inner.send(request).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_state_query_hits_poll_deadline() {
    let stub = Arc::new(stub());
    let transport = Arc::new(UnansweredStateQueries {
        inner: Arc::clone(&stub),
    });
    let options = fast_options()
        .with_request_timeout_secs(5)
        .with_max_poll_duration_secs(10);
    let cancel = Arc::new(CancellationToken::new());
    let _timer = cancel.cancel_after(Duration::from_secs(20), "shutdown");

    let outcome = tokio::time::timeout(
        Duration::from_secs(60),
        BulkJobOrchestrator::new(transport, stub_endpoints(), options)
            .unwrap()
            .run(&case_status_update(), &case_batch(2), &cancel),
    )
    .await
    .expect("run finishes well before the outer limit");

    assert!(matches!(
        outcome,
        Err(OrchestratorError::Timeout {
            last_state: JobState::UploadComplete,
            ..
        })
    ));
    assert!(!cancel.is_cancelled());
    assert_eq!(stub.request_count(Route::Finalize), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_polling() {
    let stub = Arc::new(stub().with_states([JobState::InProgress]));
    let cancel = Arc::new(CancellationToken::new());
    let _timer = cancel.cancel_after(Duration::from_millis(2500), "shutdown");

    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(2), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Cancelled { stage: JobStage::Poll, ref reason } if reason == "shutdown"
    ));
    assert_eq!(stub.request_count(Route::QueryState), 3);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let stub = Arc::new(stub());
    let cancel = CancellationToken::new();
    cancel.cancel("not needed");
    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(2), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Cancelled {
            stage: JobStage::Submit,
            ..
        }
    ));
    assert_eq!(stub.total_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_open_state_is_tolerated() {
    let stub = Arc::new(stub().with_states([
        JobState::Open,
        JobState::UploadComplete,
        JobState::InProgress,
        JobState::JobComplete,
    ]));
    let report = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(3), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.summary.succeeded, 3);
    assert_eq!(stub.request_count(Route::QueryState), 4);
}

#[tokio::test(start_paused = true)]
async fn test_backwards_state_is_protocol_violation() {
    let stub = Arc::new(stub().with_states([JobState::InProgress, JobState::UploadComplete]));
    let err = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(2), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ProtocolViolation(ProtocolViolationError::IllegalTransition {
            from: JobState::InProgress,
            to: JobState::UploadComplete,
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unprocessed_rows_are_reported() {
    let stub = Arc::new(stub().leave_unprocessed("5001"));
    let report = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &case_batch(3), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(report.summary.unprocessed, 1);
    assert_eq!(report.get("5001").unwrap().status, OutcomeStatus::Unprocessed);
}

#[tokio::test(start_paused = true)]
async fn test_run_chunked_merges_jobs() {
    let stub = Arc::new(stub().fail_record("5003", "locked"));
    let options = fast_options().with_chunk_size(2);
    let report = orchestrator(&stub, options)
        .run_chunked(&case_status_update(), &case_batch(5), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(stub.job_count(), 3);
    assert_eq!(report.jobs.len(), 3);
    assert_eq!(report.summary.total, 5);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.job_ids().count(), 3);
}

#[tokio::test]
async fn test_run_chunked_validates_whole_batch_first() {
    let stub = Arc::new(stub());
    let mut batch = case_batch(3);
    batch.push(Row::new().with("Id", "5000").with("Status", "Closed"));
    let err = orchestrator(&stub, fast_options().with_chunk_size(2))
        .run_chunked(&case_status_update(), &batch, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InputValidation(InputValidationError::DuplicateKey {
            first_row: 0,
            row: 3,
            ..
        })
    ));
    assert_eq!(stub.total_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_many_keeps_input_order() {
    let stub = Arc::new(stub().reject_target("Account"));
    let jobs = vec![
        (case_status_update(), case_batch(2)),
        (
            JobDescriptor::new("Account", "Id", Operation::Update),
            case_batch(2),
        ),
        (warehouse_insert(), warehouse_batch(3)),
    ];
    let results = orchestrator(&stub, fast_options())
        .run_many(&jobs, &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(OrchestratorError::Transport {
            stage: JobStage::Submit,
            ..
        })
    ));
    assert_eq!(results[2].as_ref().unwrap().summary.succeeded, 3);
}

#[tokio::test(start_paused = true)]
async fn test_run_bulk_job_entry_point() {
    let stub = Arc::new(stub());
    let report = run_bulk_job(
        stub.clone(),
        stub_endpoints(),
        &case_status_update(),
        &case_batch(2),
        fast_options(),
    )
    .await
    .unwrap();
    assert_eq!(report.len(), 2);

    let err = run_bulk_job(
        stub,
        stub_endpoints(),
        &case_status_update(),
        &case_batch(2),
        fast_options().with_chunk_size(0),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OrchestratorError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_custom_delimiter_and_line_ending() {
    let delimited = DelimitedOptions::default()
        .with_delimiter(';')
        .with_line_ending(LineEnding::Crlf);
    let stub = Arc::new(stub().with_delimited(delimited.clone()));
    let report = orchestrator(&stub, fast_options().with_delimited(delimited))
        .run(&case_status_update(), &case_batch(3), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.summary.succeeded, 3);

    let create = stub.requests()[0].json().unwrap();
    assert_eq!(create["columnDelimiter"], "SEMICOLON");
    assert_eq!(create["lineEnding"], "CRLF");
}

fn two_closed_cases() -> Batch {
    Batch::new(vec![
        Row::new().with("Id", "c1").with("Status", "Closed"),
        Row::new().with("Id", "c2").with("Status", "Closed"),
    ])
}

#[tokio::test(start_paused = true)]
async fn test_close_two_cases() {
    let stub = Arc::new(stub());
    let report = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &two_closed_cases(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.keys_with_status(OutcomeStatus::Succeeded), vec!["c1", "c2"]);
    assert!(report.keys_with_status(OutcomeStatus::Failed).is_empty());
    assert!(report.keys_with_status(OutcomeStatus::Unprocessed).is_empty());
    assert_eq!(report.summary.total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_two_cases_one_rejected() {
    let stub = Arc::new(stub().fail_record("c2", "VALIDATION_ERROR"));
    let report = orchestrator(&stub, fast_options())
        .run(&case_status_update(), &two_closed_cases(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.keys_with_status(OutcomeStatus::Succeeded), vec!["c1"]);
    assert_eq!(report.keys_with_status(OutcomeStatus::Failed), vec!["c2"]);
    assert_eq!(
        report.get("c2").unwrap().error_message.as_deref(),
        Some("VALIDATION_ERROR")
    );
    assert!(report.keys_with_status(OutcomeStatus::Unprocessed).is_empty());
    assert_eq!(report.summary.total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_poller_queries_until_terminal() {
    let stub = Arc::new(stub().with_states([
        JobState::UploadComplete,
        JobState::InProgress,
        JobState::InProgress,
        JobState::JobComplete,
    ]));
    let orchestrator = orchestrator(&stub, fast_options());
    let cancel = CancellationToken::new();
    let ctx = orchestrator.context(&cancel);

    let mut handle = JobSubmitter::create_job(&ctx, &case_status_update(), None)
        .await
        .unwrap();
    JobFinalizer::finalize(&ctx, &mut handle).await.unwrap();
    let status = JobPoller::from_options(orchestrator.options())
        .poll(&ctx, &mut handle, 0)
        .await
        .unwrap();

    assert_eq!(status.state, JobState::JobComplete);
    assert_eq!(handle.state(), JobState::JobComplete);
    assert_eq!(stub.request_count(Route::QueryState), 4);
}
