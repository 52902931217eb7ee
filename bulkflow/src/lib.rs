//! # Bulkflow
//!
//! Asynchronous bulk ingestion jobs driven over a retry-wrapped transport.
//!
//! Bulkflow takes a batch of rows keyed by a correlation field and drives a
//! remote bulk job to completion:
//!
//! - **Validation first**: nothing is sent until every row carries a unique key
//! - **Retry-wrapped transport**: every call retries transient failures with jittered delays
//! - **Bounded polling**: state polling with a deadline and cooperative cancellation
//! - **Reconciliation**: every submitted row ends up in exactly one outcome partition
//! - **Event-driven observability**: lifecycle events plus structured `tracing` logs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bulkflow::prelude::*;
//!
//! let transport = Arc::new(HttpTransport::new(Credentials::bearer(token))?);
//! let orchestrator = BulkJobOrchestrator::new(
//!     transport,
//!     Endpoints::new("https://example.my.salesforce.com"),
//!     BulkJobOptions::default(),
//! )?;
//!
//! let descriptor = JobDescriptor::new("Case", "Id", Operation::Update);
//! let report = orchestrator
//!     .run(&descriptor, &batch, &CancellationToken::new())
//!     .await?;
//! println!("{} succeeded, {} failed", report.summary.succeeded, report.summary.failed);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod codec;
pub mod config;
pub mod errors;
pub mod events;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod stages;
pub mod testing;
pub mod transport;

pub use orchestrator::{run_bulk_job, BulkJobOrchestrator};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::codec::{DelimitedOptions, LineEnding, Schema};
    pub use crate::config::{BulkJobOptions, Endpoints, ResultColumns};
    pub use crate::errors::{
        ErrorKind, InputValidationError, JobFailedError, OrchestratorError,
        ProtocolViolationError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::model::{
        Batch, FieldValue, JobDescriptor, JobState, Operation, OutcomeRecord, OutcomeStatus,
        ReconciledReport, Row,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{run_bulk_job, BulkJobOrchestrator};
    #[cfg(feature = "http")]
    pub use crate::transport::{Credentials, HttpTransport};
    pub use crate::transport::{RetryPolicy, Transport, TransportError, TransportErrorKind};
}
