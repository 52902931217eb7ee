//! Testing utilities for bulk jobs.
//!
//! This module provides:
//! - An in-memory bulk service implementing [`Transport`](crate::transport::Transport)
//! - Batch, descriptor and option fixtures

mod fixtures;
mod stub;

pub use fixtures::{
    case_batch, case_status_update, fast_options, stub_endpoints, warehouse_batch,
    warehouse_insert, STUB_BASE_URL,
};
pub use stub::{RecordedRequest, Route, StubBulkService};
