//! Ready-made batches, descriptors and options for tests.

use chrono::{TimeZone, Utc};

use crate::config::{BulkJobOptions, Endpoints};
use crate::model::{Batch, FieldValue, JobDescriptor, Operation, Row};
use crate::transport::RetryPolicy;

/// Base URL the fixtures point at.
pub const STUB_BASE_URL: &str = "https://stub.bulk.test";

/// Endpoints rooted at [`STUB_BASE_URL`].
#[must_use]
pub fn stub_endpoints() -> Endpoints {
    Endpoints::new(STUB_BASE_URL)
}

/// Options with short delays: 1s polls, a one-minute deadline, and 10ms
/// retry delays without jitter.
#[must_use]
pub fn fast_options() -> BulkJobOptions {
    BulkJobOptions::new()
        .with_poll_interval_secs(1)
        .with_max_poll_duration_secs(60)
        .with_retry(RetryPolicy::new().with_base_delay_ms(10).with_jitter_ms(0))
}

/// Updates case status by record id.
#[must_use]
pub fn case_status_update() -> JobDescriptor {
    JobDescriptor::new("Case", "Id", Operation::Update)
}

/// `rows` cases keyed `5000`, `5001`, ... with a `Status` column.
#[must_use]
pub fn case_batch(rows: usize) -> Batch {
    (0..rows)
        .map(|i| {
            Row::new()
                .with("Id", format!("{}", 5000 + i))
                .with("Status", if i % 2 == 0 { "Closed" } else { "Escalated" })
        })
        .collect()
}

/// Inserts fact rows into a warehouse table keyed by `order_id`.
#[must_use]
pub fn warehouse_insert() -> JobDescriptor {
    JobDescriptor::new("fact_orders", "order_id", Operation::Insert).with_declared_schema()
}

/// `rows` typed warehouse rows, one null `discount` every third row.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
#[must_use]
pub fn warehouse_batch(rows: usize) -> Batch {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default();
    (0..rows)
        .map(|i| {
            let discount = if i % 3 == 0 {
                FieldValue::Null
            } else {
                FieldValue::Float(i as f64 / 10.0)
            };
            Row::new()
                .with("order_id", i as i64 + 1)
                .with("amount", (i as f64) * 2.5)
                .with("shipped", i % 2 == 0)
                .with("placed_at", base + chrono::Duration::hours(i as i64))
                .with("discount", discount)
        })
        .collect()
}
