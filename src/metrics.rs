//! Engine metrics.
//!
//! Counters for submission, completion, and failure volume, exposed through
//! the `metriken` registry for Prometheus-style exposition by the embedding
//! application.

use metriken::{metric, Counter};

#[metric(
    name = "tidepool/requests/submitted",
    description = "Submissions accepted into the pool"
)]
pub static REQUESTS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "tidepool/requests/completed",
    description = "Terminal callbacks delivered"
)]
pub static REQUESTS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "tidepool/requests/retried",
    description = "Transfers re-queued after a retryable failure"
)]
pub static REQUESTS_RETRIED: Counter = Counter::new();

#[metric(
    name = "tidepool/requests/cancelled",
    description = "Transfers completed as cancelled"
)]
pub static REQUESTS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "tidepool/requests/overloaded",
    description = "Submissions rejected because the pool was exhausted"
)]
pub static REQUESTS_OVERLOADED: Counter = Counter::new();

#[metric(
    name = "tidepool/bytes/received",
    description = "Response body bytes delivered to payload sinks"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();
