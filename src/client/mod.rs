//! Delivery side: batching WAL entries per tenant and pushing them to the
//! remote endpoint with retries.

pub mod backoff;
pub mod batch;
pub mod labels;
pub mod manager;
pub mod metrics;
pub mod push;
pub mod queue;
pub mod queue_client;
pub mod series;

pub use batch::{Batch, BatchError};
pub use manager::{Manager, ManagerError};
pub use metrics::QueueClientMetrics;
pub use push::{HttpPushClient, PushClient, PushError};
pub use queue_client::{QueueClient, QueueClientError};
