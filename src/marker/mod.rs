//! Delivery watermark. Each client persists the highest WAL segment whose
//! entries have all been delivered (or deliberately dropped), so a restart
//! can resume after it instead of replaying the whole WAL.

pub mod file;
pub mod handler;
pub mod metrics;

pub use file::{MarkerError, MarkerFileHandler, MarkerStore};
pub use handler::{MarkerHandle, MarkerHandler};
pub use metrics::{CurriedMarkerMetrics, MarkerMetrics};
