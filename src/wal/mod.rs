//! Write-ahead log: on-disk segments, the records inside them, and the
//! watcher that tails them for delivery.

pub mod metrics;
pub mod record;
pub mod segment;
pub mod state;
pub mod watcher;
pub mod writer;

pub use metrics::WatcherMetrics;
pub use record::{Entry, LabelSet, Record, RefEntries, RefSeries, SeriesRef};
pub use state::State;
pub use watcher::{AppendError, Marker, Watcher, WriteCleanup, WriteTo};
pub use writer::{NilNotifier, WalWriter, WriteEventSubscriber, WriterEventsNotifier};
