use prometheus::{GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Watcher metrics shared by every watcher, labelled by watcher id.
#[derive(Clone)]
pub struct WatcherMetrics {
    pub records_read: IntCounterVec,
    pub record_decode_fails: IntCounterVec,
    pub dropped_write_notifications: IntCounterVec,
    pub segment_read: IntCounterVec,
    pub current_segment: IntGaugeVec,
    pub replay_segment: IntGaugeVec,
    pub last_read_timestamp: GaugeVec,
    pub watchers_running: IntGauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help)
        .namespace("logship")
        .subsystem("wal_watcher")
}

impl WatcherMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            records_read: IntCounterVec::new(
                opts("records_read_total", "Number of records read by the WAL watcher."),
                &["id"],
            )?,
            record_decode_fails: IntCounterVec::new(
                opts(
                    "record_decode_failures_total",
                    "Number of records read by the WAL watcher that could not be decoded.",
                ),
                &["id"],
            )?,
            dropped_write_notifications: IntCounterVec::new(
                opts(
                    "dropped_write_notifications_total",
                    "Number of write notifications dropped because the watcher was busy.",
                ),
                &["id"],
            )?,
            segment_read: IntCounterVec::new(
                opts(
                    "segment_read_total",
                    "Number of segment reads, by what triggered them.",
                ),
                &["id", "reason"],
            )?,
            current_segment: IntGaugeVec::new(
                opts("current_segment", "Segment the WAL watcher is currently reading."),
                &["id"],
            )?,
            replay_segment: IntGaugeVec::new(
                opts(
                    "replay_segment",
                    "Segment the WAL watcher resumed from after a restart.",
                ),
                &["id"],
            )?,
            last_read_timestamp: GaugeVec::new(
                opts(
                    "last_read_timestamp_seconds",
                    "Timestamp of the newest entry read by the WAL watcher.",
                ),
                &["id"],
            )?,
            watchers_running: IntGauge::with_opts(opts(
                "running",
                "Number of WAL watchers running.",
            ))?,
        };

        registry.register(Box::new(metrics.records_read.clone()))?;
        registry.register(Box::new(metrics.record_decode_fails.clone()))?;
        registry.register(Box::new(metrics.dropped_write_notifications.clone()))?;
        registry.register(Box::new(metrics.segment_read.clone()))?;
        registry.register(Box::new(metrics.current_segment.clone()))?;
        registry.register(Box::new(metrics.replay_segment.clone()))?;
        registry.register(Box::new(metrics.last_read_timestamp.clone()))?;
        registry.register(Box::new(metrics.watchers_running.clone()))?;

        Ok(metrics)
    }
}
