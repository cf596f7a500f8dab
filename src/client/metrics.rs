use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

pub const HOST_LABEL: &str = "host";
pub const TENANT_LABEL: &str = "tenant";
pub const REASON_LABEL: &str = "reason";

pub const REASON_GENERIC: &str = "ingester_error";
pub const REASON_RATE_LIMITED: &str = "rate_limited";
pub const REASON_STREAM_LIMITED: &str = "stream_limited";
pub const REASON_LINE_TOO_LONG: &str = "line_too_long";

/// Every drop reason, used to pre-create counters for a new tenant.
pub const REASONS: [&str; 4] = [
    REASON_GENERIC,
    REASON_RATE_LIMITED,
    REASON_STREAM_LIMITED,
    REASON_LINE_TOO_LONG,
];

/// Delivery metrics for queue clients. One set is shared by all clients and
/// told apart by the `host` label.
#[derive(Clone)]
pub struct QueueClientMetrics {
    pub encoded_bytes: IntCounterVec,
    pub sent_bytes: IntCounterVec,
    pub dropped_bytes: IntCounterVec,
    pub sent_entries: IntCounterVec,
    pub dropped_entries: IntCounterVec,
    pub mutated_entries: IntCounterVec,
    pub mutated_bytes: IntCounterVec,
    pub request_duration: HistogramVec,
    pub batch_retries: IntCounterVec,
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let vec = IntCounterVec::new(
        Opts::new(name, help).namespace("logship").subsystem("write"),
        labels,
    )?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl QueueClientMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let per_reason = [HOST_LABEL, TENANT_LABEL, REASON_LABEL];

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "Duration of push requests.",
            )
            .namespace("logship")
            .subsystem("write"),
            &["status_code", HOST_LABEL],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            encoded_bytes: counter(
                registry,
                "encoded_bytes_total",
                "Number of bytes encoded and ready to send.",
                &[HOST_LABEL],
            )?,
            sent_bytes: counter(
                registry,
                "sent_bytes_total",
                "Number of bytes sent.",
                &[HOST_LABEL],
            )?,
            dropped_bytes: counter(
                registry,
                "dropped_bytes_total",
                "Number of bytes dropped because of failed delivery or limits.",
                &per_reason,
            )?,
            sent_entries: counter(
                registry,
                "sent_entries_total",
                "Number of log entries sent.",
                &[HOST_LABEL],
            )?,
            dropped_entries: counter(
                registry,
                "dropped_entries_total",
                "Number of log entries dropped because of failed delivery or limits.",
                &per_reason,
            )?,
            mutated_entries: counter(
                registry,
                "mutated_entries_total",
                "Number of log entries modified before sending, e.g. truncated.",
                &per_reason,
            )?,
            mutated_bytes: counter(
                registry,
                "mutated_bytes_total",
                "Number of bytes removed from log entries before sending.",
                &per_reason,
            )?,
            request_duration,
            batch_retries: counter(
                registry,
                "batch_retries_total",
                "Number of times batches have had to be retried.",
                &[HOST_LABEL, TENANT_LABEL],
            )?,
        })
    }

    /// Creates the per-tenant series at zero so they show up before the
    /// first drop.
    pub fn init_tenant(&self, host: &str, tenant: &str) {
        for reason in REASONS {
            let labels = [host, tenant, reason];
            self.dropped_bytes.with_label_values(&labels).inc_by(0);
            self.dropped_entries.with_label_values(&labels).inc_by(0);
            self.mutated_bytes.with_label_values(&labels).inc_by(0);
            self.mutated_entries.with_label_values(&labels).inc_by(0);
        }
        self.batch_retries.with_label_values(&[host, tenant]).inc_by(0);
    }

    pub fn record_dropped(&self, host: &str, tenant: &str, reason: &str, entries: u64, bytes: u64) {
        let labels = [host, tenant, reason];
        self.dropped_entries.with_label_values(&labels).inc_by(entries);
        self.dropped_bytes.with_label_values(&labels).inc_by(bytes);
    }
}
