use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

/// Marker metrics shared by every client, labelled by client id.
#[derive(Clone)]
pub struct MarkerMetrics {
    last_marked_segment: IntGaugeVec,
    marker_write_failures: IntCounterVec,
}

impl MarkerMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let last_marked_segment = IntGaugeVec::new(
            Opts::new(
                "last_marked_segment",
                "Last segment whose data was fully delivered and persisted as the marker.",
            )
            .namespace("logship")
            .subsystem("wal_marker"),
            &["id"],
        )?;
        let marker_write_failures = IntCounterVec::new(
            Opts::new(
                "write_failures_total",
                "Number of failed attempts to persist the segment marker.",
            )
            .namespace("logship")
            .subsystem("wal_marker"),
            &["id"],
        )?;

        registry.register(Box::new(last_marked_segment.clone()))?;
        registry.register(Box::new(marker_write_failures.clone()))?;

        Ok(Self {
            last_marked_segment,
            marker_write_failures,
        })
    }

    /// Binds the metrics to one client id.
    pub fn curried(&self, id: &str) -> CurriedMarkerMetrics {
        CurriedMarkerMetrics {
            last_marked_segment: self.last_marked_segment.with_label_values(&[id]),
            marker_write_failures: self.marker_write_failures.with_label_values(&[id]),
        }
    }
}

#[derive(Clone)]
pub struct CurriedMarkerMetrics {
    pub last_marked_segment: IntGauge,
    pub marker_write_failures: IntCounter,
}
