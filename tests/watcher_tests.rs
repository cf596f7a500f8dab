/// WAL watcher tests against a real on-disk WAL.
///
/// These tests cover:
/// - Reads triggered by write notifications and by the backup timer
/// - Moving on to newer segments
/// - Where a watcher starts, with and without a marker
/// - Draining and the drain timeout
/// - Records that fail to decode

mod common;

use common::*;
use logship::config::WatchConfig;
use logship::wal::{
    Marker, State, WalWriter, Watcher, WatcherMetrics, WriteEventSubscriber, WriterEventsNotifier,
};
use prometheus::Registry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn watch_config(min: Duration, max: Duration) -> WatchConfig {
        WatchConfig {
            min_read_frequency: min,
            max_read_frequency: max,
            drain_timeout: Duration::from_secs(5),
        }
    }

    /// Reads only on notifications or segment changes.
    fn idle_timer() -> WatchConfig {
        watch_config(Duration::from_secs(3600), Duration::from_secs(3600))
    }

    fn fast_timer() -> WatchConfig {
        watch_config(Duration::from_millis(10), Duration::from_millis(40))
    }

    fn new_watcher(
        writer: &WalWriter,
        write_to: Arc<RecordingWriteTo>,
        config: WatchConfig,
        marker: Option<Arc<dyn Marker>>,
    ) -> (Arc<Watcher>, WatcherMetrics) {
        let metrics = WatcherMetrics::new(&Registry::new()).unwrap();
        let watcher = Arc::new(Watcher::new(
            writer.dir(),
            "test",
            metrics.clone(),
            write_to,
            config,
            marker,
        ));
        (watcher, metrics)
    }

    fn write(writer: &WalWriter, line: &str) {
        writer
            .write_entries(&labels(&[("app", "api")]), vec![entry(line)])
            .unwrap();
    }

    /// Writes "a", "b" and "c" into segments 0, 1 and 2.
    fn three_segments(writer: &WalWriter) {
        write(writer, "a");
        writer.next_segment().unwrap();
        write(writer, "b");
        writer.next_segment().unwrap();
        write(writer, "c");
    }

    #[tokio::test]
    async fn test_write_notification_triggers_read() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::new());
        let (watcher, metrics) = new_watcher(&writer, recorder.clone(), idle_timer(), None);
        writer.subscribe_write(watcher.clone());

        watcher.start();
        // Give the read loop time to park and listen.
        tokio::time::sleep(Duration::from_millis(300)).await;
        write(&writer, "hello");

        assert!(eventually(WAIT, || recorder.lines() == vec!["hello"]).await);
        assert!(
            metrics
                .segment_read
                .with_label_values(&["test", "notification"])
                .get()
                >= 1
        );
        let series = recorder.series_labels(1).unwrap();
        assert_eq!(series.get("app").map(String::as_str), Some("api"));

        watcher.stop().await;
        assert_eq!(watcher.state(), State::Stopping);
    }

    #[tokio::test]
    async fn test_backup_timer_reads_without_notifications() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::new());
        let (watcher, _metrics) = new_watcher(&writer, recorder.clone(), fast_timer(), None);

        write(&writer, "before start");
        watcher.start();
        write(&writer, "after start");

        assert!(eventually(WAIT, || recorder.lines().len() == 2).await);
        assert_eq!(recorder.lines(), vec!["before start", "after start"]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_moves_on_to_newer_segment() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::new());
        let (watcher, metrics) = new_watcher(&writer, recorder.clone(), fast_timer(), None);

        write(&writer, "first");
        watcher.start();
        assert!(eventually(WAIT, || recorder.lines().len() == 1).await);

        writer.next_segment().unwrap();
        write(&writer, "second");

        assert!(eventually(WAIT, || recorder.lines().len() == 2).await);
        assert_eq!(recorder.lines(), vec!["first", "second"]);
        assert_eq!(recorder.segments(), vec![0, 1]);
        assert!(
            eventually(WAIT, || metrics
                .current_segment
                .with_label_values(&["test"])
                .get()
                == 1)
            .await
        );
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_starts_at_newest_segment_without_marker() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        three_segments(&writer);

        let recorder = Arc::new(RecordingWriteTo::new());
        let (watcher, _metrics) = new_watcher(&writer, recorder.clone(), fast_timer(), None);
        watcher.start();

        assert!(eventually(WAIT, || !recorder.lines().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.lines(), vec!["c"]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_unset_marker_starts_at_newest_segment() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        three_segments(&writer);

        let recorder = Arc::new(RecordingWriteTo::new());
        let marker: Arc<dyn Marker> = Arc::new(FixedMarker(-1));
        let (watcher, _metrics) =
            new_watcher(&writer, recorder.clone(), fast_timer(), Some(marker));
        watcher.start();

        assert!(eventually(WAIT, || !recorder.lines().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.lines(), vec!["c"]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_replays_segments_after_marker() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        three_segments(&writer);

        let recorder = Arc::new(RecordingWriteTo::new());
        let marker: Arc<dyn Marker> = Arc::new(FixedMarker(0));
        let (watcher, metrics) =
            new_watcher(&writer, recorder.clone(), fast_timer(), Some(marker));
        watcher.start();

        assert!(eventually(WAIT, || recorder.lines().len() == 2).await);
        assert_eq!(recorder.lines(), vec!["b", "c"]);
        assert_eq!(recorder.segments(), vec![1, 2]);
        assert_eq!(
            metrics.replay_segment.with_label_values(&["test"]).get(),
            1
        );
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_drain_reads_to_end_then_stops() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::new());
        let (watcher, _metrics) = new_watcher(&writer, recorder.clone(), idle_timer(), None);

        write(&writer, "a");
        write(&writer, "b");
        watcher.start();

        tokio::time::timeout(Duration::from_secs(3), watcher.drain())
            .await
            .expect("drain finishes before its timeout");
        assert_eq!(watcher.state(), State::Stopping);
        assert_eq!(recorder.lines(), vec!["a", "b"]);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_drain_timeout_forces_stop() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::gated());
        let mut config = fast_timer();
        config.drain_timeout = Duration::from_millis(200);
        let (watcher, _metrics) = new_watcher(&writer, recorder.clone(), config, None);

        write(&writer, "stuck");
        watcher.start();
        assert!(
            eventually(WAIT, || recorder.appends_started.load(Ordering::SeqCst) == 1).await
        );

        let started = tokio::time::Instant::now();
        watcher.drain().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(watcher.state(), State::Stopping);

        recorder.open_gate();
        tokio::time::timeout(Duration::from_secs(3), watcher.stop())
            .await
            .expect("watcher stops once the append returns");
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::new());
        let (watcher, metrics) = new_watcher(&writer, recorder.clone(), fast_timer(), None);

        writer.write_raw(b"definitely not a record").unwrap();
        write(&writer, "valid");
        watcher.start();

        assert!(eventually(WAIT, || recorder.lines() == vec!["valid"]).await);
        assert_eq!(
            metrics
                .record_decode_fails
                .with_label_values(&["test"])
                .get(),
            1
        );
        assert_eq!(metrics.records_read.with_label_values(&["test"]).get(), 2);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_notification_dropped_when_not_listening() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::new());
        let (watcher, metrics) = new_watcher(&writer, recorder, idle_timer(), None);

        watcher.notify_write();
        watcher.notify_write();
        assert_eq!(
            metrics
                .dropped_write_notifications
                .with_label_values(&["test"])
                .get(),
            2
        );
    }

    #[tokio::test]
    async fn test_truncate_reaches_cleanup_subscribers() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path()).unwrap();
        let recorder = Arc::new(RecordingWriteTo::new());
        writer.subscribe_cleanup(recorder.clone());

        three_segments(&writer);
        assert_eq!(writer.truncate(1).unwrap(), 2);
        assert_eq!(recorder.resets(), vec![1]);
    }
}
