//! Concurrent transfers sharing one download record

use std::sync::Arc;
use std::time::Duration;
use stream_relay::{
    DownloadStatus, DownloadTracker, RelayMetrics, TransferGuard, TransferOutcome,
};

const URL: &str = "https://github.com/owner/repo/releases/download/v1/tool.tar.gz";

fn tracker() -> Arc<DownloadTracker> {
    Arc::new(DownloadTracker::new(
        Duration::from_secs(1800),
        Duration::from_secs(10),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_ranges_aggregate_into_one_record() {
    const PARTS: u64 = 8;
    const PART_SIZE: u64 = 64 * 1024;
    let tracker = tracker();
    let metrics = Arc::new(RelayMetrics::new().unwrap());

    // Register every transfer before any of them finishes
    let guards: Vec<_> = (0..PARTS)
        .map(|_| {
            let record =
                tracker.get_or_create(URL, "tool.tar.gz", Some(PARTS * PART_SIZE), "192.0.2.10");
            TransferGuard::new(tracker.clone(), record, metrics.clone())
        })
        .collect();
    assert_eq!(metrics.active_transfers.get(), PARTS as i64);

    let tasks: Vec<_> = guards
        .into_iter()
        .map(|mut guard| {
            tokio::spawn(async move {
                for _ in 0..16 {
                    guard.record(PART_SIZE / 16);
                    tokio::task::yield_now().await;
                }
                guard.finish(TransferOutcome::Completed);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = tracker.snapshot(URL).unwrap();
    assert_eq!(snapshot.bytes_written, PARTS * PART_SIZE);
    assert_eq!(snapshot.active_connections, 0);
    assert_eq!(snapshot.status, Some(DownloadStatus::Completed));
    assert_eq!(metrics.active_transfers.get(), 0);
    assert_eq!(
        metrics.downloads_total.with_label_values(&["completed"]).get(),
        1
    );
    assert_eq!(metrics.bytes_relayed_total.get(), PARTS * PART_SIZE);
}

#[tokio::test]
async fn test_last_closer_decides_outcome() {
    let tracker = tracker();
    let metrics = Arc::new(RelayMetrics::new().unwrap());

    let first = tracker.get_or_create(URL, "tool.tar.gz", Some(1000), "192.0.2.10");
    let second = tracker.get_or_create(URL, "tool.tar.gz", Some(1000), "192.0.2.10");
    let mut a = TransferGuard::new(tracker.clone(), first, metrics.clone());
    let b = TransferGuard::new(tracker.clone(), second, metrics.clone());

    a.record(200);
    a.finish(TransferOutcome::Failed("upstream reset".to_string()));
    assert_eq!(tracker.snapshot(URL).unwrap().status, None);

    b.record(100);
    drop(b);

    let snapshot = tracker.snapshot(URL).unwrap();
    assert_eq!(snapshot.status, Some(DownloadStatus::Cancelled));
    assert_eq!(snapshot.bytes_written, 300);
}

#[test]
fn test_snapshots_serialize() {
    let tracker = tracker();
    let record = tracker.get_or_create(URL, "tool.tar.gz", None, "192.0.2.10");
    record.update_progress(512);
    tracker.connection_closed(&record, &TransferOutcome::ClientDisconnected);

    let json = serde_json::to_value(tracker.snapshots()).unwrap();
    let entry = &json[0];
    assert_eq!(entry["url"], URL);
    assert_eq!(entry["bytes_written"], 512);
    assert_eq!(entry["total_size"], serde_json::Value::Null);
    assert_eq!(entry["status"], "cancelled");
    assert_eq!(entry["completed"], true);
}

#[tokio::test(start_paused = true)]
async fn test_finished_records_expire() {
    let tracker = Arc::new(DownloadTracker::new(
        Duration::from_secs(120),
        Duration::from_secs(10),
    ));
    let finished = tracker.get_or_create("https://e.com/a.zip", "a.zip", Some(1), "ip");
    finished.update_progress(1);
    tracker.connection_closed(&finished, &TransferOutcome::Completed);
    let _open = tracker.get_or_create("https://e.com/b.zip", "b.zip", Some(10), "ip");

    tracker.start(Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(tracker.len(), 2);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(tracker.len(), 1);
    assert!(tracker.snapshot("https://e.com/b.zip").is_some());

    tracker.shutdown().await;
}
