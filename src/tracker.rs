//! Aggregate progress for concurrent downloads of the same target
//!
//! Several transfers of one URL (client retries, ranged requests) share a
//! single [`DownloadRecord`]. Locking is two-level: the tracker's map lock
//! guards record existence, each record's own lock guards its counters. The
//! map lock is always taken before a record lock, never the other way round.

use crate::models::format_size;
use crate::task::PeriodicTask;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error text fragments that mean the client went away
const CLIENT_DISCONNECT_SIGNATURES: [&str; 6] = [
    "broken pipe",
    "reset by peer",
    "connection reset",
    "context canceled",
    "cancelled",
    "client disconnected",
];

/// How one transfer of a download ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The origin body was copied to the end
    Completed,
    /// The client stopped reading before the end
    ClientDisconnected,
    /// The upstream side failed mid-stream
    Failed(String),
}

impl TransferOutcome {
    /// Classify a streaming error by its message
    pub fn from_error(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_client_disconnect(&message) {
            TransferOutcome::ClientDisconnected
        } else {
            TransferOutcome::Failed(message)
        }
    }
}

/// Whether an error message carries a client-disconnect signature
pub fn is_client_disconnect(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CLIENT_DISCONNECT_SIGNATURES.iter().any(|s| lower.contains(s))
}

/// Terminal classification of a download record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Completed,
    Cancelled,
    Errored,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Completed => "completed",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Errored => "errored",
        }
    }
}

#[derive(Debug)]
struct RecordState {
    bytes_written: u64,
    last_log: Instant,
    completed: bool,
    status: Option<DownloadStatus>,
    active_connections: usize,
}

/// Shared state of every transfer of one target URL
#[derive(Debug)]
pub struct DownloadRecord {
    url: String,
    file_name: String,
    client_ip: String,
    total_size: Option<u64>,
    start_time: Instant,
    progress_interval: Duration,
    state: Mutex<RecordState>,
}

impl DownloadRecord {
    fn new(
        url: &str,
        file_name: &str,
        client_ip: &str,
        total_size: Option<u64>,
        progress_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        DownloadRecord {
            url: url.to_string(),
            file_name: file_name.to_string(),
            client_ip: client_ip.to_string(),
            total_size,
            start_time: now,
            progress_interval,
            state: Mutex::new(RecordState {
                bytes_written: 0,
                last_log: now,
                completed: false,
                status: None,
                active_connections: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    /// Account `delta` bytes written to a client
    ///
    /// Emits a progress line at most once per progress interval while the
    /// record is still open.
    pub fn update_progress(&self, delta: u64) {
        let mut state = self.state();
        state.bytes_written += delta;

        let now = Instant::now();
        if !state.completed && now.duration_since(state.last_log) >= self.progress_interval {
            self.log_progress(&state);
            state.last_log = now;
        }
    }

    fn log_progress(&self, state: &RecordState) {
        let speed = mb_per_sec(state.bytes_written, self.start_time.elapsed());
        match self.total_size.filter(|t| *t > 0) {
            Some(total) => info!(
                client_ip = %self.client_ip,
                file = %self.file_name,
                "Download progress: {:.2}% ({} / {}), {:.2} MB/s, {} active connections",
                state.bytes_written as f64 * 100.0 / total as f64,
                format_size(Some(state.bytes_written)),
                format_size(Some(total)),
                speed,
                state.active_connections
            ),
            None => info!(
                client_ip = %self.client_ip,
                file = %self.file_name,
                "Download progress: {}, {:.2} MB/s, {} active connections",
                format_size(Some(state.bytes_written)),
                speed,
                state.active_connections
            ),
        }
    }

    /// Current counters
    pub fn snapshot(&self) -> DownloadSnapshot {
        let state = self.state();
        DownloadSnapshot {
            url: self.url.clone(),
            file_name: self.file_name.clone(),
            client_ip: self.client_ip.clone(),
            total_size: self.total_size,
            bytes_written: state.bytes_written,
            active_connections: state.active_connections,
            completed: state.completed,
            status: state.status,
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Point-in-time view of a [`DownloadRecord`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadSnapshot {
    pub url: String,
    pub file_name: String,
    pub client_ip: String,
    pub total_size: Option<u64>,
    pub bytes_written: u64,
    pub active_connections: usize,
    pub completed: bool,
    pub status: Option<DownloadStatus>,
    pub elapsed_secs: f64,
}

/// Registry of in-flight and recently finished downloads
pub struct DownloadTracker {
    downloads: RwLock<HashMap<String, Arc<DownloadRecord>>>,
    retention: Duration,
    progress_interval: Duration,
    cleanup_task: Mutex<Option<PeriodicTask>>,
}

impl DownloadTracker {
    /// # Arguments
    /// * `retention` - How long a finished record outlives its last log line
    /// * `progress_interval` - Minimum gap between progress lines per record
    pub fn new(retention: Duration, progress_interval: Duration) -> Self {
        DownloadTracker {
            downloads: RwLock::new(HashMap::new()),
            retention,
            progress_interval,
            cleanup_task: Mutex::new(None),
        }
    }

    /// Register one more transfer of `url`
    ///
    /// Creates the record (and logs the start) when none exists or when the
    /// previous download of the same URL already finished; always increments
    /// the active-connection count of the returned record.
    pub fn get_or_create(
        &self,
        url: &str,
        file_name: &str,
        total_size: Option<u64>,
        client_ip: &str,
    ) -> Arc<DownloadRecord> {
        let mut downloads = self.downloads.write().unwrap_or_else(PoisonError::into_inner);

        let reusable = downloads
            .get(url)
            .filter(|record| !record.state().completed)
            .cloned();
        let record = match reusable {
            Some(record) => record,
            None => {
                let record = Arc::new(DownloadRecord::new(
                    url,
                    file_name,
                    client_ip,
                    total_size,
                    self.progress_interval,
                ));
                downloads.insert(url.to_string(), record.clone());
                info!(
                    client_ip = %client_ip,
                    file = %file_name,
                    "Download started, expected size: {}",
                    format_size(total_size)
                );
                record
            }
        };

        record.state().active_connections += 1;
        record
    }

    /// One transfer of `record` ended with `outcome`
    ///
    /// The last transfer to close classifies the record, once. Returns the
    /// classification when this call made it.
    pub fn connection_closed(
        &self,
        record: &DownloadRecord,
        outcome: &TransferOutcome,
    ) -> Option<DownloadStatus> {
        let mut state = record.state();

        state.active_connections = state.active_connections.saturating_sub(1);
        if state.active_connections > 0 || state.completed {
            return None;
        }

        let reached_total = record
            .total_size
            .is_some_and(|total| state.bytes_written >= total);

        let status = match outcome {
            _ if reached_total => DownloadStatus::Completed,
            TransferOutcome::Completed => DownloadStatus::Completed,
            TransferOutcome::ClientDisconnected => DownloadStatus::Cancelled,
            TransferOutcome::Failed(_) => DownloadStatus::Errored,
        };

        state.completed = true;
        state.status = Some(status);
        state.last_log = Instant::now();

        let elapsed = record.start_time.elapsed();
        match (status, outcome) {
            (DownloadStatus::Completed, _) => info!(
                client_ip = %record.client_ip,
                file = %record.file_name,
                size = %format_size(Some(state.bytes_written)),
                "Download completed in {:.2}s, {:.2} MB/s",
                elapsed.as_secs_f64(),
                mb_per_sec(state.bytes_written, elapsed)
            ),
            (DownloadStatus::Cancelled, _) => info!(
                client_ip = %record.client_ip,
                file = %record.file_name,
                "Download cancelled: client disconnected after {}",
                format_size(Some(state.bytes_written))
            ),
            (DownloadStatus::Errored, TransferOutcome::Failed(message)) => warn!(
                client_ip = %record.client_ip,
                file = %record.file_name,
                "Download failed: {}",
                message
            ),
            (DownloadStatus::Errored, _) => warn!(
                client_ip = %record.client_ip,
                file = %record.file_name,
                "Download failed"
            ),
        }

        Some(status)
    }

    /// Drop finished records idle for longer than the retention period
    pub fn cleanup_old_downloads(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// [`DownloadTracker::cleanup_old_downloads`] against an explicit clock reading
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut downloads = self.downloads.write().unwrap_or_else(PoisonError::into_inner);
        let before = downloads.len();

        downloads.retain(|_, record| {
            let state = record.state();
            let expired = state.completed
                && state.active_connections == 0
                && now.saturating_duration_since(state.last_log) > self.retention;
            !expired
        });

        let removed = before - downloads.len();
        if removed > 0 {
            debug!(
                "Removed {} finished download records, {} remaining",
                removed,
                downloads.len()
            );
        }
        removed
    }

    /// Snapshot of the record for `url`, if tracked
    pub fn snapshot(&self, url: &str) -> Option<DownloadSnapshot> {
        self.downloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .map(|record| record.snapshot())
    }

    /// Snapshots of every tracked record
    pub fn snapshots(&self) -> Vec<DownloadSnapshot> {
        self.downloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|record| record.snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.downloads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic cleanup sweep
    pub fn start(self: &Arc<Self>, cleanup_interval: Duration) {
        let tracker: Weak<Self> = Arc::downgrade(self);
        let task = PeriodicTask::spawn("download-cleanup", cleanup_interval, move || {
            match tracker.upgrade() {
                Some(tracker) => {
                    tracker.cleanup_old_downloads();
                    true
                }
                None => false,
            }
        });

        *self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Stop the cleanup sweep, if running
    pub async fn shutdown(&self) {
        let task = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.stop().await;
        }
    }
}

fn mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 / secs / 1024.0 / 1024.0
}
