// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-file transfer state machine: owns the destination file, the
//! done/in-flight/pending range sets, and the sidecar status file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::sync::watch;

use crate::error::{FetchError, FetchResult};
use crate::storage::range::{Range, RangeSet};

const SIDECAR_SUFFIX: &str = ".status.json";
const MAX_RECENT_ERRORS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    New,
    Planning,
    Running,
    Stalled,
    Done,
    Failed,
    Cancelled,
}

/// One unit of work a worker executes: fetch `range` of `url` and write it at
/// `destination_offset` in the destination file.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub url: String,
    pub range: Range,
    pub destination_offset: u64,
    pub destination_path: PathBuf,
}

/// Result of executing a `WorkItem`, routed back to the Supervisor.
#[derive(Debug)]
pub enum WorkResult {
    Executed { range: Range, bytes_written: u64 },
    Failed { range: Range, error: FetchError },
}

/// Serialized form persisted next to the destination file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarStatus {
    pub document_length: u64,
    pub done: Vec<(u64, u64)>,
    pub crc32c: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub bytes_done: u64,
}

impl SidecarStatus {
    fn done_as_range_set(&self) -> RangeSet {
        RangeSet::from_ranges(self.done.iter().map(|(s, e)| Range::new(*s, *e)).collect())
    }

    fn from_parts(
        document_length: u64,
        done: &RangeSet,
        crc32c: Option<String>,
        started_at: DateTime<Utc>,
        last_progress_at: DateTime<Utc>,
        bytes_done: u64,
    ) -> Self {
        Self {
            document_length,
            done: done.iter().map(|r| (r.start, r.end)).collect(),
            crc32c,
            started_at,
            last_progress_at,
            bytes_done,
        }
    }
}

/// Snapshot returned to callers of `GetRequest`.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    pub url: String,
    pub path: String,
    pub finished: bool,
    pub size: Option<u64>,
    pub transferred: Option<u64>,
    pub duration_seconds: f64,
    pub progress: Option<f64>,
    pub average_speed_bytes_per_sec: Option<f64>,
}

fn sidecar_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Per-artifact download state machine.
pub struct Transfer {
    pub logical_url: String,
    pub local_path: PathBuf,
    pub document_length: Option<u64>,
    pub expected_crc32c: Option<String>,
    pub multipart_size: u64,
    pub max_connections: usize,

    done: RangeSet,
    in_flight: RangeSet,

    state: TransferState,
    recent_errors: VecDeque<String>,
    started_at: DateTime<Utc>,
    last_progress_at: DateTime<Utc>,
    last_progress_instant: Instant,
    bytes_done: u64,

    file: Option<File>,
    watch_tx: watch::Sender<TransferStatus>,
}

impl Transfer {
    pub fn new(logical_url: String, local_path: PathBuf, multipart_size: u64, max_connections: usize) -> Self {
        let now = Utc::now();
        let initial = TransferStatus {
            url: logical_url.clone(),
            path: local_path.display().to_string(),
            finished: false,
            size: None,
            transferred: Some(0),
            duration_seconds: 0.0,
            progress: None,
            average_speed_bytes_per_sec: None,
        };
        let (watch_tx, _) = watch::channel(initial);
        Self {
            logical_url,
            local_path,
            document_length: None,
            expected_crc32c: None,
            multipart_size,
            max_connections,
            done: RangeSet::new(),
            in_flight: RangeSet::new(),
            state: TransferState::New,
            recent_errors: VecDeque::new(),
            started_at: now,
            last_progress_at: now,
            last_progress_instant: Instant::now(),
            bytes_done: 0,
            file: None,
            watch_tx,
        }
    }

    /// Subscribe to this transfer's status, for callers that want to watch a
    /// long operation instead of polling `status()` on a timer.
    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.watch_tx.subscribe()
    }

    fn notify_watchers(&self) {
        let _ = self.watch_tx.send(self.status());
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn done(&self) -> &RangeSet {
        &self.done
    }

    pub fn in_flight(&self) -> &RangeSet {
        &self.in_flight
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TransferState::Done)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            TransferState::Done | TransferState::Failed | TransferState::Cancelled
        )
    }

    fn pending(&self) -> RangeSet {
        let length = self.document_length.unwrap_or(0);
        if length == 0 {
            return RangeSet::new();
        }
        RangeSet::single(0, length).difference(&self.done.union(&self.in_flight))
    }

    /// NEW -> PLANNING: open or create the destination file, pre-allocate to
    /// `document_length`, and load the sidecar if present and consistent.
    pub async fn start(&mut self, document_length: u64, expected_crc32c: Option<String>) -> FetchResult<()> {
        if self.is_terminal() {
            return Ok(());
        }
        if self.document_length.is_none() {
            self.document_length = Some(document_length);
            self.expected_crc32c = expected_crc32c;
            self.seed_from_sidecar_or_fresh().await?;
        }
        if self.done.size() == self.document_length.unwrap_or(0) {
            self.finalize().await?;
            return Ok(());
        }
        if self.state == TransferState::New {
            self.state = TransferState::Planning;
        }
        Ok(())
    }

    async fn seed_from_sidecar_or_fresh(&mut self) -> FetchResult<()> {
        let document_length = self.document_length.unwrap_or(0);
        let sidecar_path = sidecar_path(&self.local_path);

        if let Some(parent) = self.local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| FetchError::Io {
                path: self.local_path.display().to_string(),
                source: e,
            })?;
        }

        let loaded = match tokio::fs::read_to_string(&sidecar_path).await {
            Ok(content) => serde_json::from_str::<SidecarStatus>(&content).ok(),
            Err(_) => None,
        };

        let consistent = loaded.as_ref().is_some_and(|s| {
            s.document_length == document_length
                && match (&s.crc32c, &self.expected_crc32c) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
        });

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.local_path)
            .await
            .map_err(|e| FetchError::Io {
                path: self.local_path.display().to_string(),
                source: e,
            })?;
        file.set_len(document_length).await.map_err(|e| FetchError::Io {
            path: self.local_path.display().to_string(),
            source: e,
        })?;

        if consistent {
            let sidecar = loaded.unwrap();
            self.done = sidecar.done_as_range_set();
            self.bytes_done = sidecar.bytes_done;
            self.started_at = sidecar.started_at;
            self.last_progress_at = sidecar.last_progress_at;
        } else {
            let _ = tokio::fs::remove_file(&sidecar_path).await;
            self.done = RangeSet::new();
            self.bytes_done = 0;
        }

        self.file = Some(file);
        Ok(())
    }

    /// Pick the lowest-offset contiguous sub-range of `pending`, sized
    /// `min(multipart_size, remaining_at_offset)`, and mark it in-flight.
    pub fn next_work_item(&mut self) -> Option<WorkItem> {
        if self.in_flight.len() >= self.max_connections {
            return None;
        }
        let document_length = self.document_length?;
        let gap = self.pending().first_gap_within(Range::new(0, document_length))?;
        let end = gap.end.min(gap.start + self.multipart_size);
        let range = Range::new(gap.start, end);

        self.in_flight = self.in_flight.union(&RangeSet::single(range.start, range.end));
        if matches!(self.state, TransferState::Planning | TransferState::Stalled) {
            self.state = TransferState::Running;
        }

        Some(WorkItem {
            url: self.logical_url.clone(),
            range,
            destination_offset: range.start,
            destination_path: self.local_path.clone(),
        })
    }

    /// Task success: move `range` from in-flight to done, refresh the sidecar.
    pub async fn complete_range(&mut self, range: Range) -> FetchResult<()> {
        self.in_flight = self.in_flight.difference(&RangeSet::single(range.start, range.end));
        self.done = self.done.union(&RangeSet::single(range.start, range.end));
        self.bytes_done += range.size();
        self.last_progress_at = Utc::now();
        self.last_progress_instant = Instant::now();
        self.save_status().await?;

        if let Some(length) = self.document_length {
            if self.done.size() == length {
                self.finalize().await?;
            }
        }
        self.notify_watchers();
        Ok(())
    }

    /// Task failure: move `range` back to pending and record the error. A
    /// permanent error fails the whole transfer.
    pub fn fail_range(&mut self, range: Range, error: FetchError) {
        self.in_flight = self.in_flight.difference(&RangeSet::single(range.start, range.end));
        if self.recent_errors.len() >= MAX_RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error.to_string());
        if error.is_permanent() {
            self.state = TransferState::Failed;
        }
        self.notify_watchers();
    }

    /// RUNNING -> STALLED detection, called from the monitor tick.
    pub fn check_stall(&mut self, stall_timeout: std::time::Duration) {
        if self.state != TransferState::Running {
            return;
        }
        if self.in_flight.is_empty()
            && !self.pending().is_empty()
            && self.last_progress_instant.elapsed() > stall_timeout
        {
            self.state = TransferState::Stalled;
        }
    }

    /// Verify crc32c once `done` is contiguous from 0 across the whole document,
    /// and transition to DONE. Discards the destination and sidecar on mismatch.
    async fn finalize(&mut self) -> FetchResult<()> {
        let document_length = self.document_length.unwrap_or(0);
        if self.done.size() != document_length {
            return Ok(());
        }
        if document_length > 0 && self.done.as_slice().len() != 1 {
            return Ok(());
        }

        if let Some(expected) = self.expected_crc32c.clone() {
            let measured = self.compute_crc32c().await?;
            if measured != expected {
                self.discard().await?;
                self.state = TransferState::Failed;
                return Err(FetchError::ChecksumMismatch {
                    path: self.local_path.display().to_string(),
                    expected,
                    actual: measured,
                });
            }
        }

        if let Some(file) = &self.file {
            file.sync_all().await.map_err(|e| FetchError::Io {
                path: self.local_path.display().to_string(),
                source: e,
            })?;
        }
        let _ = tokio::fs::remove_file(sidecar_path(&self.local_path)).await;
        self.state = TransferState::Done;
        Ok(())
    }

    async fn compute_crc32c(&mut self) -> FetchResult<String> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let file = self.file.as_mut().ok_or_else(|| FetchError::Io {
            path: self.local_path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "transfer file not open"),
        })?;
        file.seek(std::io::SeekFrom::Start(0)).await.map_err(|e| FetchError::Io {
            path: self.local_path.display().to_string(),
            source: e,
        })?;

        let mut hasher: u32 = 0;
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| FetchError::Io {
                path: self.local_path.display().to_string(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            hasher = crc32c::crc32c_append(hasher, &buf[..n]);
        }
        Ok(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hasher.to_be_bytes()))
    }

    /// Persist the sidecar status file: write-then-rename for atomicity.
    pub async fn save_status(&self) -> FetchResult<()> {
        let Some(document_length) = self.document_length else {
            return Ok(());
        };
        let status = SidecarStatus::from_parts(
            document_length,
            &self.done,
            self.expected_crc32c.clone(),
            self.started_at,
            self.last_progress_at,
            self.bytes_done,
        );
        let serialized = serde_json::to_vec_pretty(&status).map_err(|e| FetchError::Sidecar {
            path: self.local_path.display().to_string(),
            message: e.to_string(),
        })?;

        let final_path = sidecar_path(&self.local_path);
        let tmp_path = final_path.with_extension("status.json.tmp");
        tokio::fs::write(&tmp_path, &serialized).await.map_err(|e| FetchError::Io {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        tokio::fs::rename(&tmp_path, &final_path).await.map_err(|e| FetchError::Io {
            path: final_path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Remove the destination file and sidecar, used on checksum mismatch.
    async fn discard(&mut self) -> FetchResult<()> {
        self.file = None;
        let _ = tokio::fs::remove_file(&self.local_path).await;
        let _ = tokio::fs::remove_file(sidecar_path(&self.local_path)).await;
        Ok(())
    }

    /// Any state -> CANCELLED. Partial bytes and sidecar are left on disk.
    pub fn close(&mut self) {
        if !self.is_terminal() {
            self.state = TransferState::Cancelled;
        }
        self.file = None;
        self.notify_watchers();
    }

    pub fn status(&self) -> TransferStatus {
        let duration = (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;
        let size = self.document_length;
        let progress = size.map(|s| if s == 0 { 1.0 } else { self.bytes_done as f64 / s as f64 });
        let speed = if duration > 0.0 {
            Some(self.bytes_done as f64 / duration)
        } else {
            None
        };
        TransferStatus {
            url: self.logical_url.clone(),
            path: self.local_path.display().to_string(),
            finished: self.is_finished(),
            size,
            transferred: Some(self.bytes_done),
            duration_seconds: duration,
            progress,
            average_speed_bytes_per_sec: speed,
        }
    }

    pub fn recent_errors(&self) -> Vec<String> {
        self.recent_errors.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    /// Mirrors the worker's write discipline: open an independent handle to
    /// the destination file and write at a fixed offset.
    async fn write_range(path: &Path, offset: u64, data: &[u8]) {
        let mut file = OpenOptions::new().write(true).open(path).await.unwrap();
        file.seek(std::io::SeekFrom::Start(offset)).await.unwrap();
        file.write_all(data).await.unwrap();
    }

    #[tokio::test]
    async fn start_preallocates_and_begins_planning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path.clone(), 1024, 2);
        transfer.start(16, None).await.unwrap();
        assert_eq!(transfer.state(), TransferState::Planning);
        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 16);
    }

    #[tokio::test]
    async fn next_work_item_respects_multipart_and_connection_bound() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path, 8 * 1024 * 1024, 3);
        transfer.start(20 * 1024 * 1024, None).await.unwrap();

        let w1 = transfer.next_work_item().unwrap();
        let w2 = transfer.next_work_item().unwrap();
        let w3 = transfer.next_work_item().unwrap();
        let w4 = transfer.next_work_item();

        assert_eq!(w1.range, Range::new(0, 8 * 1024 * 1024));
        assert_eq!(w2.range, Range::new(8 * 1024 * 1024, 16 * 1024 * 1024));
        assert_eq!(w3.range, Range::new(16 * 1024 * 1024, 20 * 1024 * 1024));
        assert!(w4.is_none());
        assert_eq!(transfer.in_flight().len(), 3);
    }

    #[tokio::test]
    async fn complete_range_moves_to_done_and_finishes_small_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path, 1024, 2);
        transfer.start(16, None).await.unwrap();
        let item = transfer.next_work_item().unwrap();
        write_range(&item.destination_path, item.destination_offset, b"example document").await;
        transfer.complete_range(item.range).await.unwrap();
        assert!(transfer.is_finished());
        assert_eq!(transfer.done().size(), 16);
    }

    #[tokio::test]
    async fn fail_range_with_permanent_error_fails_transfer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path, 1024, 2);
        transfer.start(16, None).await.unwrap();
        let item = transfer.next_work_item().unwrap();
        transfer.fail_range(
            item.range,
            FetchError::Permanent {
                url: "http://example.com/a".into(),
                message: "403".into(),
            },
        );
        assert_eq!(transfer.state(), TransferState::Failed);
        assert_eq!(transfer.recent_errors().len(), 1);
    }

    #[tokio::test]
    async fn sidecar_round_trips_done_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path.clone(), 8 * 1024 * 1024, 3);
        transfer.start(20 * 1024 * 1024, None).await.unwrap();
        let item = transfer.next_work_item().unwrap();
        transfer.complete_range(item.range).await.unwrap();

        let mut resumed = Transfer::new("http://example.com/a".into(), path, 8 * 1024 * 1024, 3);
        resumed.start(20 * 1024 * 1024, None).await.unwrap();
        assert_eq!(resumed.done(), transfer.done());
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_file_and_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path.clone(), 1024, 1);
        transfer
            .start(16, Some("not-the-real-hash".to_string()))
            .await
            .unwrap();
        let item = transfer.next_work_item().unwrap();
        write_range(&item.destination_path, item.destination_offset, b"example document").await;
        let result = transfer.complete_range(item.range).await;
        assert!(matches!(result, Err(FetchError::ChecksumMismatch { .. })));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stalled_transfer_returns_to_running_on_next_work_item() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path, 8 * 1024 * 1024, 3);
        transfer.start(20 * 1024 * 1024, None).await.unwrap();
        let item = transfer.next_work_item().unwrap();
        transfer.fail_range(item.range, FetchError::Transient {
            url: "http://example.com/a".into(),
            message: "503".into(),
        });

        transfer.check_stall(std::time::Duration::from_secs(0));
        assert_eq!(transfer.state(), TransferState::Stalled);

        transfer.next_work_item().unwrap();
        assert_eq!(transfer.state(), TransferState::Running);
    }

    #[tokio::test]
    async fn close_transitions_to_cancelled_and_keeps_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut transfer = Transfer::new("http://example.com/a".into(), path.clone(), 8 * 1024 * 1024, 3);
        transfer.start(20 * 1024 * 1024, None).await.unwrap();
        let _ = transfer.next_work_item().unwrap();
        transfer.close();
        assert_eq!(transfer.state(), TransferState::Cancelled);
        assert!(path.exists());
    }
}
