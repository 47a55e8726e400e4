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

//! End-to-end transfer scenarios driven by an in-memory `StubAdapter`, no
//! real network I/O. Grounded on `esrally/storage/testing.py::DummyAdapter`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use rally_fetch::config::Config;
use rally_fetch::error::{FetchError, FetchResult};
use rally_fetch::storage::adapter::{Adapter, ByteStream, Head, Want};
use rally_fetch::storage::client::Client;
use rally_fetch::storage::supervisor::{GetRequest, Supervisor};

/// In-memory adapter used purely for tests; matches every URL, like the
/// original's `DummyAdapter`.
struct StubAdapter {
    bodies: Mutex<HashMap<String, Bytes>>,
    crc32c: Mutex<HashMap<String, String>>,
    /// Queued errors returned instead of success for the next `get()` call on
    /// a given URL, so a scenario can simulate one mirror failing once.
    get_failures: Mutex<HashMap<String, VecDeque<FetchError>>>,
    /// Queued errors keyed by the requested byte range instead of by URL, so a
    /// scenario can fail "whichever mirror is tried first" for a given range
    /// without depending on the registry's random pick order.
    range_failures: Mutex<HashMap<(u64, u64), VecDeque<FetchError>>>,
    /// Every `get()` invocation, in order, as `(url, range)` — lets a test
    /// assert how many attempts and which physical URLs a range went through.
    calls: Mutex<Vec<(String, Option<(u64, u64)>)>>,
    /// Blocks the Nth `get()` call to a given URL until the test notifies it,
    /// used to pause a transfer mid-flight to simulate a killed process.
    gates: Mutex<HashMap<String, (usize, Arc<Notify>)>>,
    call_counts: Mutex<HashMap<String, usize>>,
}

impl StubAdapter {
    fn new() -> Self {
        Self {
            bodies: Mutex::new(HashMap::new()),
            crc32c: Mutex::new(HashMap::new()),
            get_failures: Mutex::new(HashMap::new()),
            range_failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gates: Mutex::new(HashMap::new()),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    fn set_body(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), Bytes::from(body));
    }

    fn set_crc32c(&self, url: &str, value: &str) {
        self.crc32c.lock().unwrap().insert(url.to_string(), value.to_string());
    }

    fn queue_get_failure(&self, url: &str, error: FetchError) {
        self.get_failures
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(error);
    }

    fn queue_range_failure(&self, start: u64, end: u64, error: FetchError) {
        self.range_failures
            .lock()
            .unwrap()
            .entry((start, end))
            .or_default()
            .push_back(error);
    }

    /// Returns a `Notify` that blocks the `call_number`th `get()` call on
    /// `url` until `notify_one()` is called on it.
    fn gate_after_call(&self, url: &str, call_number: usize) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), (call_number, notify.clone()));
        notify
    }

    fn calls_for_range(&self, start: u64, end: u64) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, range)| *range == Some((start, end)))
            .map(|(url, _)| url.clone())
            .collect()
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    fn match_url(&self, _url: &str) -> bool {
        true
    }

    async fn head(&self, url: &str) -> FetchResult<Head> {
        let bodies = self.bodies.lock().unwrap();
        let Some(body) = bodies.get(url) else {
            return Err(FetchError::NotFound { url: url.to_string() });
        };
        let crc = self.crc32c.lock().unwrap().get(url).cloned();
        Ok(Head {
            url: url.to_string(),
            content_length: body.len() as u64,
            document_length: body.len() as u64,
            served_range: None,
            crc32c: crc,
            accept_ranges: true,
            date: None,
        })
    }

    async fn get(&self, url: &str, want: Want, _chunk_size: usize) -> FetchResult<(Head, ByteStream)> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), want.range.map(|r| (r.start, r.end))));

        if let Some(range) = want.range {
            if let Some(queue) = self.range_failures.lock().unwrap().get_mut(&(range.start, range.end)) {
                if let Some(error) = queue.pop_front() {
                    return Err(error);
                }
            }
        }

        if let Some(queue) = self.get_failures.lock().unwrap().get_mut(url) {
            if let Some(error) = queue.pop_front() {
                return Err(error);
            }
        }

        let notify = {
            let mut counts = self.call_counts.lock().unwrap();
            let count = counts.entry(url.to_string()).or_insert(0);
            *count += 1;
            let current = *count;
            self.gates
                .lock()
                .unwrap()
                .get(url)
                .filter(|(n, _)| *n == current)
                .map(|(_, notify)| notify.clone())
        };
        if let Some(notify) = notify {
            notify.notified().await;
        }

        let bodies = self.bodies.lock().unwrap();
        let Some(body) = bodies.get(url) else {
            return Err(FetchError::NotFound { url: url.to_string() });
        };

        let document_length = body.len() as u64;
        let (slice, served_range) = match want.range {
            Some(r) => (body.slice(r.start as usize..r.end as usize), Some(r)),
            None => (body.clone(), None),
        };
        let crc = self.crc32c.lock().unwrap().get(url).cloned();

        let head = Head {
            url: url.to_string(),
            content_length: slice.len() as u64,
            document_length,
            served_range,
            crc32c: crc,
            accept_ranges: true,
            date: None,
        };
        let stream: ByteStream = stream::once(async move { Ok(slice) }).boxed();
        Ok((head, stream))
    }
}

/// Lets a test keep an `Arc<StubAdapter>` handle for post-hoc inspection
/// (e.g. `calls_for_range`) while still handing an owned `Box<dyn Adapter>`
/// to the `Client`.
#[async_trait]
impl Adapter for Arc<StubAdapter> {
    fn match_url(&self, url: &str) -> bool {
        (**self).match_url(url)
    }

    async fn head(&self, url: &str) -> FetchResult<Head> {
        (**self).head(url).await
    }

    async fn get(&self, url: &str, want: Want, chunk_size: usize) -> FetchResult<(Head, ByteStream)> {
        (**self).get(url, want, chunk_size).await
    }
}

fn test_config(local_dir: &std::path::Path) -> Config {
    Config {
        local_dir: local_dir.to_path_buf(),
        monitor_interval_secs: 0.2,
        mirror_files: Vec::new(),
        ..Config::default()
    }
}

/// S1 — single small file, no mirrors.
#[tokio::test]
async fn s1_single_small_file_completes_with_no_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = StubAdapter::new();
    let url = "http://example.com/a";
    adapter.set_body(url, b"example document".to_vec());

    let client = std::sync::Arc::new(Client::new(vec![Box::new(adapter)], &test_config(dir.path())));
    let supervisor = Supervisor::spawn_with_client(test_config(dir.path()), client).unwrap();

    let status = supervisor
        .get(GetRequest {
            url: url.to_string(),
            path: Some(dir.path().join("a").display().to_string()),
            expected_size: None,
            wait: true,
            deadline_secs: None,
        })
        .await
        .unwrap();

    assert!(status.finished);
    let contents = tokio::fs::read(dir.path().join("a")).await.unwrap();
    assert_eq!(contents, b"example document");
    assert!(!dir.path().join("a.status.json").exists());

    supervisor.exit().await;
}

/// S2 — expected_size mismatch.
#[tokio::test]
async fn s2_expected_size_mismatch_creates_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = StubAdapter::new();
    let url = "http://example.com/a";
    adapter.set_body(url, b"example document".to_vec());

    let client = std::sync::Arc::new(Client::new(vec![Box::new(adapter)], &test_config(dir.path())));
    let supervisor = Supervisor::spawn_with_client(test_config(dir.path()), client).unwrap();

    let result = supervisor
        .get(GetRequest {
            url: url.to_string(),
            path: Some(dir.path().join("a").display().to_string()),
            expected_size: Some(15),
            wait: true,
            deadline_secs: None,
        })
        .await;

    assert!(matches!(result, Err(FetchError::SizeMismatch { expected: 15, actual: 16, .. })));
    assert!(!dir.path().join("a").exists());

    supervisor.exit().await;
}

/// S3 — multipart: 20 MiB body, 8 MiB multipart size, 3 connections.
#[tokio::test]
async fn s3_multipart_download_completes_with_correct_size() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = StubAdapter::new();
    let url = "http://example.com/big";
    let body = vec![7u8; 20 * 1024 * 1024];
    adapter.set_body(url, body.clone());

    let mut config = test_config(dir.path());
    config.multipart_size = 8 * 1024 * 1024;
    config.max_connections = 3;

    let client = std::sync::Arc::new(Client::new(vec![Box::new(adapter)], &config));
    let supervisor = Supervisor::spawn_with_client(config, client).unwrap();

    let status = supervisor
        .get(GetRequest {
            url: url.to_string(),
            path: Some(dir.path().join("big").display().to_string()),
            expected_size: None,
            wait: true,
            deadline_secs: None,
        })
        .await
        .unwrap();

    assert!(status.finished);
    let meta = tokio::fs::metadata(dir.path().join("big")).await.unwrap();
    assert_eq!(meta.len(), 20 * 1024 * 1024);

    supervisor.exit().await;
}

/// S6 — checksum mismatch: expected crc32c supplied but body tampered.
#[tokio::test]
async fn s6_checksum_mismatch_discards_file_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = StubAdapter::new();
    let url = "http://example.com/a";
    adapter.set_body(url, b"example document".to_vec());
    adapter.set_crc32c(url, "deliberately-wrong-digest");

    let client = std::sync::Arc::new(Client::new(vec![Box::new(adapter)], &test_config(dir.path())));
    let supervisor = Supervisor::spawn_with_client(test_config(dir.path()), client).unwrap();

    let result = supervisor
        .get(GetRequest {
            url: url.to_string(),
            path: Some(dir.path().join("a").display().to_string()),
            expected_size: None,
            wait: true,
            deadline_secs: None,
        })
        .await;

    assert!(matches!(result, Err(FetchError::TransferInterrupted { .. })));
    assert!(!dir.path().join("a").exists());
    assert!(!dir.path().join("a.status.json").exists());

    supervisor.exit().await;
}

/// S4 — resume: kill the process after the first 8 MiB segment lands, then
/// hand the same `(url, path)` to a fresh supervisor and client and expect it
/// to pick up only the remaining range.
#[tokio::test]
async fn s4_resume_after_kill_completes_remaining_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let url = "http://example.com/big";
    let body = vec![9u8; 20 * 1024 * 1024];
    let path = dir.path().join("big").display().to_string();

    let mut config = test_config(dir.path());
    config.multipart_size = 8 * 1024 * 1024;
    config.max_connections = 1;

    let adapter = StubAdapter::new();
    adapter.set_body(url, body.clone());
    // Blocks the second range fetch indefinitely, standing in for the
    // process being killed mid-transfer right after the first segment.
    let gate = adapter.gate_after_call(url, 2);

    let client = std::sync::Arc::new(Client::new(vec![Box::new(adapter)], &config));
    let supervisor = Supervisor::spawn_with_client(config.clone(), client).unwrap();

    supervisor
        .get(GetRequest {
            url: url.to_string(),
            path: Some(path.clone()),
            expected_size: None,
            wait: false,
            deadline_secs: None,
        })
        .await
        .unwrap();

    let mut landed = false;
    for _ in 0..200 {
        let statuses = supervisor.status(Some(path.clone())).await;
        if statuses.first().and_then(|s| s.transferred) == Some(8 * 1024 * 1024) {
            landed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(landed, "first 8 MiB segment never landed before the simulated kill");

    gate.notify_one();
    supervisor.exit().await;

    // Restart: fresh supervisor, fresh client, fresh in-memory adapter — only
    // the sidecar and partial file on disk carry state across the "restart".
    let adapter2 = StubAdapter::new();
    adapter2.set_body(url, body.clone());
    let client2 = std::sync::Arc::new(Client::new(vec![Box::new(adapter2)], &config));
    let supervisor2 = Supervisor::spawn_with_client(config, client2).unwrap();

    let status = supervisor2
        .get(GetRequest {
            url: url.to_string(),
            path: Some(path.clone()),
            expected_size: None,
            wait: true,
            deadline_secs: None,
        })
        .await
        .unwrap();

    assert!(status.finished);
    let contents = tokio::fs::read(&path).await.unwrap();
    assert_eq!(contents, body);
    assert!(!std::path::Path::new(&format!("{path}.status.json")).exists());

    supervisor2.exit().await;
}

/// S5 — transient mirror failure: the second 8 MiB segment fails once on
/// whichever mirror is tried first and succeeds on the other, with no
/// dependence on which physical URL the registry happens to pick first.
#[tokio::test]
async fn s5_transient_mirror_failure_retries_on_other_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let logical_url = "http://example.com/big".to_string();
    let mirror_url = "http://mirror2.example.com/big".to_string();
    let body = vec![3u8; 16 * 1024 * 1024];

    let mirror_map_path = dir.path().join("mirrors.json");
    let mirror_map = format!(
        "{{\"{logical_url}\": [\"{mirror_url}\"]}}",
        logical_url = logical_url,
        mirror_url = mirror_url
    );
    tokio::fs::write(&mirror_map_path, mirror_map).await.unwrap();

    let mut config = test_config(dir.path());
    config.multipart_size = 8 * 1024 * 1024;
    config.max_connections = 1;
    config.random_seed = Some(7);
    config.mirror_files = vec![mirror_map_path];

    let adapter = Arc::new(StubAdapter::new());
    adapter.set_body(&logical_url, body.clone());
    adapter.set_body(&mirror_url, body.clone());
    // Fails whichever of {logical_url, mirror_url} the registry tries first
    // for the second segment; the immediate retry on the other succeeds.
    adapter.queue_range_failure(
        8 * 1024 * 1024,
        16 * 1024 * 1024,
        FetchError::Transient {
            url: "mirror rotation test".to_string(),
            message: "503".to_string(),
        },
    );

    let path = dir.path().join("big").display().to_string();
    let client = std::sync::Arc::new(Client::new(vec![Box::new(adapter.clone())], &config));
    let supervisor = Supervisor::spawn_with_client(config, client).unwrap();

    let status = supervisor
        .get(GetRequest {
            url: logical_url.clone(),
            path: Some(path.clone()),
            expected_size: None,
            wait: true,
            deadline_secs: None,
        })
        .await
        .unwrap();

    assert!(status.finished);
    let contents = tokio::fs::read(&path).await.unwrap();
    assert_eq!(contents, body);

    // First segment needed no retry; second segment failed once then
    // succeeded on the other mirror.
    let first_segment_calls = adapter.calls_for_range(0, 8 * 1024 * 1024);
    let second_segment_calls = adapter.calls_for_range(8 * 1024 * 1024, 16 * 1024 * 1024);
    assert_eq!(first_segment_calls.len(), 1);
    assert_eq!(second_segment_calls.len(), 2);
    assert_ne!(second_segment_calls[0], second_segment_calls[1]);

    supervisor.exit().await;
}
