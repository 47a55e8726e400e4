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

//! Bounded concurrent executor for range-fetch work items.
//!
//! Grounded on the teacher's `downloader/engine.rs::download_all` (`JoinSet` +
//! `Semaphore`) generalized into one process-wide pool feeding results back
//! through an `mpsc::Sender`, the way `downloader/turbo.rs` routes
//! `DownloadOutcome`s back to its caller.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::error::FetchError;
use crate::storage::adapter::Want;
use crate::storage::client::SharedClient;
use crate::storage::transfer::{WorkItem, WorkResult};

/// Identifies which transfer a completed work item belongs to, so the
/// Supervisor can route the result even if the work item itself carries no
/// transfer handle.
#[derive(Debug)]
pub struct RoutedResult {
    pub transfer_path: std::path::PathBuf,
    pub result: WorkResult,
}

/// A process-wide pool of workers bounded by `max_workers` concurrent tasks.
/// Work items are served FIFO; there is no priority among transfers at this
/// layer, apportionment happens upstream in the Supervisor.
pub struct WorkerPool {
    client: SharedClient,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    results_tx: mpsc::Sender<RoutedResult>,
    stall_timeout: Duration,
    chunk_size: usize,
}

impl WorkerPool {
    pub fn new(
        client: SharedClient,
        max_workers: usize,
        chunk_size: usize,
        stall_timeout: Duration,
    ) -> (Self, mpsc::Receiver<RoutedResult>) {
        let (results_tx, results_rx) = mpsc::channel(1024);
        (
            Self {
                client,
                semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
                tasks: JoinSet::new(),
                results_tx,
                stall_timeout,
                chunk_size,
            },
            results_rx,
        )
    }

    /// Submit a work item for execution. Acquires a semaphore permit before
    /// issuing the request; the permit is held for the duration of the fetch.
    pub fn submit(&mut self, transfer_path: std::path::PathBuf, item: WorkItem) {
        let client = self.client.clone();
        let semaphore = self.semaphore.clone();
        let results_tx = self.results_tx.clone();
        let stall_timeout = self.stall_timeout;
        let chunk_size = self.chunk_size;
        let span = crate::span_segment!(item.range.start, item.url);

        self.tasks.spawn(
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let result = execute(&client, &item, chunk_size, stall_timeout).await;
                let routed = RoutedResult {
                    transfer_path,
                    result: match result {
                        Ok(bytes_written) => WorkResult::Executed {
                            range: item.range,
                            bytes_written,
                        },
                        Err(error) => WorkResult::Failed { range: item.range, error },
                    },
                };
                let _ = results_tx.send(routed).await;
            }
            .instrument(span),
        );
    }

    /// Reap completed task handles so the JoinSet doesn't grow unbounded.
    /// Non-blocking: returns immediately if nothing has finished.
    pub fn reap_completed(&mut self) {
        while self.tasks.try_join_next().is_some() {
            // joined task already routed its result via the channel
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Fetch one range and write each chunk at `destination_offset + written_so_far`
/// in the destination file. Workers write directly: concurrent tasks target
/// disjoint file regions, so no locking is needed on POSIX-like file systems.
async fn execute(
    client: &SharedClient,
    item: &WorkItem,
    chunk_size: usize,
    stall_timeout: Duration,
) -> Result<u64, FetchError> {
    use futures::StreamExt;
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};

    let (head, mut stream) = client.get(&item.url, Want::range(item.range), chunk_size).await?;

    if let Some(served) = head.served_range {
        if served.start != item.range.start {
            return Err(FetchError::Permanent {
                url: item.url.clone(),
                message: format!(
                    "server served range starting at {} for request starting at {}",
                    served.start, item.range.start
                ),
            });
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&item.destination_path)
        .await
        .map_err(|e| FetchError::Io {
            path: item.destination_path.display().to_string(),
            source: e,
        })?;

    let mut written: u64 = 0;
    loop {
        let next = tokio::time::timeout(stall_timeout, stream.next()).await;
        let chunk = match next {
            Ok(Some(chunk)) => chunk?,
            Ok(None) => break,
            Err(_) => {
                return Err(FetchError::Transient {
                    url: item.url.clone(),
                    message: "no bytes received within stall timeout".into(),
                })
            }
        };

        file.seek(std::io::SeekFrom::Start(item.destination_offset + written))
            .await
            .map_err(|e| FetchError::Io {
                path: item.destination_path.display().to_string(),
                source: e,
            })?;
        file.write_all(&chunk).await.map_err(|e| FetchError::Io {
            path: item.destination_path.display().to_string(),
            source: e,
        })?;
        written += chunk.len() as u64;
    }

    if written != item.range.size() {
        return Err(FetchError::Transient {
            url: item.url.clone(),
            message: format!("expected {} bytes, received {}", item.range.size(), written),
        });
    }

    Ok(written)
}
