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

//! Singleton coordinator: owns the live transfer map, dispatches worker
//! results, runs the periodic monitor tick, and answers status queries.
//!
//! Modeled as a single Tokio task reading a typed `mpsc` message channel,
//! where each message carries an optional `oneshot::Sender` reply channel.
//! This collapses the source actor library's UUID request/response protocol:
//! the reply channel *is* the match.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::config::Config;
use crate::error::{FetchError, FetchResult};
use crate::storage::client::{Client, SharedClient};
use crate::storage::transfer::{Transfer, TransferState, TransferStatus, WorkResult};
use crate::storage::worker::{RoutedResult, WorkerPool};

const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// `GetRequest{ url, path?, expected_size?, wait, deadline_secs? }` -> `TransferStatus` or error.
pub struct GetRequest {
    pub url: String,
    pub path: Option<String>,
    pub expected_size: Option<u64>,
    pub wait: bool,
    /// Caller's deadline for `wait=true`. Expiry surfaces as `TimedOut`; the
    /// transfer itself is left running in the background.
    pub deadline_secs: Option<f64>,
}

/// `CancelRequest{ path }` -> void.
pub struct CancelRequest {
    pub path: String,
}

pub enum SupervisorMessage {
    Get {
        request: GetRequest,
        reply: oneshot::Sender<FetchResult<TransferStatus>>,
    },
    Cancel {
        request: CancelRequest,
        reply: oneshot::Sender<FetchResult<()>>,
    },
    Status {
        path: Option<String>,
        reply: oneshot::Sender<Vec<TransferStatus>>,
    },
    Watch {
        path: String,
        reply: oneshot::Sender<Option<watch::Receiver<TransferStatus>>>,
    },
    Exit {
        reply: oneshot::Sender<()>,
    },
}

/// Handle used by CLI/library callers to talk to a running Supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorMessage>,
}

impl SupervisorHandle {
    pub async fn get(&self, request: GetRequest) -> FetchResult<TransferStatus> {
        let deadline_secs = request.deadline_secs;
        let label = request.path.clone().unwrap_or_else(|| request.url.clone());

        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Get { request, reply: reply_tx })
            .await
            .map_err(|_| FetchError::Config("supervisor channel closed".into()))?;

        match deadline_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs_f64(secs), reply_rx).await {
                Ok(inner) => inner.map_err(|_| FetchError::Config("supervisor dropped the reply channel".into()))?,
                // Deadline expired; the transfer itself keeps running, the
                // oneshot reply is simply dropped unread when it settles.
                Err(_) => Err(FetchError::TimedOut { path: label }),
            },
            None => reply_rx
                .await
                .map_err(|_| FetchError::Config("supervisor dropped the reply channel".into()))?,
        }
    }

    pub async fn cancel(&self, request: CancelRequest) -> FetchResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(SupervisorMessage::Cancel { request, reply: reply_tx })
            .await
            .map_err(|_| FetchError::Config("supervisor channel closed".into()))?;
        reply_rx
            .await
            .map_err(|_| FetchError::Config("supervisor dropped the reply channel".into()))?
    }

    pub async fn status(&self, path: Option<String>) -> Vec<TransferStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorMessage::Status { path, reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Subscribe to live status updates for one tracked transfer, for callers
    /// that want to watch a long operation instead of polling `status()`.
    pub async fn watch(&self, path: String) -> Option<watch::Receiver<TransferStatus>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorMessage::Watch { path, reply: reply_tx })
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn exit(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send(SupervisorMessage::Exit { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

struct WaitingReply {
    reply: oneshot::Sender<FetchResult<TransferStatus>>,
}

/// Single-threaded event loop owning every live `Transfer`.
pub struct Supervisor {
    config: Config,
    client: SharedClient,
    transfers: HashMap<PathBuf, Transfer>,
    waiters: HashMap<PathBuf, Vec<WaitingReply>>,
    pool: WorkerPool,
    pool_results: mpsc::Receiver<RoutedResult>,
    messages: mpsc::Receiver<SupervisorMessage>,
}

impl Supervisor {
    /// Spawn the supervisor as a background Tokio task and return a handle.
    pub fn spawn(config: Config) -> FetchResult<SupervisorHandle> {
        config.validate()?;
        let client: SharedClient = Arc::new(Client::new(crate::storage::client::default_adapters(), &config));
        Self::spawn_with_client(config, client)
    }

    /// Like `spawn`, but with an explicit `Client` (and therefore adapter set).
    /// Used by tests to wire in a `StubAdapter` with no real network I/O.
    pub fn spawn_with_client(config: Config, client: SharedClient) -> FetchResult<SupervisorHandle> {
        config.validate()?;
        let (pool, pool_results) = WorkerPool::new(
            client.clone(),
            config.max_connections * 4,
            config.chunk_size,
            STALL_TIMEOUT,
        );
        let (tx, rx) = mpsc::channel(256);

        let supervisor = Supervisor {
            config,
            client,
            transfers: HashMap::new(),
            waiters: HashMap::new(),
            pool,
            pool_results,
            messages: rx,
        };

        tokio::spawn(supervisor.run());
        Ok(SupervisorHandle { sender: tx })
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs_f64(self.config.monitor_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                Some(routed) = self.pool_results.recv() => {
                    self.handle_worker_result(routed).await;
                }
                msg = self.messages.recv() => {
                    match msg {
                        Some(SupervisorMessage::Get { request, reply }) => {
                            self.handle_get(request, reply).await;
                        }
                        Some(SupervisorMessage::Cancel { request, reply }) => {
                            let result = self.handle_cancel(request);
                            let _ = reply.send(result);
                        }
                        Some(SupervisorMessage::Status { path, reply }) => {
                            let statuses = self.handle_status(path);
                            let _ = reply.send(statuses);
                        }
                        Some(SupervisorMessage::Watch { path, reply }) => {
                            let receiver = self.transfers.get(&PathBuf::from(path)).map(|t| t.subscribe());
                            let _ = reply.send(receiver);
                        }
                        Some(SupervisorMessage::Exit { reply }) => {
                            for transfer in self.transfers.values_mut() {
                                transfer.close();
                            }
                            let _ = reply.send(());
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_get(&mut self, request: GetRequest, reply: oneshot::Sender<FetchResult<TransferStatus>>) {
        let path = self.config.local_path(request.path.as_deref(), &request.url);

        if let Some(existing) = self.transfers.get(&path) {
            if existing.is_finished() {
                let _ = reply.send(Ok(existing.status()));
                return;
            }
        } else {
            let span = crate::span_transfer!(path.display());
            let head = match self.client.head(&request.url).instrument(span).await {
                Ok(head) => head,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            };

            if let Some(expected) = request.expected_size {
                if expected != head.document_length {
                    let _ = reply.send(Err(FetchError::SizeMismatch {
                        url: request.url.clone(),
                        expected,
                        actual: head.document_length,
                    }));
                    return;
                }
            }

            let mut transfer = Transfer::new(
                request.url.clone(),
                path.clone(),
                self.config.multipart_size,
                self.config.max_connections,
            );
            if let Err(e) = transfer.start(head.document_length, head.crc32c.clone()).await {
                let _ = reply.send(Err(e));
                return;
            }
            self.transfers.insert(path.clone(), transfer);
        }

        if let Some(transfer) = self.transfers.get(&path) {
            if transfer.is_finished() {
                let _ = reply.send(Ok(transfer.status()));
                return;
            }
        }

        // Spec step 5: insert, start, rebalance budgets, then dispatch. A
        // newly-added transfer must not run at the stale global default until
        // the next monitor tick picks it up.
        self.rebalance_budgets();
        self.dispatch_work(&path);

        if !request.wait {
            if let Some(transfer) = self.transfers.get(&path) {
                let _ = reply.send(Ok(transfer.status()));
            }
            return;
        }

        self.waiters.entry(path).or_default().push(WaitingReply { reply });
    }

    fn handle_cancel(&mut self, request: CancelRequest) -> FetchResult<()> {
        let path = PathBuf::from(&request.path);
        if let Some(mut transfer) = self.transfers.remove(&path) {
            transfer.close();
        }
        self.fail_waiters(&path, FetchError::Cancelled { path: request.path });
        Ok(())
    }

    fn handle_status(&self, path: Option<String>) -> Vec<TransferStatus> {
        match path {
            Some(p) => self
                .transfers
                .get(&PathBuf::from(p))
                .map(|t| vec![t.status()])
                .unwrap_or_default(),
            None => self.transfers.values().map(|t| t.status()).collect(),
        }
    }

    fn dispatch_work(&mut self, path: &PathBuf) {
        let Some(transfer) = self.transfers.get_mut(path) else {
            return;
        };
        while let Some(item) = transfer.next_work_item() {
            self.pool.submit(path.clone(), item);
        }
    }

    async fn handle_worker_result(&mut self, routed: RoutedResult) {
        let path = routed.transfer_path;
        let Some(transfer) = self.transfers.get_mut(&path) else {
            return;
        };

        match routed.result {
            WorkResult::Executed { range, .. } => {
                if let Err(e) = transfer.complete_range(range).await {
                    tracing::error!(error = %e, path = %path.display(), "failed to finalize range");
                }
            }
            WorkResult::Failed { range, error } => {
                tracing::warn!(error = %error, path = %path.display(), "range fetch failed");
                transfer.fail_range(range, error);
            }
        }

        if transfer.is_terminal() {
            self.settle_waiters(&path);
        } else {
            self.dispatch_work(&path);
        }
    }

    fn settle_waiters(&mut self, path: &PathBuf) {
        let Some(transfer) = self.transfers.get(path) else {
            return;
        };
        let status = transfer.status();
        let finished = transfer.is_finished();
        let errors = transfer.recent_errors();

        if let Some(waiters) = self.waiters.remove(path) {
            for waiter in waiters {
                let reply = if finished {
                    Ok(status.clone())
                } else {
                    Err(FetchError::TransferInterrupted {
                        path: path.display().to_string(),
                        recent_errors: errors.clone(),
                    })
                };
                let _ = waiter.reply.send(reply);
            }
        }
    }

    fn fail_waiters(&mut self, path: &PathBuf, error: FetchError) {
        if let Some(waiters) = self.waiters.remove(path) {
            let message = error.to_string();
            for waiter in waiters {
                let _ = waiter.reply.send(Err(FetchError::Cancelled { path: message.clone() }));
            }
        }
    }

    /// Recompute and apply `min(configured_max, floor(max_workers / N) + 1)`
    /// to every live transfer. Called both from `tick()` and from
    /// `handle_get` right after a new transfer is inserted, since adding or
    /// removing a transfer changes `N` for everyone, not just the new one.
    ///
    /// Load-bearing ordering: callers must apply this before dispatching more
    /// work (`start()`/`dispatch_work`), since `Transfer::next_work_item`
    /// reads `max_connections` to bound in-flight work.
    fn rebalance_budgets(&mut self) {
        let active = self.transfers.values().filter(|t| !t.is_terminal()).count();
        let max_workers = self.config.max_connections * 4;
        let per_transfer = per_transfer_budget(self.config.max_connections, max_workers, active);
        for transfer in self.transfers.values_mut() {
            if !transfer.is_terminal() {
                transfer.max_connections = per_transfer;
            }
        }
    }

    /// Monitor tick, in order: drop dead transfers, rebalance per-transfer
    /// connection budgets, top up workers, log a summary, run client monitor.
    ///
    /// DONE transfers are kept addressable (not dropped per the literal source
    /// wording) so a later idempotent `GetRequest` for the same path answers
    /// from the map without a HEAD round-trip; only FAILED/CANCELLED entries
    /// are swept, since nothing can usefully resume them in place.
    async fn tick(&mut self) {
        self.transfers.retain(|path, transfer| {
            let keep = !matches!(transfer.state(), TransferState::Failed | TransferState::Cancelled);
            if !keep {
                tracing::debug!(path = %path.display(), "dropping dead transfer from tick");
            }
            keep
        });

        self.rebalance_budgets();

        let paths: Vec<PathBuf> = self.transfers.keys().cloned().collect();
        for path in &paths {
            if let Some(transfer) = self.transfers.get_mut(path) {
                if transfer.is_terminal() {
                    continue;
                }
                let span = crate::span_transfer!(path.display());
                if let Err(e) = transfer.save_status().instrument(span).await {
                    tracing::warn!(error = %e, path = %path.display(), "failed to persist sidecar");
                }
                transfer.check_stall(STALL_TIMEOUT);
            }
            self.dispatch_work(path);
        }

        self.pool.reap_completed();

        let summary: Vec<String> = self
            .transfers
            .values()
            .map(|t| format!("{}={:.1}%", t.local_path.display(), t.done().size() as f64 * 100.0 / t.document_length.unwrap_or(1).max(1) as f64))
            .collect();
        tracing::info!(transfers = %summary.join(", "), "tick");

        self.client.monitor().await;
    }
}

/// `min(configured_max, floor(max_workers / N) + 1)`. The "+1" guarantees at
/// least one connection per active transfer even when transfers outnumber
/// workers, so small transfers are never starved.
fn per_transfer_budget(configured_max: usize, max_workers: usize, active_transfers: usize) -> usize {
    let n = active_transfers.max(1);
    (max_workers / n + 1).min(configured_max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_gives_each_transfer_at_least_one_connection() {
        assert_eq!(per_transfer_budget(4, 16, 20), 1);
    }

    #[test]
    fn budget_is_capped_at_configured_max() {
        assert_eq!(per_transfer_budget(4, 16, 1), 4);
    }

    #[test]
    fn budget_splits_fairly_among_active_transfers() {
        assert_eq!(per_transfer_budget(4, 16, 4), 4.min(16 / 4 + 1));
    }
}

