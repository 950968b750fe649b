// Distributed lock service
// Per-path mutual exclusion decided by vote rounds among connected peers.
// Each lock object is a watch cell carrying its status, its request timestamp,
// the newest timestamp it voted for and a wakeup generation bumped on every release.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use cumulus_api::{Message, Payload, StorePath};
use cumulus_common::current_millis;

use super::messenger::ClusterMessenger;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockStatus {
    #[default]
    Unlocked,
    Locking,
    Waiting,
    Locked,
}

#[derive(Clone, Copy, Debug, Default)]
struct LockState {
    status: LockStatus,
    timestamp: i64,
    /// Newest request this node granted; own requests are stamped after it
    granted: i64,
    generation: u64,
}

type LockCell = Arc<watch::Sender<LockState>>;

/// Resets a lock object to UNLOCKED if an acquisition is abandoned midway
struct AcquireGuard {
    cell: LockCell,
    armed: bool,
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        if self.armed {
            self.cell.send_modify(|state| {
                state.status = LockStatus::Unlocked;
                state.generation += 1;
            });
        }
    }
}

pub struct LockService {
    local_id: Uuid,
    locks: DashMap<StorePath, LockCell>,
    messenger: Arc<ClusterMessenger>,
    vote_timeout: Duration,
    retry_interval: Duration,
}

impl LockService {
    pub fn new(
        local_id: Uuid,
        messenger: Arc<ClusterMessenger>,
        vote_timeout: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            local_id,
            locks: DashMap::new(),
            messenger,
            vote_timeout,
            retry_interval,
        }
    }

    fn cell(&self, path: &StorePath) -> LockCell {
        self.locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(watch::Sender::new(LockState::default())))
            .clone()
    }

    pub fn status(&self, path: &StorePath) -> LockStatus {
        self.locks
            .get(path)
            .map(|cell| cell.borrow().status)
            .unwrap_or_default()
    }

    /// Acquire the cluster-wide lock on `path`.
    ///
    /// Waits for local contenders first, then runs vote rounds until every
    /// connected peer agrees. Dropping the future before it completes
    /// releases the local lock object.
    pub async fn lock(&self, path: &StorePath) {
        let cell = self.cell(path);

        let timestamp = loop {
            let mut rx = cell.subscribe();
            let mut claimed = None;
            cell.send_if_modified(|state| {
                if state.status != LockStatus::Unlocked {
                    return false;
                }
                let timestamp = current_millis().max(state.granted.saturating_add(1));
                state.status = LockStatus::Locking;
                state.timestamp = timestamp;
                claimed = Some(timestamp);
                true
            });
            if let Some(timestamp) = claimed {
                break timestamp;
            }
            let _ = rx.wait_for(|state| state.status == LockStatus::Unlocked).await;
        };

        let mut guard = AcquireGuard {
            cell: cell.clone(),
            armed: true,
        };

        loop {
            let generation = cell.borrow().generation;
            if self.vote_round(path, timestamp).await {
                cell.send_modify(|state| state.status = LockStatus::Locked);
                guard.armed = false;
                metrics::counter!("cumulus_locks_acquired_total").increment(1);
                info!("Lock acquired on {}", path);
                return;
            }

            cell.send_modify(|state| state.status = LockStatus::Waiting);
            let mut rx = cell.subscribe();
            let _ = tokio::time::timeout(
                self.retry_interval,
                rx.wait_for(|state| state.generation != generation),
            )
            .await;
            cell.send_modify(|state| {
                if state.status == LockStatus::Waiting {
                    state.status = LockStatus::Locking;
                }
            });
        }
    }

    /// Ask every connected peer for its vote; excluded peers do not count
    async fn vote_round(&self, path: &StorePath, timestamp: i64) -> bool {
        let payload = Payload::Lock {
            path: path.clone(),
            timestamp,
        };
        let votes = self.messenger.request_all(&payload, self.vote_timeout).await;

        let mut granted = true;
        for (node, vote) in votes {
            match vote {
                Ok(Some(Value::Bool(true))) => {}
                Ok(other) => {
                    debug!("Node {} denied lock on {}: {:?}", node, path, other);
                    granted = false;
                }
                Err(e) if e.is_transport() => {
                    debug!("Excluding {} from lock round on {}: {}", node, path, e);
                }
                Err(e) => {
                    debug!("No lock vote from {} on {}: {}", node, path, e);
                    granted = false;
                }
            }
        }
        granted
    }

    /// Vote on a peer's request for `path` made at `timestamp`
    pub fn vote(&self, requester: Option<Uuid>, path: &StorePath, timestamp: i64) -> bool {
        let cell = self.cell(path);
        let mut granted = false;
        // Records the grant without waking anyone
        cell.send_if_modified(|state| {
            granted = match state.status {
                LockStatus::Unlocked => true,
                LockStatus::Locked => false,
                LockStatus::Locking | LockStatus::Waiting => match requester {
                    Some(requester) => (timestamp, requester) < (state.timestamp, self.local_id),
                    None => timestamp < state.timestamp,
                },
            };
            if granted {
                state.granted = state.granted.max(timestamp);
            }
            false
        });
        granted
    }

    /// Release `path` locally and tell every connected peer
    pub async fn unlock(&self, path: &StorePath) {
        let cell = self.cell(path);
        cell.send_modify(|state| {
            state.status = LockStatus::Unlocked;
            state.generation += 1;
        });
        info!("Lock released on {}", path);

        let message = Message::new(Payload::Unlock { path: path.clone() });
        self.messenger.broadcast(&message).await;
    }

    /// A peer released `path`: wake local waiters so they vote again
    pub fn on_remote_unlock(&self, path: &StorePath) {
        if let Some(cell) = self.locks.get(path) {
            cell.send_modify(|state| state.generation += 1);
        }
    }
}
