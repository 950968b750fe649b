// Request/response correlation
// Matches `Response` messages to the request that is waiting for them

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use cumulus_common::{CumulusError, Result};

#[derive(Default)]
pub struct ResponseCorrelator {
    pending: DashMap<Uuid, oneshot::Sender<Option<Value>>>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for responses referencing `request_id`.
    ///
    /// Must be called before the request is sent. The listener is removed when
    /// the returned handle resolves or is dropped.
    pub fn register(self: &Arc<Self>, request_id: Uuid) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        PendingResponse {
            request_id,
            rx: Some(rx),
            correlator: self.clone(),
        }
    }

    /// Complete the listener for `reference`; unmatched responses are dropped
    pub fn resolve(&self, reference: &Uuid, value: Option<Value>) -> bool {
        match self.pending.remove(reference) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => {
                debug!("Dropping unmatched response for {}", reference);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// A registered response listener
pub struct PendingResponse {
    request_id: Uuid,
    rx: Option<oneshot::Receiver<Option<Value>>>,
    correlator: Arc<ResponseCorrelator>,
}

impl PendingResponse {
    /// Wait for the response, bounded by `timeout`
    pub async fn wait(mut self, timeout: Duration) -> Result<Option<Value>> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| CumulusError::InternalError("response already consumed".to_string()))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CumulusError::InternalError(format!(
                "listener for {} was discarded",
                self.request_id
            ))),
            Err(_) => Err(CumulusError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.correlator.pending.remove(&self.request_id);
    }
}
