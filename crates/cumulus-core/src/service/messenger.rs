// Cluster messenger
// The single outbound path of a node: direct sends over bound sessions,
// broadcasts, correlated requests and deliver-or-queue through the wagon mailbox

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use cumulus_api::{Message, Payload};
use cumulus_common::{CumulusError, Result};

use crate::transport::{SessionId, Transport};

use super::{correlator::ResponseCorrelator, session::SessionIndex, wagon::WagonMailbox};

/// How `deliver` handed a message off
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    Queued,
}

pub struct ClusterMessenger {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionIndex>,
    correlator: Arc<ResponseCorrelator>,
    mailbox: Arc<WagonMailbox>,
}

impl ClusterMessenger {
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: Arc<SessionIndex>,
        correlator: Arc<ResponseCorrelator>,
        mailbox: Arc<WagonMailbox>,
    ) -> Self {
        Self {
            transport,
            sessions,
            correlator,
            mailbox,
        }
    }

    pub fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.correlator
    }

    pub async fn connect(&self, address: &str) -> Result<SessionId> {
        self.transport.connect(address).await
    }

    /// Send on a specific session
    pub async fn send(&self, session: SessionId, message: &Message) -> Result<()> {
        self.transport.send(session, message).await?;
        metrics::counter!("cumulus_messages_sent_total", "type" => message.kind()).increment(1);
        Ok(())
    }

    /// Send to a node over its bound session
    pub async fn send_to_node(&self, node: &Uuid, message: &Message) -> Result<()> {
        let session = self
            .sessions
            .session_of(node)
            .ok_or_else(|| CumulusError::NotConnected(node.to_string()))?;
        self.send(session, message).await
    }

    /// Send directly when the node has a live session, otherwise queue it for the wagon
    pub async fn deliver(&self, node: Uuid, message: Message) -> Delivery {
        match self.send_to_node(&node, &message).await {
            Ok(()) => Delivery::Direct,
            Err(e) => {
                debug!(
                    "Queueing {} for {} on the wagon: {}",
                    message.kind(),
                    node,
                    e
                );
                self.mailbox.push(node, message);
                Delivery::Queued
            }
        }
    }

    /// Send to every node with a live session, returning the nodes reached
    pub async fn broadcast(&self, message: &Message) -> Vec<Uuid> {
        let targets = self.sessions.live_sessions();
        let sends = targets.iter().map(|(node, session)| async move {
            match self.send(*session, message).await {
                Ok(()) => Some(*node),
                Err(e) => {
                    warn!("Broadcast of {} to {} failed: {}", message.kind(), node, e);
                    None
                }
            }
        });
        join_all(sends).await.into_iter().flatten().collect()
    }

    /// Send a request to `node` and wait for the correlated `Response`
    pub async fn request(
        &self,
        node: &Uuid,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let message = Message::new(payload);
        let pending = self.correlator.register(message.id);
        self.send_to_node(node, &message).await?;
        pending.wait(timeout).await
    }

    /// Issue `payload` as a separate request to every node with a live session
    pub async fn request_all(
        &self,
        payload: &Payload,
        timeout: Duration,
    ) -> Vec<(Uuid, Result<Option<Value>>)> {
        let targets = self.sessions.live_nodes();
        let requests = targets.into_iter().map(|node| async move {
            let result = self.request(&node, payload.clone(), timeout).await;
            (node, result)
        });
        join_all(requests).await
    }

    pub async fn close(&self, session: SessionId) {
        self.transport.close(session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, TransportListener};
    use async_trait::async_trait;
    use cumulus_api::StorePath;

    struct Echo {
        network: MemoryNetwork,
        address: String,
    }

    #[async_trait]
    impl TransportListener for Echo {
        async fn on_message(&self, session: SessionId, message: Message) {
            if let Payload::Invoke { path } = message.payload {
                let reply = Message::response(message.id, Some(Value::from(path.to_string())));
                let transport = self.network.transport(self.address.clone());
                let _ = transport.send(session, &reply).await;
            }
        }

        async fn on_session_lost(&self, _session: SessionId) {}
    }

    struct Sink(Arc<ResponseCorrelator>);

    #[async_trait]
    impl TransportListener for Sink {
        async fn on_message(&self, _session: SessionId, message: Message) {
            if let Payload::Response { reference, value } = message.payload {
                self.0.resolve(&reference, value);
            }
        }

        async fn on_session_lost(&self, _session: SessionId) {}
    }

    fn messenger(network: &MemoryNetwork) -> (ClusterMessenger, Arc<SessionIndex>, Arc<WagonMailbox>) {
        let sessions = Arc::new(SessionIndex::new());
        let correlator = Arc::new(ResponseCorrelator::new());
        let mailbox = Arc::new(WagonMailbox::new());
        network.attach("a:1", Arc::new(Sink(correlator.clone())));
        let messenger = ClusterMessenger::new(
            Arc::new(network.transport("a:1")),
            sessions.clone(),
            correlator,
            mailbox.clone(),
        );
        (messenger, sessions, mailbox)
    }

    #[tokio::test]
    async fn test_deliver_queues_without_session() {
        let network = MemoryNetwork::new();
        let (messenger, _sessions, mailbox) = messenger(&network);

        let node = Uuid::new_v4();
        let delivery = messenger
            .deliver(node, Message::new(Payload::Unlock { path: StorePath::root() }))
            .await;
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(mailbox.pending_for(&node), 1);
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let network = MemoryNetwork::new();
        let (messenger, sessions, _mailbox) = messenger(&network);
        network.attach(
            "b:1",
            Arc::new(Echo {
                network: network.clone(),
                address: "b:1".to_string(),
            }),
        );

        let node = Uuid::new_v4();
        let session = messenger.connect("b:1").await.unwrap();
        sessions.bind(node, session);

        let value = messenger
            .request(
                &node,
                Payload::Invoke {
                    path: "x/y".parse().unwrap(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(value, Some(Value::from("x/y")));
        assert_eq!(messenger.correlator().pending_count(), 0);

        let missing = messenger
            .request(
                &Uuid::new_v4(),
                Payload::Invoke {
                    path: StorePath::root(),
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(missing, Err(CumulusError::NotConnected(_))));
        assert_eq!(messenger.correlator().pending_count(), 0);
    }
}
