// In-process transport
// Connects nodes living in the same process through channels; used to run isolated
// clusters inside tests and to embed several nodes in one binary

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use cumulus_api::Message;
use cumulus_common::{CumulusError, Result};

use super::{SessionId, Transport, TransportListener};

enum Inbound {
    Message(Message),
    Lost,
}

/// One end of an in-memory connection
struct Link {
    owner: String,
    peer: SessionId,
    peer_address: String,
    /// Feeds the peer's inbox
    tx: mpsc::UnboundedSender<Inbound>,
}

struct NetworkInner {
    listeners: DashMap<String, Arc<dyn TransportListener>>,
    links: DashMap<SessionId, Link>,
    isolated: RwLock<HashSet<String>>,
    next_session: AtomicU64,
}

/// A switchboard of in-memory nodes addressed by `host:port` strings
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                listeners: DashMap::new(),
                links: DashMap::new(),
                isolated: RwLock::new(HashSet::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Create the transport used by the node listening on `address`
    pub fn transport(&self, address: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            address: address.into(),
        }
    }

    /// Make `address` reachable and route its inbound traffic to `listener`
    pub fn attach(&self, address: impl Into<String>, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.insert(address.into(), listener);
    }

    /// Remove `address` from the network, breaking all of its sessions
    pub fn detach(&self, address: &str) {
        self.break_links(address);
        self.inner.listeners.remove(address);
    }

    /// Cut `address` off: existing sessions break and new connects fail
    pub fn isolate(&self, address: &str) {
        self.inner.isolated.write().insert(address.to_string());
        self.break_links(address);
    }

    /// Undo `isolate`
    pub fn restore(&self, address: &str) {
        self.inner.isolated.write().remove(address);
    }

    /// Number of open sessions owned by `address`
    pub fn session_count(&self, address: &str) -> usize {
        self.inner
            .links
            .iter()
            .filter(|e| e.value().owner == address)
            .count()
    }

    /// Number of open sessions from `from` to `to`
    pub fn sessions_between(&self, from: &str, to: &str) -> usize {
        self.inner
            .links
            .iter()
            .filter(|e| e.value().owner == from && e.value().peer_address == to)
            .count()
    }

    fn next_session(&self) -> SessionId {
        SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed))
    }

    fn open(&self, from: &str, to: &str) -> Result<SessionId> {
        {
            let isolated = self.inner.isolated.read();
            if isolated.contains(from) || isolated.contains(to) {
                return Err(CumulusError::Transport(format!("{} is unreachable", to)));
            }
        }

        let to_listener = self
            .inner
            .listeners
            .get(to)
            .map(|e| e.value().clone())
            .ok_or_else(|| CumulusError::Transport(format!("connection refused: {}", to)))?;
        let from_listener = self
            .inner
            .listeners
            .get(from)
            .map(|e| e.value().clone())
            .ok_or_else(|| CumulusError::Transport(format!("{} is not attached", from)))?;

        let local = self.next_session();
        let remote = self.next_session();

        let into_remote = spawn_inbox(to_listener, remote);
        let into_local = spawn_inbox(from_listener, local);

        self.inner.links.insert(
            local,
            Link {
                owner: from.to_string(),
                peer: remote,
                peer_address: to.to_string(),
                tx: into_remote,
            },
        );
        self.inner.links.insert(
            remote,
            Link {
                owner: to.to_string(),
                peer: local,
                peer_address: from.to_string(),
                tx: into_local,
            },
        );

        debug!("Memory session {} opened: {} -> {}", local, from, to);
        Ok(local)
    }

    /// Close one end; only the peer is told about the loss
    fn close(&self, session: SessionId) {
        if let Some((_, link)) = self.inner.links.remove(&session) {
            let _ = link.tx.send(Inbound::Lost);
            self.inner.links.remove(&link.peer);
            debug!("Memory session {} closed by {}", session, link.owner);
        }
    }

    /// Break every session touching `address`; both ends are told about the loss
    fn break_links(&self, address: &str) {
        let sessions: Vec<SessionId> = self
            .inner
            .links
            .iter()
            .filter(|e| e.value().owner == address || e.value().peer_address == address)
            .map(|e| *e.key())
            .collect();

        for session in sessions {
            if let Some((_, link)) = self.inner.links.remove(&session) {
                let _ = link.tx.send(Inbound::Lost);
            }
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_inbox(
    listener: Arc<dyn TransportListener>,
    session: SessionId,
) -> mpsc::UnboundedSender<Inbound> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            match inbound {
                Inbound::Message(message) => listener.on_message(session, message).await,
                Inbound::Lost => {
                    listener.on_session_lost(session).await;
                    break;
                }
            }
        }
    });
    tx
}

/// The per-node handle onto a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: String,
}

impl MemoryTransport {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str) -> Result<SessionId> {
        self.network.open(&self.address, address)
    }

    async fn send(&self, session: SessionId, message: &Message) -> Result<()> {
        let link = self
            .network
            .inner
            .links
            .get(&session)
            .ok_or_else(|| CumulusError::Transport(format!("{} is closed", session)))?;
        if link.owner != self.address {
            return Err(CumulusError::Transport(format!(
                "{} does not belong to {}",
                session, self.address
            )));
        }
        link.tx
            .send(Inbound::Message(message.clone()))
            .map_err(|_| CumulusError::Transport(format!("{} is closed", session)))
    }

    async fn close(&self, session: SessionId) {
        self.network.close(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_api::Payload;
    use tokio::sync::mpsc::UnboundedSender;
    use uuid::Uuid;

    enum Event {
        Message(SessionId, Message),
        Lost(SessionId),
    }

    struct Recorder(UnboundedSender<Event>);

    #[async_trait]
    impl TransportListener for Recorder {
        async fn on_message(&self, session: SessionId, message: Message) {
            let _ = self.0.send(Event::Message(session, message));
        }

        async fn on_session_lost(&self, session: SessionId) {
            let _ = self.0.send(Event::Lost(session));
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    #[tokio::test]
    async fn test_messages_are_delivered_in_order() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = recorder();
        let (b, mut b_rx) = recorder();
        network.attach("a:1", a);
        network.attach("b:1", b);

        let transport = network.transport("a:1");
        let session = transport.connect("b:1").await.unwrap();

        for _ in 0..3 {
            transport
                .send(session, &Message::ack(Uuid::new_v4()))
                .await
                .unwrap();
        }

        let mut inbound_session = None;
        for _ in 0..3 {
            match b_rx.recv().await.unwrap() {
                Event::Message(s, m) => {
                    assert!(matches!(m.payload, Payload::Ack { .. }));
                    inbound_session.get_or_insert(s);
                    assert_eq!(inbound_session, Some(s));
                }
                Event::Lost(_) => panic!("unexpected loss"),
            }
        }
        assert_eq!(network.sessions_between("a:1", "b:1"), 1);
        assert_eq!(network.sessions_between("b:1", "a:1"), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_peer() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = recorder();
        let (b, mut b_rx) = recorder();
        network.attach("a:1", a);
        network.attach("b:1", b);

        let transport = network.transport("a:1");
        let session = transport.connect("b:1").await.unwrap();
        transport.close(session).await;

        assert!(matches!(b_rx.recv().await.unwrap(), Event::Lost(_)));
        assert_eq!(network.session_count("a:1"), 0);
        assert!(
            transport
                .send(session, &Message::ack(Uuid::new_v4()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_isolate_breaks_and_refuses() {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = recorder();
        let (b, mut b_rx) = recorder();
        network.attach("a:1", a);
        network.attach("b:1", b);

        let transport = network.transport("a:1");
        transport.connect("b:1").await.unwrap();

        network.isolate("b:1");
        assert!(matches!(a_rx.recv().await.unwrap(), Event::Lost(_)));
        assert!(matches!(b_rx.recv().await.unwrap(), Event::Lost(_)));
        assert!(transport.connect("b:1").await.is_err());

        network.restore("b:1");
        assert!(transport.connect("b:1").await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_for_unknown_address() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = recorder();
        network.attach("a:1", a);
        let transport = network.transport("a:1");
        assert!(transport.connect("nowhere:1").await.is_err());
    }
}
