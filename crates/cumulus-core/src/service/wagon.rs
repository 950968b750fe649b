// Wagon service
// Circulates a token around the live ring of nodes. The token carries queued
// messages for nodes that could not be reached directly and drops them off as
// it passes their destination. Messages for placeholder ids stay in the local
// mailbox until the handshake names the real node.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cumulus_api::{Message, Payload, Wagon};

use super::{
    messenger::ClusterMessenger,
    registry::{NodeRegistry, ring_successor},
    session::SessionIndex,
};

/// Per-destination queue of messages waiting for the wagon
#[derive(Default)]
pub struct WagonMailbox {
    queue: Mutex<BTreeMap<Uuid, Vec<Message>>>,
}

impl WagonMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, node: Uuid, message: Message) {
        self.queue.lock().entry(node).or_default().push(message);
    }

    /// Take the queues whose destination passes `ready`, leaving the rest
    pub fn drain_where(&self, ready: impl Fn(&Uuid) -> bool) -> BTreeMap<Uuid, Vec<Message>> {
        let mut queue = self.queue.lock();
        let (taken, kept): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut *queue)
            .into_iter()
            .partition(|(node, _)| ready(node));
        *queue = kept;
        taken
    }

    /// Drop the queues whose destination fails `keep`, returning how many messages went
    pub fn retain(&self, keep: impl Fn(&Uuid) -> bool) -> usize {
        let mut dropped = 0;
        self.queue.lock().retain(|node, messages| {
            let kept = keep(node);
            if !kept {
                dropped += messages.len();
            }
            kept
        });
        dropped
    }

    /// Move everything queued for `from` to `to`, ahead of what `to` already has
    pub fn rekey(&self, from: &Uuid, to: Uuid) {
        if *from == to {
            return;
        }
        let mut queue = self.queue.lock();
        if let Some(mut moved) = queue.remove(from) {
            if let Some(existing) = queue.remove(&to) {
                moved.extend(existing);
            }
            queue.insert(to, moved);
        }
    }

    pub fn discard(&self, node: &Uuid) -> usize {
        self.queue.lock().remove(node).map_or(0, |messages| messages.len())
    }

    pub fn pending_for(&self, node: &Uuid) -> usize {
        self.queue.lock().get(node).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A forwarded token kept until the successor acknowledges it
struct InFlight {
    wagon: Wagon,
    target: Uuid,
    message_id: Uuid,
}

struct WagonState {
    held: Option<Wagon>,
    in_flight: Option<InFlight>,
    last_seen: Instant,
    /// Incarnation this node minted and retires when it comes back
    minted: Option<Uuid>,
}

/// What one tick of the wagon loop decided
enum Step {
    Idle,
    Forward { target: Uuid, message: Message },
}

pub struct WagonService {
    local_id: Uuid,
    timeout: Duration,
    state: Mutex<WagonState>,
    registry: Arc<NodeRegistry>,
    mailbox: Arc<WagonMailbox>,
    sessions: Arc<SessionIndex>,
    messenger: Arc<ClusterMessenger>,
}

impl WagonService {
    pub fn new(
        registry: Arc<NodeRegistry>,
        timeout: Duration,
        mailbox: Arc<WagonMailbox>,
        sessions: Arc<SessionIndex>,
        messenger: Arc<ClusterMessenger>,
    ) -> Self {
        Self {
            local_id: registry.local_id(),
            timeout,
            registry,
            state: Mutex::new(WagonState {
                held: None,
                in_flight: None,
                last_seen: Instant::now(),
                minted: None,
            }),
            mailbox,
            sessions,
            messenger,
        }
    }

    pub fn mailbox(&self) -> &Arc<WagonMailbox> {
        &self.mailbox
    }

    pub fn is_holding(&self) -> bool {
        self.state.lock().held.is_some()
    }

    /// Local node plus every node with a live session, in ring order
    pub fn live_ring(&self) -> Vec<Uuid> {
        let mut ring = self.sessions.live_nodes();
        ring.push(self.local_id);
        ring.sort();
        ring.dedup();
        ring
    }

    /// Run the wagon loop until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Wagon loop started, timeout {:?}", self.timeout);
        loop {
            let jitter_ms = (self.timeout.as_millis() as u64 / 2).max(1);
            let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ms));
            tokio::select! {
                _ = tokio::time::sleep(self.timeout + jitter) => self.tick().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("Wagon loop stopped");
    }

    /// One round of the token protocol
    pub async fn tick(&self) {
        let ring = self.live_ring();
        let step = {
            let mut state = self.state.lock();
            self.reclaim_lost(&mut state);
            self.next_step(&mut state, &ring)
        };

        if let Step::Forward { target, message } = step
            && let Err(e) = self.messenger.send_to_node(&target, &message).await
        {
            debug!("Wagon forward to {} failed, keeping token: {}", target, e);
            let mut state = self.state.lock();
            if let Some(in_flight) = state.in_flight.take() {
                Self::hold(&mut state, in_flight.wagon);
            }
        }
    }

    /// Take back a forwarded copy whose target lost its session before acking
    fn reclaim_lost(&self, state: &mut WagonState) {
        let lost = state
            .in_flight
            .as_ref()
            .is_some_and(|f| !self.sessions.has_session(&f.target));
        if lost && let Some(in_flight) = state.in_flight.take() {
            warn!(
                "Wagon {} target {} went away before acking, reclaiming",
                in_flight.wagon.id, in_flight.target
            );
            Self::hold(state, in_flight.wagon);
        }
    }

    fn next_step(&self, state: &mut WagonState, ring: &[Uuid]) -> Step {
        if state.in_flight.is_some() {
            return Step::Idle;
        }

        let Some(mut wagon) = state.held.take() else {
            let threshold = self.timeout * 2 * ring.len() as u32;
            if state.last_seen.elapsed() > threshold && ring.first() == Some(&self.local_id) {
                let wagon = Wagon::new();
                info!("No wagon seen for {:?}, minting {}", threshold, wagon.id);
                state.minted = Some(wagon.id);
                state.last_seen = Instant::now();
                state.held = Some(wagon);
            }
            return Step::Idle;
        };

        self.restock(&mut wagon);
        state.last_seen = Instant::now();

        let target = ring_successor(ring, &self.local_id);
        if target == self.local_id {
            state.held = Some(wagon);
            return Step::Idle;
        }

        let message = Message::new(Payload::CloudWagon {
            wagon: wagon.clone(),
        });
        debug!(
            "Forwarding wagon {} with {} messages to {}",
            wagon.id,
            wagon.pending(),
            target
        );
        state.in_flight = Some(InFlight {
            wagon,
            target,
            message_id: message.id,
        });
        Step::Forward { target, message }
    }

    /// Load the mailbox onto `wagon` and drop cargo no known node can collect
    fn restock(&self, wagon: &mut Wagon) {
        let mut dropped = self.mailbox.retain(|node| self.registry.contains(node));
        wagon.merge(
            self.mailbox
                .drain_where(|node| self.registry.is_identified(node)),
        );

        let before = wagon.pending();
        wagon.load.retain(|node, _| self.registry.contains(node));
        dropped += before - wagon.pending();

        if dropped > 0 {
            metrics::counter!("cumulus_wagon_dropped_total").increment(dropped as u64);
            warn!("Dropped {} queued messages for unknown nodes", dropped);
        }
    }

    /// Re-address everything queued for `from`, wherever it waits, to `to`
    pub fn rekey(&self, from: &Uuid, to: Uuid) {
        let mut state = self.state.lock();
        if let Some(held) = state.held.as_mut() {
            held.rekey(from, to);
        }
        if let Some(in_flight) = state.in_flight.as_mut() {
            in_flight.wagon.rekey(from, to);
        }
        self.mailbox.rekey(from, to);
    }

    /// Drop everything queued for a node that left the registry
    pub fn forget(&self, node: &Uuid) {
        let mut state = self.state.lock();
        let mut dropped = self.mailbox.discard(node);
        if let Some(held) = state.held.as_mut() {
            dropped += held.unload(node).len();
        }
        if let Some(in_flight) = state.in_flight.as_mut() {
            dropped += in_flight.wagon.unload(node).len();
        }
        if dropped > 0 {
            metrics::counter!("cumulus_wagon_dropped_total").increment(dropped as u64);
            warn!("Dropped {} queued messages for removed node {}", dropped, node);
        }
    }

    fn hold(state: &mut WagonState, mut wagon: Wagon) {
        if let Some(held) = state.held.take() {
            wagon.merge(held.load);
        }
        state.held = Some(wagon);
    }

    /// Adopt an inbound token, returning the messages addressed to this node
    pub fn receive(&self, mut wagon: Wagon) -> Vec<Message> {
        let mut state = self.state.lock();
        state.last_seen = Instant::now();

        if let Some(held) = state.held.take()
            && held.id != wagon.id
        {
            warn!(
                "Wagon crash: holding {} while receiving {}, merging loads",
                held.id, wagon.id
            );
            metrics::counter!("cumulus_wagon_crashes_total").increment(1);
            wagon.merge(held.load);
        }

        let delivered = wagon.unload(&self.local_id);

        if state.minted == Some(wagon.id) {
            let retired = wagon.id;
            wagon.id = Uuid::new_v4();
            state.minted = Some(wagon.id);
            metrics::counter!("cumulus_wagon_circuits_total").increment(1);
            debug!("Wagon {} completed a circuit, reissued as {}", retired, wagon.id);
        }

        state.held = Some(wagon);
        delivered
    }

    /// Clear the in-flight copy acknowledged by `reference`
    pub fn handle_ack(&self, reference: &Uuid) -> bool {
        let mut state = self.state.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|f| f.message_id == *reference)
        {
            state.in_flight = None;
            state.last_seen = Instant::now();
            true
        } else {
            false
        }
    }

    /// Drop the token; queued messages stay in the mailbox
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.held = None;
        state.in_flight = None;
        state.minted = None;
        state.last_seen = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{correlator::ResponseCorrelator, member_event::NodeEventPublisher};
    use crate::transport::MemoryNetwork;
    use cumulus_api::NodeBuilder;
    use serde_json::Value;

    fn deliver(topic: &str) -> Message {
        Message::new(Payload::Deliver {
            origin: Uuid::new_v4(),
            topic: topic.to_string(),
            body: Value::Null,
        })
    }

    fn service(local_id: Uuid, timeout: Duration) -> (WagonService, Arc<SessionIndex>) {
        let network = MemoryNetwork::new();
        let registry = Arc::new(NodeRegistry::new(
            NodeBuilder::new("10.0.0.1", 7000).id(local_id).build(),
            Arc::new(NodeEventPublisher::new(16)),
        ));
        let sessions = Arc::new(SessionIndex::new());
        let mailbox = Arc::new(WagonMailbox::new());
        let messenger = Arc::new(ClusterMessenger::new(
            Arc::new(network.transport("local:1")),
            sessions.clone(),
            Arc::new(ResponseCorrelator::new()),
            mailbox.clone(),
        ));
        (
            WagonService::new(registry, timeout, mailbox, sessions.clone(), messenger),
            sessions,
        )
    }

    #[test]
    fn test_mailbox_keeps_order_per_node() {
        let mailbox = WagonMailbox::new();
        let node = Uuid::new_v4();
        let first = deliver("a");
        let second = deliver("b");
        mailbox.push(node, first.clone());
        mailbox.push(node, second.clone());
        assert_eq!(mailbox.len(), 2);

        let drained = mailbox.drain_where(|_| true);
        assert_eq!(drained[&node], vec![first, second]);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_mailbox_rekey_and_discard() {
        let mailbox = WagonMailbox::new();
        let placeholder = Uuid::new_v4();
        let real = Uuid::new_v4();
        let early = deliver("early");
        let late = deliver("late");
        mailbox.push(placeholder, early.clone());
        mailbox.push(real, late.clone());

        mailbox.rekey(&placeholder, real);
        assert_eq!(mailbox.pending_for(&placeholder), 0);
        let drained = mailbox.drain_where(|node| *node == real);
        assert_eq!(drained[&real], vec![early, late]);

        mailbox.push(real, deliver("again"));
        assert_eq!(mailbox.discard(&real), 1);
        assert!(mailbox.is_empty());
    }

    #[tokio::test]
    async fn test_placeholders_wait_and_unknown_cargo_is_dropped() {
        let (service, _sessions) = service(Uuid::from_u128(1), Duration::from_secs(1));
        let by_address = NodeBuilder::new("10.0.0.2", 7000).build();
        let placeholder = by_address.id;
        service.registry.register_known_node(by_address);
        let known = Uuid::from_u128(3);
        service
            .registry
            .register_identified_node(NodeBuilder::new("10.0.0.3", 7000).id(known).build());

        service.mailbox().push(placeholder, deliver("early"));
        service.mailbox().push(known, deliver("ready"));
        service.mailbox().push(Uuid::from_u128(9), deliver("nobody"));
        let mut wagon = Wagon::new();
        wagon.merge(BTreeMap::from([
            (Uuid::from_u128(8), vec![deliver("departed")]),
            (known, vec![deliver("riding")]),
        ]));
        service.state.lock().held = Some(wagon);

        // Alone in the live ring, the token stays here after restocking
        service.tick().await;
        {
            let state = service.state.lock();
            let held = state.held.as_ref().unwrap();
            assert_eq!(held.load.keys().copied().collect::<Vec<_>>(), vec![known]);
            assert_eq!(held.load[&known].len(), 2);
        }
        assert_eq!(service.mailbox().len(), 1);
        assert_eq!(service.mailbox().pending_for(&placeholder), 1);
    }

    #[test]
    fn test_rekey_and_forget_reach_the_token() {
        let (service, _sessions) = service(Uuid::from_u128(1), Duration::from_secs(1));
        let placeholder = Uuid::new_v4();
        let real = Uuid::from_u128(2);
        service.mailbox().push(placeholder, deliver("queued"));
        let mut wagon = Wagon::new();
        wagon.merge(BTreeMap::from([(placeholder, vec![deliver("riding")])]));
        service.state.lock().held = Some(wagon);

        service.rekey(&placeholder, real);
        assert_eq!(service.mailbox().pending_for(&real), 1);
        assert_eq!(service.mailbox().pending_for(&placeholder), 0);
        {
            let state = service.state.lock();
            let held = state.held.as_ref().unwrap();
            assert!(held.load.contains_key(&real));
            assert!(!held.load.contains_key(&placeholder));
        }

        service.forget(&real);
        assert!(service.mailbox().is_empty());
        assert_eq!(service.state.lock().held.as_ref().map(Wagon::pending), Some(0));
    }

    #[tokio::test]
    async fn test_lowest_node_mints_when_stale() {
        let (wagon, _sessions) = service(Uuid::from_u128(1), Duration::from_millis(5));
        assert!(!wagon.is_holding());

        tokio::time::sleep(Duration::from_millis(20)).await;
        wagon.tick().await;
        assert!(wagon.is_holding());
    }

    #[tokio::test]
    async fn test_higher_node_does_not_mint() {
        let (wagon, sessions) = service(Uuid::from_u128(5), Duration::from_millis(5));
        sessions.bind(Uuid::from_u128(1), crate::transport::SessionId(1));

        tokio::time::sleep(Duration::from_millis(40)).await;
        wagon.tick().await;
        assert!(!wagon.is_holding());
    }

    #[tokio::test]
    async fn test_alone_keeps_token_and_queued_messages() {
        let (wagon, _sessions) = service(Uuid::from_u128(1), Duration::from_millis(5));
        let absent = Uuid::from_u128(9);
        wagon
            .registry
            .register_identified_node(NodeBuilder::new("10.0.0.9", 7000).id(absent).build());
        wagon.mailbox().push(absent, deliver("later"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        wagon.tick().await;
        wagon.tick().await;
        assert!(wagon.is_holding());
        assert!(wagon.mailbox().is_empty());
        assert_eq!(wagon.state.lock().held.as_ref().map(Wagon::pending), Some(1));
    }

    #[test]
    fn test_receive_unloads_and_merges_on_crash() {
        let local = Uuid::from_u128(2);
        let (service, _sessions) = service(local, Duration::from_secs(1));
        let other = Uuid::from_u128(3);

        let mut first = Wagon::new();
        first.merge(BTreeMap::from([(other, vec![deliver("x")])]));
        assert!(service.receive(first).is_empty());

        let mut second = Wagon::new();
        second.merge(BTreeMap::from([(local, vec![deliver("mine")])]));
        let delivered = service.receive(second.clone());
        assert_eq!(delivered.len(), 1);

        let state = service.state.lock();
        let held = state.held.as_ref().unwrap();
        assert_eq!(held.id, second.id);
        assert_eq!(held.load.get(&other).map(Vec::len), Some(1));
        assert!(!held.load.contains_key(&local));
    }

    #[test]
    fn test_returning_token_is_reissued_by_creator() {
        let local = Uuid::from_u128(1);
        let (service, _sessions) = service(local, Duration::from_secs(1));
        let minted = Wagon::new();
        service.state.lock().minted = Some(minted.id);

        service.receive(minted.clone());
        let state = service.state.lock();
        let held = state.held.as_ref().unwrap();
        assert_ne!(held.id, minted.id);
        assert_eq!(state.minted, Some(held.id));
    }

    #[tokio::test]
    async fn test_failed_forward_keeps_token() {
        let local = Uuid::from_u128(1);
        let (service, sessions) = service(local, Duration::from_secs(1));
        // Bound to a session the transport does not know
        sessions.bind(Uuid::from_u128(2), crate::transport::SessionId(77));
        service.state.lock().held = Some(Wagon::new());

        service.tick().await;
        let state = service.state.lock();
        assert!(state.held.is_some());
        assert!(state.in_flight.is_none());
    }

    #[test]
    fn test_ack_clears_in_flight() {
        let (service, sessions) = service(Uuid::from_u128(1), Duration::from_secs(1));
        let target = Uuid::from_u128(2);
        sessions.bind(target, crate::transport::SessionId(1));
        let message_id = Uuid::new_v4();
        service.state.lock().in_flight = Some(InFlight {
            wagon: Wagon::new(),
            target,
            message_id,
        });

        assert!(!service.handle_ack(&Uuid::new_v4()));
        assert!(service.handle_ack(&message_id));
        assert!(service.state.lock().in_flight.is_none());
    }

    #[test]
    fn test_lost_target_is_reclaimed() {
        let (service, _sessions) = service(Uuid::from_u128(1), Duration::from_secs(1));
        service.state.lock().in_flight = Some(InFlight {
            wagon: Wagon::new(),
            target: Uuid::from_u128(2),
            message_id: Uuid::new_v4(),
        });

        let mut state = service.state.lock();
        service.reclaim_lost(&mut state);
        assert!(state.in_flight.is_none());
        assert!(state.held.is_some());
    }
}
