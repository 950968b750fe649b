// Session index
// Binds live transport sessions to nodes and keeps the handshake bookkeeping
// (offers we sent and replies awaiting an acknowledgement)

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::transport::SessionId;

/// A handshake reply waiting for the connector's `Ack`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingAck {
    pub node: Uuid,
    pub session: SessionId,
}

#[derive(Default)]
struct SessionTables {
    by_node: HashMap<Uuid, SessionId>,
    by_session: HashMap<SessionId, Uuid>,
    /// Sessions we opened and sent an `Identification` on
    outbound: HashMap<SessionId, Uuid>,
    /// Reply message id -> node and session it was sent on
    pending_acks: HashMap<Uuid, PendingAck>,
}

#[derive(Default)]
pub struct SessionIndex {
    tables: Mutex<SessionTables>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `session` to `node`, returning a different session previously bound to it
    pub fn bind(&self, node: Uuid, session: SessionId) -> Option<SessionId> {
        let mut tables = self.tables.lock();
        let previous = tables.by_node.insert(node, session);
        if let Some(old) = previous
            && old != session
        {
            tables.by_session.remove(&old);
        }
        tables.by_session.insert(session, node);
        previous.filter(|old| *old != session)
    }

    pub fn session_of(&self, node: &Uuid) -> Option<SessionId> {
        self.tables.lock().by_node.get(node).copied()
    }

    /// Node behind `session`: the bound one, or the one whose handshake `Ack` is still due on it
    pub fn peer_of(&self, session: &SessionId) -> Option<Uuid> {
        let tables = self.tables.lock();
        tables.by_session.get(session).copied().or_else(|| {
            tables
                .pending_acks
                .values()
                .find(|pending| pending.session == *session)
                .map(|pending| pending.node)
        })
    }

    pub fn has_session(&self, node: &Uuid) -> bool {
        self.tables.lock().by_node.contains_key(node)
    }

    /// Nodes with a bound session
    pub fn live_nodes(&self) -> Vec<Uuid> {
        self.tables.lock().by_node.keys().copied().collect()
    }

    /// Every bound session
    pub fn live_sessions(&self) -> Vec<(Uuid, SessionId)> {
        self.tables
            .lock()
            .by_node
            .iter()
            .map(|(node, session)| (*node, *session))
            .collect()
    }

    pub fn begin_outbound(&self, session: SessionId, node: Uuid) {
        self.tables.lock().outbound.insert(session, node);
    }

    pub fn take_outbound(&self, session: &SessionId) -> Option<Uuid> {
        self.tables.lock().outbound.remove(session)
    }

    pub fn expect_ack(&self, reply_id: Uuid, node: Uuid, session: SessionId) {
        self.tables
            .lock()
            .pending_acks
            .insert(reply_id, PendingAck { node, session });
    }

    pub fn take_ack(&self, reply_id: &Uuid) -> Option<PendingAck> {
        self.tables.lock().pending_acks.remove(reply_id)
    }

    /// Drop every reference to `session`, returning the node it belonged to
    pub fn forget_session(&self, session: &SessionId) -> Option<Uuid> {
        let mut tables = self.tables.lock();
        let mut owner = tables.outbound.remove(session);

        if let Some(node) = tables.by_session.remove(session) {
            if tables.by_node.get(&node) == Some(session) {
                tables.by_node.remove(&node);
            }
            owner = Some(node);
        }

        let acks: Vec<Uuid> = tables
            .pending_acks
            .iter()
            .filter(|(_, pending)| pending.session == *session)
            .map(|(id, _)| *id)
            .collect();
        for id in acks {
            if let Some(pending) = tables.pending_acks.remove(&id) {
                owner.get_or_insert(pending.node);
            }
        }

        owner
    }

    /// Drop every reference to `node`, returning the sessions involved
    pub fn forget_node(&self, node: &Uuid) -> Vec<SessionId> {
        let mut tables = self.tables.lock();
        let mut sessions = Vec::new();

        if let Some(session) = tables.by_node.remove(node) {
            tables.by_session.remove(&session);
            sessions.push(session);
        }
        tables.outbound.retain(|session, owner| {
            if owner == node {
                sessions.push(*session);
                false
            } else {
                true
            }
        });
        tables.pending_acks.retain(|_, pending| {
            if pending.node == *node {
                sessions.push(pending.session);
                false
            } else {
                true
            }
        });

        sessions.sort();
        sessions.dedup();
        sessions
    }

    pub fn len(&self) -> usize {
        self.tables.lock().by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.lock().by_node.is_empty()
    }

    /// Forget everything, returning every session that was referenced
    pub fn clear(&self) -> Vec<SessionId> {
        let mut tables = self.tables.lock();
        let mut sessions: Vec<SessionId> = tables.by_session.keys().copied().collect();
        sessions.extend(tables.outbound.keys().copied());
        sessions.extend(tables.pending_acks.values().map(|p| p.session));
        *tables = SessionTables::default();

        sessions.sort();
        sessions.dedup();
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_replaces_previous_session() {
        let index = SessionIndex::new();
        let node = Uuid::new_v4();

        assert_eq!(index.bind(node, SessionId(1)), None);
        assert_eq!(index.bind(node, SessionId(1)), None);
        assert_eq!(index.bind(node, SessionId(2)), Some(SessionId(1)));

        assert_eq!(index.session_of(&node), Some(SessionId(2)));
        assert_eq!(index.peer_of(&SessionId(1)), None);
        assert_eq!(index.peer_of(&SessionId(2)), Some(node));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_forget_session_reports_owner() {
        let index = SessionIndex::new();
        let bound = Uuid::new_v4();
        let dialing = Uuid::new_v4();
        let replying = Uuid::new_v4();

        index.bind(bound, SessionId(1));
        index.begin_outbound(SessionId(2), dialing);
        index.expect_ack(Uuid::new_v4(), replying, SessionId(3));

        assert_eq!(index.forget_session(&SessionId(1)), Some(bound));
        assert!(!index.has_session(&bound));
        assert_eq!(index.forget_session(&SessionId(2)), Some(dialing));
        assert_eq!(index.forget_session(&SessionId(3)), Some(replying));
        assert_eq!(index.forget_session(&SessionId(4)), None);
    }

    #[test]
    fn test_stale_session_does_not_unbind_current() {
        let index = SessionIndex::new();
        let node = Uuid::new_v4();
        index.bind(node, SessionId(1));
        index.bind(node, SessionId(2));

        assert_eq!(index.forget_session(&SessionId(1)), None);
        assert_eq!(index.session_of(&node), Some(SessionId(2)));
    }

    #[test]
    fn test_handshake_tables() {
        let index = SessionIndex::new();
        let node = Uuid::new_v4();
        let reply = Uuid::new_v4();

        index.begin_outbound(SessionId(5), node);
        assert_eq!(index.take_outbound(&SessionId(5)), Some(node));
        assert_eq!(index.take_outbound(&SessionId(5)), None);

        index.expect_ack(reply, node, SessionId(6));
        assert_eq!(
            index.take_ack(&reply),
            Some(PendingAck {
                node,
                session: SessionId(6)
            })
        );
        assert_eq!(index.take_ack(&reply), None);
    }

    #[test]
    fn test_forget_node_collects_all_sessions() {
        let index = SessionIndex::new();
        let node = Uuid::new_v4();
        index.bind(node, SessionId(1));
        index.begin_outbound(SessionId(2), node);
        index.expect_ack(Uuid::new_v4(), node, SessionId(3));
        index.begin_outbound(SessionId(9), Uuid::new_v4());

        assert_eq!(
            index.forget_node(&node),
            vec![SessionId(1), SessionId(2), SessionId(3)]
        );
        assert_eq!(index.clear(), vec![SessionId(9)]);
    }

    #[test]
    fn test_peer_of_covers_unacknowledged_handshake() {
        let index = SessionIndex::new();
        let replying = Uuid::new_v4();
        let reply = Uuid::new_v4();
        index.expect_ack(reply, replying, SessionId(3));

        assert_eq!(index.peer_of(&SessionId(3)), Some(replying));
        assert_eq!(index.peer_of(&SessionId(4)), None);

        index.take_ack(&reply);
        index.bind(replying, SessionId(3));
        assert_eq!(index.peer_of(&SessionId(3)), Some(replying));
    }
}
