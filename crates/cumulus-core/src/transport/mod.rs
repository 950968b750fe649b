//! Transport abstraction
//!
//! The core never touches sockets. A `Transport` opens sessions and delivers
//! whole messages; inbound traffic comes back through a `TransportListener`.
//! Delivery is FIFO per session.

pub mod memory;

use std::fmt::{Display, Formatter};

use async_trait::async_trait;

use cumulus_api::Message;
use cumulus_common::Result;

pub use memory::{MemoryNetwork, MemoryTransport};

/// Opaque handle of a transport-level session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Outbound side of the transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session to `address` (`host:port`)
    async fn connect(&self, address: &str) -> Result<SessionId>;

    /// Send one message over an open session
    async fn send(&self, session: SessionId, message: &Message) -> Result<()>;

    /// Close a session; the peer observes a session loss
    async fn close(&self, session: SessionId);
}

/// Inbound callbacks invoked by the transport
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// A whole message arrived on `session`
    async fn on_message(&self, session: SessionId, message: Message);

    /// `session` is gone (closed by either side or broken)
    async fn on_session_lost(&self, session: SessionId);
}
