// TCP transport
// One TCP connection per session. A reader task per connection feeds the attached
// listener in arrival order; a writer task drains an outbound frame queue.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use cumulus_api::Message;
use cumulus_common::{CumulusError, Result};
use cumulus_core::{SessionId, Transport, TransportListener};

use super::frame;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Connection {
    peer: SocketAddr,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    /// Stops the reader at its next frame boundary
    closed: Arc<Notify>,
}

struct TcpInner {
    listener: RwLock<Option<Arc<dyn TransportListener>>>,
    connections: DashMap<SessionId, Connection>,
    next_session: AtomicU64,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpInner {
    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().clone()
    }
}

/// Transport over plain TCP with length-prefixed JSON frames
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TcpInner {
                listener: RwLock::new(None),
                connections: DashMap::new(),
                next_session: AtomicU64::new(1),
                acceptor: Mutex::new(None),
            }),
        }
    }

    /// Route inbound messages and session losses to `listener`
    pub fn attach(&self, listener: Arc<dyn TransportListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    /// Start accepting connections on `address`, returning the bound address
    pub async fn bind(&self, address: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(address).await?;
        let local = listener.local_addr()?;

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        register(&inner, stream, peer, "inbound");
                    }
                    Err(e) => {
                        warn!("Failed to accept connection on {}: {}", local, e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });
        if let Some(previous) = self.inner.acceptor.lock().replace(task) {
            previous.abort();
        }

        info!("TCP transport listening on {}", local);
        Ok(local)
    }

    pub fn session_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Remote address of an open session
    pub fn peer_address(&self, session: SessionId) -> Option<SocketAddr> {
        self.inner.connections.get(&session).map(|c| c.peer)
    }

    /// Stop accepting and close every session
    pub async fn shutdown(&self) {
        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.abort();
        }
        let sessions: Vec<SessionId> = self.inner.connections.iter().map(|e| *e.key()).collect();
        for session in sessions {
            self.close_session(session);
        }
        info!("TCP transport shut down");
    }

    fn close_session(&self, session: SessionId) {
        if let Some((_, connection)) = self.inner.connections.remove(&session) {
            connection.closed.notify_one();
            // Dropping the queue lets the writer flush and send FIN
            drop(connection.writer);
            debug!("TCP {} to {} closed locally", session, connection.peer);
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> Result<SessionId> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| CumulusError::Transport(format!("connect to {} timed out", address)))?
            .map_err(|e| CumulusError::Transport(format!("connect to {}: {}", address, e)))?;
        let peer = stream.peer_addr()?;
        Ok(register(&self.inner, stream, peer, "outbound"))
    }

    async fn send(&self, session: SessionId, message: &Message) -> Result<()> {
        let frame = frame::encode(message)?;
        let connection = self
            .inner
            .connections
            .get(&session)
            .ok_or_else(|| CumulusError::Transport(format!("{} is closed", session)))?;
        connection
            .writer
            .send(frame)
            .map_err(|_| CumulusError::Transport(format!("{} is closed", session)))
    }

    async fn close(&self, session: SessionId) {
        self.close_session(session);
    }
}

fn register(
    inner: &Arc<TcpInner>,
    stream: TcpStream,
    peer: SocketAddr,
    direction: &'static str,
) -> SessionId {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }
    let session = SessionId(inner.next_session.fetch_add(1, Ordering::Relaxed));
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel();
    let closed = Arc::new(Notify::new());
    inner.connections.insert(
        session,
        Connection {
            peer,
            writer: tx,
            closed: closed.clone(),
        },
    );
    tokio::spawn(write_loop(session, write_half, rx));
    tokio::spawn(read_loop(inner.clone(), session, read_half, closed));

    metrics::counter!("cumulus_tcp_sessions_total", "direction" => direction).increment(1);
    debug!("TCP {} opened ({}) with {}", session, direction, peer);
    session
}

async fn read_loop(
    inner: Arc<TcpInner>,
    session: SessionId,
    mut reader: OwnedReadHalf,
    closed: Arc<Notify>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.notified() => break,
            next = frame::read_message(&mut reader) => next,
        };
        match next {
            Ok(Some(message)) => match inner.listener() {
                Some(listener) => listener.on_message(session, message).await,
                None => warn!("No listener attached, dropping {} message", message.kind()),
            },
            Ok(None) => {
                debug!("TCP {} closed by peer", session);
                break;
            }
            Err(CumulusError::Codec(e)) => {
                warn!("Dropping undecodable frame on {}: {}", session, e);
            }
            Err(e) => {
                debug!("TCP {} broken: {}", session, e);
                break;
            }
        }
    }

    if inner.connections.remove(&session).is_some()
        && let Some(listener) = inner.listener()
    {
        listener.on_session_lost(session).await;
    }
}

async fn write_loop(
    session: SessionId,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = frame::write_frame(&mut writer, &frame).await {
            debug!("Write to {} failed: {}", session, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
