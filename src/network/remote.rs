//! Remote node: the local proxy for one connected peer
//!
//! Each `RemoteNode` owns its `Connection` and walks through
//! `Dialing -> Handshake -> Verifying -> Active -> Disconnected`.
//!
//! A remote node never touches the owning node's state directly. It reports
//! `NodeEvent`s over a channel; admission is asked for with a oneshot reply,
//! so the node decides while holding its own lock and the remote node tears
//! itself down afterwards, outside of it.

use crate::network::config::NodeConfig;
use crate::network::connection::{Connection, ConnectionError};
use crate::network::message::{
    parse_header, IdentifyMessage, Message, MessageError, VerifyMessage, HEADER_SIZE,
    PROTOCOL_VERSION,
};
use crate::network::registry::{Member, MemberHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a best-effort goodbye may take
const GOODBYE_TIMEOUT: Duration = Duration::from_millis(500);

/// Remote node errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("Unsupported protocol version {0}")]
    VersionMismatch(u32),
    #[error("Duplicate member: {0}")]
    DuplicateMember(String),
    #[error("Rejected by peer: {0}")]
    Rejected(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Node stopped accepting members")]
    NodeClosed,
}

/// Remote node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Dialing,
    Handshake,
    Verifying,
    Active,
    Disconnected,
}

/// Who opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle events a remote node reports to its node
#[derive(Debug)]
pub enum NodeEvent {
    /// The socket is up, handshake about to start
    Connected(Arc<RemoteNode>),
    /// Handshake done; the node answers whether the peer is admitted
    Verified {
        remote: Arc<RemoteNode>,
        reply: oneshot::Sender<bool>,
    },
    /// First transition to `Disconnected`; sent exactly once
    Disconnected(Arc<RemoteNode>),
}

/// What this node advertises about itself during the handshake
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub id: String,
    pub listen_port: u16,
    pub addresses: Vec<String>,
}

/// Timing settings shared by every remote node of a node
#[derive(Debug, Clone, Copy)]
pub struct PeerSettings {
    pub connect_timeout: Duration,
    pub verify_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
    /// Zero waits forever
    pub idle_timeout: Duration,
}

impl PeerSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            verify_timeout: config.verify_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

/// Snapshot of a remote node for status output
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub address: String,
    pub direction: Direction,
    pub state: PeerState,
    pub listen_port: Option<u16>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Local proxy for one peer
pub struct RemoteNode {
    address: String,
    direction: Direction,
    local: Arc<LocalIdentity>,
    settings: PeerSettings,
    /// Set once the handshake reveals it
    peer_id: OnceLock<String>,
    peer_listen_port: OnceLock<u16>,
    /// Set once, on accept or after dialing
    connection: OnceLock<Connection>,
    state: Mutex<PeerState>,
    handle: Mutex<Option<MemberHandle>>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    next_nonce: AtomicU64,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl RemoteNode {
    /// Remote node for the dial-out join path, in `Dialing`
    pub fn outbound(
        address: &str,
        local: Arc<LocalIdentity>,
        settings: PeerSettings,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            address.to_string(),
            Direction::Outbound,
            PeerState::Dialing,
            local,
            settings,
            events,
        ))
    }

    /// Remote node for an accepted socket, directly in `Handshake`
    pub fn inbound(
        connection: Connection,
        local: Arc<LocalIdentity>,
        settings: PeerSettings,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Arc<Self> {
        let remote = Self::new(
            connection.remote().to_string(),
            Direction::Inbound,
            PeerState::Handshake,
            local,
            settings,
            events,
        );
        let _ = remote.connection.set(connection);

        let remote = Arc::new(remote);
        remote.report(NodeEvent::Connected(remote.clone()));
        remote
    }

    fn new(
        address: String,
        direction: Direction,
        state: PeerState,
        local: Arc<LocalIdentity>,
        settings: PeerSettings,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            address,
            direction,
            local,
            settings,
            peer_id: OnceLock::new(),
            peer_listen_port: OnceLock::new(),
            connection: OnceLock::new(),
            state: Mutex::new(state),
            handle: Mutex::new(None),
            connected_at: Mutex::new(None),
            next_nonce: AtomicU64::new(1),
            events,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Peer identity, empty until the handshake reveals it
    pub fn peer_id(&self) -> &str {
        self.peer_id.get().map(String::as_str).unwrap_or("")
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> PeerState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == PeerState::Active
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == PeerState::Disconnected
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.get()
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.peer_id().to_string(),
            address: self.address.clone(),
            direction: self.direction,
            state: self.state(),
            listen_port: self.peer_listen_port.get().copied(),
            connected_at: *lock(&self.connected_at),
        }
    }

    /// Registry handle, set by the node on admission
    pub fn set_handle(&self, handle: MemberHandle) {
        *lock(&self.handle) = Some(handle);
    }

    /// Take the registry handle; a second call yields `None`
    pub fn take_handle(&self) -> Option<MemberHandle> {
        lock(&self.handle).take()
    }

    pub fn handle(&self) -> Option<MemberHandle> {
        *lock(&self.handle)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the handshake followed by the active read loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let remote = self.clone();
        tokio::spawn(async move {
            if let Err(e) = remote.handshake().await {
                log::warn!("Handshake with {} failed: {}", remote.address, e);
                return;
            }
            remote.serve().await;
        })
    }

    /// Dial the target address: `Dialing -> Handshake`
    pub async fn connect(self: &Arc<Self>) -> Result<(), PeerError> {
        log::info!("Connecting to remote node {}", self.address);

        let dialed = Connection::dial(&self.address, self.settings.connect_timeout).await;
        let connection = match dialed {
            Ok(c) => c,
            Err(e) => {
                self.shut_down("dial failed").await;
                return Err(e.into());
            }
        };

        let attached = self.connection.set(connection).is_ok();
        if !attached || !self.transition(PeerState::Dialing, PeerState::Handshake) {
            self.shut_down("connect raced with shutdown").await;
            return Err(PeerError::NotConnected);
        }

        self.report(NodeEvent::Connected(self.clone()));
        Ok(())
    }

    /// Run the identity exchange; on any failure the remote node is shut down
    pub async fn handshake(self: &Arc<Self>) -> Result<(), PeerError> {
        let result = match self.direction {
            Direction::Outbound => self.handshake_outbound().await,
            Direction::Inbound => self.handshake_inbound().await,
        };

        match result {
            Ok(()) => {
                log::info!(
                    "Remote node {} ({}) is active",
                    self.peer_id(),
                    self.address
                );
                self.spawn_heartbeat();
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    PeerError::DuplicateMember(_) => "duplicate member".to_string(),
                    PeerError::Connection(ConnectionError::Timeout) => {
                        "verification timed out".to_string()
                    }
                    other => other.to_string(),
                };
                self.shut_down(&reason).await;
                Err(e)
            }
        }
    }

    async fn handshake_outbound(self: &Arc<Self>) -> Result<(), PeerError> {
        let identify = IdentifyMessage::new(
            &self.local.id,
            self.local.listen_port,
            self.local.addresses.clone(),
        );
        self.send_message(&Message::Identify(identify)).await?;
        self.transition_or_fail(PeerState::Handshake, PeerState::Verifying)?;

        let verify = match self.read_message(self.settings.verify_timeout).await? {
            Message::Verify(v) => v,
            Message::Goodbye { reason } => return Err(PeerError::Rejected(reason)),
            other => return Err(PeerError::UnexpectedMessage(other.type_name())),
        };
        if verify.version != PROTOCOL_VERSION {
            return Err(PeerError::VersionMismatch(verify.version));
        }

        self.set_peer(verify.id, verify.listen_port);
        self.admit().await
    }

    async fn handshake_inbound(self: &Arc<Self>) -> Result<(), PeerError> {
        let identify = match self.read_message(self.settings.verify_timeout).await? {
            Message::Identify(i) => i,
            Message::Goodbye { reason } => return Err(PeerError::Rejected(reason)),
            other => return Err(PeerError::UnexpectedMessage(other.type_name())),
        };
        if identify.version != PROTOCOL_VERSION {
            return Err(PeerError::VersionMismatch(identify.version));
        }

        self.transition_or_fail(PeerState::Handshake, PeerState::Verifying)?;
        self.set_peer(identify.id, identify.listen_port);
        self.admit().await?;

        let verify = VerifyMessage::new(&self.local.id, self.local.listen_port);
        self.send_message(&Message::Verify(verify)).await
    }

    /// Ask the node to admit this peer: `Verifying -> Active`
    async fn admit(self: &Arc<Self>) -> Result<(), PeerError> {
        let (reply, admitted) = oneshot::channel();
        self.events
            .send(NodeEvent::Verified {
                remote: self.clone(),
                reply,
            })
            .map_err(|_| PeerError::NodeClosed)?;

        if !admitted.await.map_err(|_| PeerError::NodeClosed)? {
            return Err(PeerError::DuplicateMember(self.peer_id().to_string()));
        }

        self.transition_or_fail(PeerState::Verifying, PeerState::Active)?;
        *lock(&self.connected_at) = Some(Utc::now());
        Ok(())
    }

    /// Read loop of an active peer; returns once the peer is disconnected
    pub async fn serve(self: &Arc<Self>) {
        while self.is_active() {
            match self.read_message(self.settings.idle_timeout).await {
                Ok(Message::Ping(nonce)) => {
                    if let Err(e) = self.send_message(&Message::Pong(nonce)).await {
                        log::warn!("Failed to send pong to {}: {}", self.address, e);
                        self.shut_down("write failed").await;
                    }
                }
                Ok(Message::Pong(_)) => {}
                Ok(Message::Goodbye { reason }) => {
                    log::info!("Remote node {} left: {}", self.peer_id(), reason);
                    self.shut_down("peer left").await;
                }
                Ok(other) => {
                    log::warn!(
                        "Ignoring {} from active remote node {}",
                        other.type_name(),
                        self.peer_id()
                    );
                }
                Err(PeerError::Connection(ConnectionError::Eof)) => {
                    log::info!("Remote node {} closed the connection", self.peer_id());
                    self.shut_down("peer closed").await;
                }
                Err(PeerError::Connection(ConnectionError::Timeout)) => {
                    log::warn!("Remote node {} went idle", self.peer_id());
                    self.shut_down("idle timeout").await;
                }
                Err(e) => {
                    if !self.is_disconnected() {
                        log::warn!("Read from {} failed: {}", self.peer_id(), e);
                    }
                    self.shut_down("read failed").await;
                }
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let Some(period) = self.settings.heartbeat_interval else {
            return;
        };

        let remote = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !remote.is_active() {
                    break;
                }

                let nonce = remote.next_nonce.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = remote.send_message(&Message::Ping(nonce)).await {
                    log::debug!("Heartbeat to {} failed: {}", remote.address, e);
                    remote.shut_down("heartbeat failed").await;
                    break;
                }
            }
        });
    }

    /// Close the connection and move to `Disconnected`.
    ///
    /// Safe to call any number of times; only the first call reports to the
    /// node.
    pub async fn shut_down(self: &Arc<Self>, reason: &str) {
        let previous = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut *state, PeerState::Disconnected)
        };

        if let Some(connection) = self.connection.get() {
            if previous != PeerState::Disconnected && connection.is_usable() {
                let goodbye = Message::Goodbye {
                    reason: reason.to_string(),
                };
                if let Ok(frame) = goodbye.to_frame() {
                    let send = connection.send_data(&frame);
                    let _ = tokio::time::timeout(GOODBYE_TIMEOUT, send).await;
                }
            }
            connection.close().await;
        }

        if previous != PeerState::Disconnected {
            log::info!(
                "Remote node {} ({}) shut down: {}",
                self.peer_id(),
                self.address,
                reason
            );
            self.report(NodeEvent::Disconnected(self.clone()));
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn send_message(&self, msg: &Message) -> Result<(), PeerError> {
        let connection = self.connection.get().ok_or(PeerError::NotConnected)?;
        let frame = msg.to_frame()?;
        connection.send_data(&frame).await?;
        Ok(())
    }

    /// Read one frame; `timeout` bounds the whole frame, not each part
    async fn read_message(&self, timeout: Duration) -> Result<Message, PeerError> {
        let connection = self.connection.get().ok_or(PeerError::NotConnected)?;
        let started = Instant::now();

        let header = connection.read_data(HEADER_SIZE, timeout).await?;
        let len = parse_header(&header)?;

        let remaining = if timeout.is_zero() {
            timeout
        } else {
            match timeout.checked_sub(started.elapsed()) {
                Some(left) if !left.is_zero() => left,
                _ => return Err(ConnectionError::Timeout.into()),
            }
        };
        let body = connection.read_data(len, remaining).await?;

        let msg = Message::from_bytes(&body).map_err(MessageError::from)?;
        log::debug!("Received {} from {}", msg.type_name(), self.address);
        Ok(msg)
    }

    pub(crate) fn set_peer(&self, id: String, listen_port: u16) {
        let _ = self.peer_id.set(id);
        let _ = self.peer_listen_port.set(listen_port);
    }

    fn transition(&self, from: PeerState, to: PeerState) -> bool {
        let mut state = lock(&self.state);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn transition_or_fail(&self, from: PeerState, to: PeerState) -> Result<(), PeerError> {
        if self.transition(from, to) {
            Ok(())
        } else {
            Err(PeerError::Connection(ConnectionError::Unusable))
        }
    }

    fn report(&self, event: NodeEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Node no longer listening for events from {}", self.address);
        }
    }
}

impl Member for RemoteNode {
    type Id = str;

    fn member_id(&self) -> &str {
        self.peer_id()
    }
}

impl std::fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("peer_id", &self.peer_id())
            .field("address", &self.address)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Lock a std mutex, recovering the data from a poisoned one
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn local(id: &str) -> Arc<LocalIdentity> {
        Arc::new(LocalIdentity {
            id: id.to_string(),
            listen_port: 9911,
            addresses: vec![],
        })
    }

    fn settings() -> PeerSettings {
        PeerSettings {
            connect_timeout: Duration::from_secs(2),
            verify_timeout: Duration::from_millis(300),
            heartbeat_interval: None,
            idle_timeout: Duration::ZERO,
        }
    }

    async fn write_frame(stream: &mut TcpStream, msg: Message) {
        stream.write_all(&msg.to_frame().unwrap()).await.unwrap();
    }

    async fn read_frame(stream: &mut TcpStream) -> Option<Message> {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.ok()?;
        let len = parse_header(&header).unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some(Message::from_bytes(&body).unwrap())
    }

    /// Inbound remote node plus the raw client socket on the other end
    async fn inbound_pair(
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> (Arc<RemoteNode>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let conn = Connection::wrap(accepted.unwrap().0).unwrap();
        let remote = RemoteNode::inbound(conn, local("local"), settings(), events);
        (remote, client.unwrap())
    }

    /// Answer every admission request with `admit`, collecting disconnects
    fn fake_node(
        mut rx: mpsc::UnboundedReceiver<NodeEvent>,
        admit: bool,
    ) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut disconnects = 0;
            while let Some(event) = rx.recv().await {
                match event {
                    NodeEvent::Connected(_) => {}
                    NodeEvent::Verified { reply, .. } => {
                        let _ = reply.send(admit);
                    }
                    NodeEvent::Disconnected(_) => disconnects += 1,
                }
            }
            disconnects
        })
    }

    #[tokio::test]
    async fn test_inbound_handshake_admitted() {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);
        let (remote, mut client) = inbound_pair(tx).await;
        assert_eq!(remote.state(), PeerState::Handshake);

        write_frame(
            &mut client,
            Message::Identify(IdentifyMessage::new("peer-b", 9002, vec![])),
        )
        .await;
        remote.handshake().await.unwrap();

        assert!(remote.is_active());
        assert_eq!(remote.peer_id(), "peer-b");
        assert_eq!(remote.info().listen_port, Some(9002));
        assert!(remote.info().connected_at.is_some());

        match read_frame(&mut client).await {
            Some(Message::Verify(v)) => assert_eq!(v.id, "local"),
            other => panic!("expected Verify, got {:?}", other),
        }

        remote.shut_down("test").await;
        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inbound_duplicate_rejected() {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, false);
        let (remote, mut client) = inbound_pair(tx).await;

        write_frame(
            &mut client,
            Message::Identify(IdentifyMessage::new("peer-b", 9002, vec![])),
        )
        .await;
        let res = remote.handshake().await;

        assert!(matches!(res, Err(PeerError::DuplicateMember(_))));
        assert!(remote.is_disconnected());
        match read_frame(&mut client).await {
            Some(Message::Goodbye { reason }) => assert_eq!(reason, "duplicate member"),
            other => panic!("expected Goodbye, got {:?}", other),
        }
        assert!(read_frame(&mut client).await.is_none());

        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_verification_timeout_is_fatal() {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);
        let (remote, _client) = inbound_pair(tx).await;

        let res = remote.handshake().await;
        assert!(matches!(
            res,
            Err(PeerError::Connection(ConnectionError::Timeout))
        ));
        assert!(remote.is_disconnected());
        assert!(!remote.connection().unwrap().is_usable());

        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_slow_frame_cannot_stretch_verify_timeout() {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);
        let (remote, mut client) = inbound_pair(tx).await;

        // Header and body each arrive inside 300ms, the whole frame does not.
        let frame = Message::Identify(IdentifyMessage::new("peer-b", 9002, vec![]))
            .to_frame()
            .unwrap();
        let trickle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = client.write_all(&frame[..HEADER_SIZE]).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = client.write_all(&frame[HEADER_SIZE..]).await;
            client
        });

        let res = remote.handshake().await;
        assert!(matches!(
            res,
            Err(PeerError::Connection(ConnectionError::Timeout))
        ));
        assert!(remote.is_disconnected());
        assert_eq!(remote.peer_id(), "");

        drop(trickle.await.unwrap());
        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reports_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);
        let (remote, _client) = inbound_pair(tx).await;

        remote.shut_down("first").await;
        remote.shut_down("second").await;
        remote.shut_down("third").await;
        assert!(remote.is_disconnected());

        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handle_taken_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = RemoteNode::outbound("127.0.0.1:1", local("a"), settings(), tx);

        assert_eq!(remote.take_handle(), None);
        let mut registry = crate::network::registry::Registry::new();
        let handle = registry.add(remote.clone());
        remote.set_handle(handle);

        assert_eq!(remote.handle(), Some(handle));
        assert_eq!(remote.take_handle(), Some(handle));
        assert_eq!(remote.take_handle(), None);
    }

    #[tokio::test]
    async fn test_outbound_join() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let identify = match read_frame(&mut stream).await {
                Some(Message::Identify(i)) => i,
                other => panic!("expected Identify, got {:?}", other),
            };
            write_frame(&mut stream, Message::Verify(VerifyMessage::new("server", 9003))).await;
            // Stay connected until the client leaves.
            let goodbye = read_frame(&mut stream).await;
            (identify, goodbye)
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);
        let remote = RemoteNode::outbound(&addr, local("client"), settings(), tx);
        assert_eq!(remote.state(), PeerState::Dialing);

        remote.connect().await.unwrap();
        remote.handshake().await.unwrap();
        assert!(remote.is_active());
        assert_eq!(remote.peer_id(), "server");
        assert_eq!(remote.direction(), Direction::Outbound);

        remote.shut_down("leaving").await;
        let (identify, goodbye) = server.await.unwrap();
        assert_eq!(identify.id, "client");
        assert_eq!(
            goodbye,
            Some(Message::Goodbye {
                reason: "leaving".to_string()
            })
        );

        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outbound_dial_failure_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);
        let remote = RemoteNode::outbound(&addr, local("client"), settings(), tx);

        assert!(remote.connect().await.is_err());
        assert!(remote.is_disconnected());

        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_active_peer_answers_ping_and_detects_close() {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);
        let (remote, mut client) = inbound_pair(tx).await;

        write_frame(
            &mut client,
            Message::Identify(IdentifyMessage::new("peer-b", 9002, vec![])),
        )
        .await;
        remote.handshake().await.unwrap();
        assert!(matches!(read_frame(&mut client).await, Some(Message::Verify(_))));

        let serving = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.serve().await })
        };

        write_frame(&mut client, Message::Ping(77)).await;
        assert_eq!(read_frame(&mut client).await, Some(Message::Pong(77)));

        client.shutdown().await.unwrap();
        serving.await.unwrap();
        assert!(remote.is_disconnected());

        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping() {
        let (tx, rx) = mpsc::unbounded_channel();
        let node = fake_node(rx, true);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();

        let settings = PeerSettings {
            heartbeat_interval: Some(Duration::from_millis(50)),
            ..settings()
        };
        let conn = Connection::wrap(accepted.unwrap().0).unwrap();
        let remote = RemoteNode::inbound(conn, local("local"), settings, tx);

        write_frame(
            &mut client,
            Message::Identify(IdentifyMessage::new("peer-b", 9002, vec![])),
        )
        .await;
        remote.handshake().await.unwrap();
        assert!(matches!(read_frame(&mut client).await, Some(Message::Verify(_))));
        assert!(matches!(read_frame(&mut client).await, Some(Message::Ping(_))));

        remote.shut_down("done").await;
        // Let the heartbeat task notice and drop its reference.
        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(remote);
        assert_eq!(node.await.unwrap(), 1);
    }
}
