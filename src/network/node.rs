//! Cluster node implementation
//!
//! The node owns the local cache, its identity, the listeners and the
//! registry of active remote nodes. Remote nodes report lifecycle events
//! over a channel; a single event task applies them to the registry, so the
//! duplicate check and the insert happen under one short lock and never
//! around remote node teardown.

use crate::cache::{Cache, CacheConfig};
use crate::network::config::{ConfigError, NodeConfig};
use crate::network::connection::Connection;
use crate::network::identity::{IdGenerator, RandomIdGenerator, NODE_ID_LENGTH};
use crate::network::registry::Registry;
use crate::network::remote::{
    lock, LocalIdentity, NodeEvent, PeerError, PeerInfo, PeerSettings, RemoteNode,
};
use crate::network::server::{AcceptPolicy, FatalEvent, Server};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("Join failed: {0}")]
    Join(#[from] PeerError),
    #[error("Node already started")]
    AlreadyStarted,
}

type SharedRegistry = Arc<Mutex<Registry<Arc<RemoteNode>>>>;

/// Connection counters
#[derive(Debug, Default)]
struct NodeCounters {
    accepted: AtomicU64,
    connected: AtomicU64,
    rejected: AtomicU64,
}

/// The cluster node
pub struct Node {
    config: NodeConfig,
    cache: Arc<Cache>,
    registry: SharedRegistry,
    id_generator: Box<dyn IdGenerator>,
    counters: Arc<NodeCounters>,
    listen_addrs: Vec<SocketAddr>,
    started: bool,
    shutdown_tx: watch::Sender<bool>,
    accept_tasks: Vec<JoinHandle<()>>,
    event_task: Option<JoinHandle<()>>,
    /// Event sender handed to remote nodes; present while running
    local_events: Option<mpsc::UnboundedSender<NodeEvent>>,
    fatal_tx: mpsc::UnboundedSender<FatalEvent>,
    fatal_rx: Option<mpsc::UnboundedReceiver<FatalEvent>>,
}

impl Node {
    /// Create a node with a default-configured cache
    pub fn new(config: NodeConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Self {
            config,
            cache: Arc::new(Cache::new(CacheConfig::default())),
            registry: Arc::new(Mutex::new(Registry::new())),
            id_generator: Box::new(RandomIdGenerator::new()),
            counters: Arc::new(NodeCounters::default()),
            listen_addrs: Vec::new(),
            started: false,
            shutdown_tx,
            accept_tasks: Vec::new(),
            event_task: None,
            local_events: None,
            fatal_tx,
            fatal_rx: Some(fatal_rx),
        }
    }

    /// Replace the source of generated identities
    pub fn with_id_generator(mut self, generator: Box<dyn IdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    /// Node identity (empty before `start` when none was configured)
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Shared handle to the local cache
    pub fn cache(&self) -> Arc<Cache> {
        self.cache.clone()
    }

    /// Addresses the listeners are bound to
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Receiver for fatal events; available once
    pub fn take_fatal_events(&mut self) -> Option<mpsc::UnboundedReceiver<FatalEvent>> {
        self.fatal_rx.take()
    }

    /// Start the node.
    ///
    /// Fixes the identity, binds the listeners, starts accepting, and when
    /// configured to join, dials the join address before returning. The
    /// handshake with that member then runs in the background.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.started {
            return Err(NodeError::AlreadyStarted);
        }

        if self.config.id.is_empty() {
            self.config.id = self.id_generator.generate(NODE_ID_LENGTH);
            log::info!("Node ID is {}", self.config.id);
        }

        if let Err(e) = self.config.validate() {
            log::error!("CRITICAL: {}", e);
            return Err(e.into());
        }

        self.bring_node_up().await?;
        self.started = true;

        if self.config.join {
            self.join_cluster().await?;
        }

        Ok(())
    }

    async fn bring_node_up(&mut self) -> Result<(), NodeError> {
        log::info!("Bringing up node {}", self.config.id);

        let mut servers = Vec::new();
        for addr in self.config.listen_addresses() {
            servers.push(Server::bind(&addr).await?);
        }
        self.listen_addrs = servers.iter().map(Server::local_addr).collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.event_task = Some(tokio::spawn(run_events(
            events_rx,
            self.registry.clone(),
            self.config.id.clone(),
            self.counters.clone(),
            self.shutdown_tx.subscribe(),
        )));

        let local = Arc::new(self.local_identity());
        let settings = PeerSettings::from_config(&self.config);
        let policy = AcceptPolicy::from_config(&self.config);

        for server in servers {
            let local = local.clone();
            let events = events_tx.clone();
            let counters = self.counters.clone();

            let on_accept = move |stream: TcpStream, addr: SocketAddr| {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                match Connection::wrap(stream) {
                    Ok(connection) => {
                        log::info!("New connection from remote '{}'", addr);
                        RemoteNode::inbound(connection, local.clone(), settings, events.clone())
                            .start();
                    }
                    Err(e) => log::warn!("Failed to set up connection from {}: {}", addr, e),
                }
            };

            self.accept_tasks.push(tokio::spawn(server.run(
                policy,
                on_accept,
                self.fatal_tx.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        self.local_events = Some(events_tx);
        Ok(())
    }

    async fn join_cluster(&mut self) -> Result<(), NodeError> {
        let events = match &self.local_events {
            Some(events) => events.clone(),
            None => return Err(NodeError::Join(PeerError::NodeClosed)),
        };

        let remote = RemoteNode::outbound(
            &self.config.join_address,
            Arc::new(self.local_identity()),
            PeerSettings::from_config(&self.config),
            events,
        );
        remote.connect().await?;
        remote.start();

        Ok(())
    }

    fn local_identity(&self) -> LocalIdentity {
        let addresses = if self.config.bind_all {
            Vec::new()
        } else {
            self.config.local_addresses.clone()
        };

        LocalIdentity {
            id: self.config.id.clone(),
            listen_port: self
                .listen_addrs
                .first()
                .map(|a| a.port())
                .unwrap_or(self.config.local_port),
            addresses,
        }
    }

    /// Shut the node down.
    ///
    /// Stops accepting, shuts every registered remote node down and removes
    /// it; when this returns the registry is empty and no new member can be
    /// admitted.
    pub async fn shutdown(&mut self) {
        log::info!("Node {} shutting down...", self.config.id);
        {
            // Admissions check the flag under this lock, so none land after it.
            let _registry = lock(&self.registry);
            self.shutdown_tx.send_replace(true);
        }

        for task in self.accept_tasks.drain(..) {
            let _ = task.await;
        }

        let remotes = lock(&self.registry).values();
        futures::future::join_all(remotes.iter().map(|r| r.shut_down("node shutting down"))).await;

        {
            let mut registry = lock(&self.registry);
            for remote in &remotes {
                if let Some(handle) = remote.take_handle() {
                    registry.remove(handle);
                }
            }
        }

        self.local_events = None;
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }

    /// Number of active remote nodes
    pub fn peer_count(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Identities of the active remote nodes
    pub fn peer_ids(&self) -> HashSet<String> {
        lock(&self.registry).identities()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        lock(&self.registry).iter().map(|r| r.info()).collect()
    }

    /// Snapshot of the active remote nodes
    pub fn remote_nodes(&self) -> Vec<Arc<RemoteNode>> {
        lock(&self.registry).values()
    }

    /// Get node status
    pub fn status(&self) -> NodeStatus {
        let registry = lock(&self.registry);

        NodeStatus {
            id: self.config.id.clone(),
            listen_addrs: self.listen_addrs.iter().map(|a| a.to_string()).collect(),
            peers: registry.len(),
            registry_capacity: registry.capacity(),
            connections_accepted: self.counters.accepted.load(Ordering::Relaxed),
            connections_established: self.counters.connected.load(Ordering::Relaxed),
            members_rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
    }
}

/// Node status information
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub listen_addrs: Vec<String>,
    pub peers: usize,
    pub registry_capacity: usize,
    pub connections_accepted: u64,
    pub connections_established: u64,
    pub members_rejected: u64,
}

/// Apply remote node events to the registry, one at a time
async fn run_events(
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    registry: SharedRegistry,
    local_id: String,
    counters: Arc<NodeCounters>,
    shutdown: watch::Receiver<bool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            NodeEvent::Connected(remote) => {
                counters.connected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Remote node connected: {}", remote.address());
            }
            NodeEvent::Verified { remote, reply } => {
                let admitted = admit(&registry, &local_id, &remote, &shutdown);
                if !admitted {
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
                // The remote node shuts itself down on `false`, outside our lock.
                let _ = reply.send(admitted);
            }
            NodeEvent::Disconnected(remote) => {
                if let Some(handle) = remote.take_handle() {
                    lock(&registry).remove(handle);
                    log::info!("Removed remote node {} ({})", remote.peer_id(), handle);
                }
            }
        }
    }
}

/// Atomic check-then-admit
fn admit(
    registry: &SharedRegistry,
    local_id: &str,
    remote: &Arc<RemoteNode>,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    let id = remote.peer_id();
    if id.is_empty() || id == local_id {
        log::warn!("Rejecting remote node at {} claiming id '{}'", remote.address(), id);
        return false;
    }

    let mut registry = lock(registry);
    if *shutdown.borrow() {
        log::debug!("Node is shutting down, not admitting '{}'", id);
        return false;
    }
    if remote.is_disconnected() {
        return false;
    }
    if registry.contains(id) {
        log::warn!(
            "Node already has remote node '{}' so shutting down new connection",
            id
        );
        return false;
    }

    let handle = registry.add(remote.clone());
    remote.set_handle(handle);
    log::info!("Admitted remote node {} ({})", id, handle);
    true
}
