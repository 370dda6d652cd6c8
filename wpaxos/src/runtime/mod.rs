//! TCP runtime hosting one [`PaxosNode`].
//!
//! The runtime owns the sockets and feeds the engine. Everything runs on a
//! single thread: tasks are spawned with [`tokio::task::spawn_local`] and the
//! engine is shared as `Rc<RefCell<PaxosNode>>`. A mutable borrow is held for
//! exactly one [`PaxosNode::handle`] or [`PaxosNode::start_round`] call and
//! never across an `.await`, which serializes all engine entry points.
//!
//! ## Tasks
//!
//! | Task | Count | Role |
//! |---|---|---|
//! | accept loop | 1 | accepts inbound connections and runs the listener handshake |
//! | dialer | one per lower-id peer | connects with backoff, redials after loss |
//! | reader | one per live connection | decodes frames, applies the delay, dispatches |
//! | writer | one per live connection | drains the peer's outgoing channel |
//! | loopback | 1 | dispatches messages this node sent to itself |
//!
//! Each pair of nodes has exactly one dialer: the node with the higher id.
//! A lost connection is cleared from the peer table and redialed by the
//! dialer; until then, messages to that peer are dropped.
//!
//! The runtime must be started from inside a [`tokio::task::LocalSet`].

mod app;
mod connection;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::spawn_local;
use tracing::{debug, error, info, trace, warn};

pub use app::{AppConfig, demo_value, run_demo};
pub use connection::{Connection, TcpOutbox};

use crate::codec::{DecodeError, WireFormat};
use crate::config::{ClusterConfig, ConfigError};
use crate::node::PaxosNode;
use crate::storage::StateStore;
use crate::types::{Message, NodeId, PaxosError, Round};

/// Errors from the TCP runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine failed.
    #[error(transparent)]
    Paxos(#[from] PaxosError),

    /// The cluster configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A frame could not be decoded.
    #[error("bad frame: {0}")]
    Decode(#[from] DecodeError),

    /// The listener refused our handshake.
    #[error("handshake rejected by {peer}")]
    Rejected {
        /// The peer that refused.
        peer: NodeId,
    },

    /// The connection closed before the handshake finished.
    #[error("connection closed during handshake")]
    HandshakeClosed,

    /// The listener answered with another id than the one dialed.
    #[error("dialed {expected} but reached {found}")]
    UnexpectedPeer {
        /// The peer we dialed.
        expected: NodeId,
        /// The id in the ACK.
        found: NodeId,
    },

    /// A dialer announced an id outside the cluster.
    #[error("unknown peer {id} (cluster has {node_count} nodes)")]
    UnknownPeer {
        /// The announced id.
        id: NodeId,
        /// Configured cluster size.
        node_count: usize,
    },
}

/// Connection and reconnection settings.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Reconnect delay step: the `n`th consecutive failure waits `n` steps.
    pub reconnect_step: Duration,

    /// Upper bound on the reconnect delay.
    pub max_reconnect_delay: Duration,

    /// Timeout for a single connection attempt.
    pub connection_timeout: Duration,

    /// Timeout for completing the handshake on a fresh connection.
    pub handshake_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconnect_step: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl RuntimeConfig {
    /// Settings for fast local tests.
    pub fn local_network() -> Self {
        Self {
            reconnect_step: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(500),
            connection_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        std::cmp::min(self.reconnect_step * failures, self.max_reconnect_delay)
    }
}

/// The engine type hosted by [`TcpRuntime`].
pub type SharedNode<S> = Rc<RefCell<PaxosNode<S, TcpOutbox>>>;

/// One node's engine plus its network plumbing.
pub struct TcpRuntime<S: StateStore + 'static> {
    id: NodeId,
    config: ClusterConfig,
    settings: RuntimeConfig,
    node: SharedNode<S>,
    peers: TcpOutbox,
    loopback_rx: Option<mpsc::UnboundedReceiver<Message>>,
    chosen_rx: mpsc::UnboundedReceiver<(Round, String)>,
}

impl<S: StateStore + 'static> TcpRuntime<S> {
    /// Build the engine for node `id`.
    ///
    /// With `restart` the engine is recovered from `store`; otherwise it
    /// starts fresh and overwrites whatever `store` holds.
    pub fn new(
        id: NodeId,
        config: ClusterConfig,
        store: S,
        restart: bool,
        settings: RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        let spec = config.node(id)?;
        info!(
            node = %id,
            address = %spec.address(),
            weight = spec.weight,
            msg_delay = spec.msg_delay,
            unreliability = spec.unreliability,
            restart,
            "creating runtime"
        );

        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let peers = TcpOutbox::new(id, config.node_count(), loopback_tx);
        let mut node = if restart {
            PaxosNode::recover(id, &config, store, peers.clone())?
        } else {
            PaxosNode::new(id, &config, store, peers.clone())?
        };

        let (chosen_tx, chosen_rx) = mpsc::unbounded_channel();
        node.set_chosen_listener(Box::new(move |round, value| {
            // The receiver only goes away with the runtime.
            let _ = chosen_tx.send((round, value.to_string()));
        }));

        Ok(Self {
            id,
            config,
            settings,
            node: Rc::new(RefCell::new(node)),
            peers,
            loopback_rx: Some(loopback_rx),
            chosen_rx,
        })
    }

    /// Bind this node's configured listening address.
    pub async fn bind(&self) -> Result<TcpListener, RuntimeError> {
        let address = self.config.node(self.id)?.address();
        let listener = TcpListener::bind(&address).await?;
        info!(node = %self.id, address = %address, "listening");
        Ok(listener)
    }

    /// Spawn the accept loop, the dialers and the loopback dispatcher.
    ///
    /// Must be called from inside a `LocalSet`. Calling it twice is a no-op.
    pub fn start(&mut self, listener: TcpListener) {
        let Some(loopback_rx) = self.loopback_rx.take() else {
            warn!(node = %self.id, "runtime already started");
            return;
        };

        spawn_local(loopback_loop(self.node.clone(), loopback_rx));

        let ctx = Rc::new(ConnectionContext {
            me: self.id,
            node_count: self.config.node_count(),
            msg_delay: self.config.node(self.id).map_or(0.0, |spec| spec.msg_delay),
            settings: self.settings.clone(),
            node: self.node.clone(),
            peers: self.peers.clone(),
        });

        spawn_local(accept_loop(ctx.clone(), listener));
        for peer in self.config.node_ids().filter(|peer| *peer < self.id) {
            match self.config.node(peer) {
                Ok(spec) => {
                    spawn_local(dial_loop(ctx.clone(), peer, spec.address()));
                }
                Err(e) => warn!(peer = %peer, error = %e, "cannot dial"),
            }
        }
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The hosted engine.
    pub fn node(&self) -> SharedNode<S> {
        self.node.clone()
    }

    /// Remote peers with a live connection.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.connected_peers()
    }

    /// Start a round proposing `value`.
    pub fn start_round(&self, value: impl Into<String>) -> Result<(), RuntimeError> {
        self.node.borrow_mut().start_round(value)?;
        Ok(())
    }

    /// Wait until a value is known to be chosen for `round`.
    pub async fn wait_for_chosen(&mut self, round: Round) -> Option<String> {
        loop {
            let known = self.node.borrow().chosen_value(round).map(str::to_string);
            if known.is_some() {
                return known;
            }
            self.chosen_rx.recv().await?;
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

struct ConnectionContext<S: StateStore + 'static> {
    me: NodeId,
    node_count: usize,
    msg_delay: f64,
    settings: RuntimeConfig,
    node: SharedNode<S>,
    peers: TcpOutbox,
}

fn dispatch<S: StateStore>(node: &SharedNode<S>, message: Message) {
    let kind = message.kind;
    let from = message.id;
    if let Err(e) = node.borrow_mut().handle(message) {
        error!(from = %from, kind = ?kind, error = %e, "engine failed to handle message");
    }
}

async fn loopback_loop<S: StateStore>(
    node: SharedNode<S>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        dispatch(&node, message);
    }
}

async fn accept_loop<S: StateStore + 'static>(ctx: Rc<ConnectionContext<S>>, listener: TcpListener) {
    loop {
        let (stream, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(node = %ctx.me, error = %e, "accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        spawn_local(async move {
            let mut conn = Connection::new(stream);
            let handshake = tokio::time::timeout(
                ctx.settings.handshake_timeout,
                conn.accept_handshake(ctx.me, ctx.node_count),
            )
            .await;
            match handshake {
                Ok(Ok(peer)) => {
                    info!(node = %ctx.me, peer = %peer, address = %address, "accepted connection");
                    serve_connection(&ctx, peer, conn).await;
                }
                Ok(Err(e)) => warn!(node = %ctx.me, address = %address, error = %e, "handshake failed"),
                Err(_) => warn!(node = %ctx.me, address = %address, "handshake timed out"),
            }
        });
    }
}

async fn dial_loop<S: StateStore + 'static>(
    ctx: Rc<ConnectionContext<S>>,
    peer: NodeId,
    address: String,
) {
    let mut failures: u32 = 0;
    loop {
        if failures > 0 {
            if failures < 25 || failures % 50 == 0 {
                trace!(node = %ctx.me, peer = %peer, failures, "peer not connected");
            }
            tokio::time::sleep(ctx.settings.reconnect_delay(failures)).await;
        }

        match connect(&ctx, peer, &address).await {
            Ok(conn) => {
                info!(node = %ctx.me, peer = %peer, address = %address, "connected");
                serve_connection(&ctx, peer, conn).await;
                // Lost it; come straight back around and redial.
                failures = 1;
            }
            Err(e) => {
                debug!(node = %ctx.me, peer = %peer, error = %e, "connection attempt failed");
                failures = failures.saturating_add(1);
            }
        }
    }
}

async fn connect<S: StateStore>(
    ctx: &ConnectionContext<S>,
    peer: NodeId,
    address: &str,
) -> Result<Connection, RuntimeError> {
    let timed_out = |what: &str| std::io::Error::new(std::io::ErrorKind::TimedOut, what.to_string());

    let stream = tokio::time::timeout(
        ctx.settings.connection_timeout,
        tokio::net::TcpStream::connect(address),
    )
    .await
    .map_err(|_| timed_out("connect timed out"))??;

    let mut conn = Connection::new(stream);
    tokio::time::timeout(
        ctx.settings.handshake_timeout,
        conn.dial_handshake(ctx.me, peer),
    )
    .await
    .map_err(|_| timed_out("handshake timed out"))??;
    Ok(conn)
}

/// Register the connection, run its writer, and read until it closes.
async fn serve_connection<S: StateStore + 'static>(
    ctx: &ConnectionContext<S>,
    peer: NodeId,
    conn: Connection,
) {
    let (mut reader, writer) = conn.into_parts();
    let (tx, rx) = mpsc::unbounded_channel();
    let generation = ctx.peers.register(peer, tx);
    spawn_local(connection::write_loop(peer, writer, rx));

    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(node = %ctx.me, peer = %peer, error = %e, "read failed");
                break;
            }
        };
        let message = match Message::decode(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(node = %ctx.me, peer = %peer, error = %e, "undecodable frame, skipping");
                continue;
            }
        };
        if message.id != peer {
            warn!(node = %ctx.me, peer = %peer, claimed = %message.id, "frame with foreign sender id, skipping");
            continue;
        }
        debug!(node = %ctx.me, peer = %peer, message = %message, "received");

        if ctx.msg_delay > 0.0 {
            let delay = rand::random::<f64>() * 100.0 * ctx.msg_delay;
            match Duration::try_from_secs_f64(delay / 1000.0) {
                Ok(delay) => tokio::time::sleep(delay).await,
                Err(e) => warn!(node = %ctx.me, msg_delay = ctx.msg_delay, error = %e, "unusable message delay, skipping"),
            }
        }
        dispatch(&ctx.node, message);
    }

    if ctx.peers.clear(peer, generation) {
        warn!(node = %ctx.me, peer = %peer, "lost connection, clearing peer");
    }
}
