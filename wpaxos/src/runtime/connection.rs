//! Framed peer connections and the peer table behind [`TcpOutbox`].
//!
//! Frames are single-line encoded [`Message`]s terminated by `\n`. A new
//! connection starts with a handshake: the dialer sends `INIT` carrying its
//! id, and the listener answers `ACK` with its own id, or `NACK "reject"`
//! when the dialer's id is not part of the cluster.
//!
//! ```text
//! dialer                      listener
//!   │ ── INIT(id=dialer) ──────► │
//!   │ ◄────── ACK(id=listener) ── │   or NACK("reject")
//!   │ ◄═══════ protocol frames ═► │
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RuntimeError;
use crate::codec::{DecodeError, WireFormat};
use crate::outbox::Outbox;
use crate::types::{Message, MessageType, NodeId};

// =============================================================================
// Framing
// =============================================================================

/// A TCP connection speaking newline-delimited [`Message`] frames.
#[derive(Debug)]
pub struct Connection {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read).lines(),
            writer: write,
        }
    }

    /// Write one frame.
    pub async fn send(&mut self, message: &Message) -> Result<(), RuntimeError> {
        write_frame(&mut self.writer, message).await
    }

    /// Read one frame. `Ok(None)` means the peer closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Message>, RuntimeError> {
        match self.reader.next_line().await? {
            None => Ok(None),
            Some(line) => Ok(Some(Message::decode(&line)?)),
        }
    }

    /// Run the dialing side of the handshake, expecting to reach `expected`.
    pub async fn dial_handshake(
        &mut self,
        me: NodeId,
        expected: NodeId,
    ) -> Result<(), RuntimeError> {
        self.send(&Message::init(me)).await?;
        let reply = self.recv().await?.ok_or(RuntimeError::HandshakeClosed)?;
        match reply.kind {
            MessageType::Ack if reply.id == expected => Ok(()),
            MessageType::Ack => Err(RuntimeError::UnexpectedPeer {
                expected,
                found: reply.id,
            }),
            MessageType::Nack => Err(RuntimeError::Rejected { peer: expected }),
            other => Err(DecodeError::UnexpectedType(format!("{other:?}")).into()),
        }
    }

    /// Run the listening side of the handshake and return the dialer's id.
    pub async fn accept_handshake(
        &mut self,
        me: NodeId,
        node_count: usize,
    ) -> Result<NodeId, RuntimeError> {
        let hello = self.recv().await?.ok_or(RuntimeError::HandshakeClosed)?;
        if hello.kind != MessageType::Init {
            return Err(DecodeError::UnexpectedType(format!("{:?}", hello.kind)).into());
        }
        if hello.id.index() >= node_count || hello.id == me {
            self.send(&Message::reject(me)).await?;
            return Err(RuntimeError::UnknownPeer {
                id: hello.id,
                node_count,
            });
        }
        self.send(&Message::ack(me)).await?;
        Ok(hello.id)
    }

    /// Split into the frame reader and the raw write half.
    pub fn into_parts(self) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        (self.reader, self.writer)
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, message: &Message) -> Result<(), RuntimeError> {
    let mut line = message.encode();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Drain `rx` onto the socket until the channel closes or a write fails.
pub(super) async fn write_loop(
    peer: NodeId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            warn!(peer = %peer, error = %e, "write failed, closing writer");
            break;
        }
    }
    debug!(peer = %peer, "writer stopped");
}

// =============================================================================
// Peer table
// =============================================================================

#[derive(Debug)]
struct PeerSlot {
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug)]
struct PeerTable {
    me: NodeId,
    loopback: mpsc::UnboundedSender<Message>,
    slots: RefCell<Vec<Option<PeerSlot>>>,
    next_generation: Cell<u64>,
}

/// The engine's [`Outbox`] over live TCP connections.
///
/// Holds at most one writer channel per peer. Registering a newer
/// connection replaces the older one; each registration gets a generation
/// number so that a stale connection's teardown cannot clear its successor.
/// Messages to a peer with no live connection are dropped with a warning,
/// and messages to this node go through a loopback channel.
#[derive(Debug, Clone)]
pub struct TcpOutbox {
    table: Rc<PeerTable>,
}

impl TcpOutbox {
    /// Create an empty table for node `me` in a cluster of `node_count`.
    pub fn new(
        me: NodeId,
        node_count: usize,
        loopback: mpsc::UnboundedSender<Message>,
    ) -> Self {
        let slots = (0..node_count).map(|_| None).collect();
        Self {
            table: Rc::new(PeerTable {
                me,
                loopback,
                slots: RefCell::new(slots),
                next_generation: Cell::new(0),
            }),
        }
    }

    /// Install `tx` as the writer for `peer`, returning its generation.
    pub fn register(&self, peer: NodeId, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let generation = self.table.next_generation.get();
        self.table.next_generation.set(generation + 1);

        let mut slots = self.table.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(peer.index()) {
            if slot.is_some() {
                info!(peer = %peer, "replacing existing connection");
            }
            *slot = Some(PeerSlot { generation, tx });
        }
        generation
    }

    /// Clear `peer`'s writer if it is still the one registered as
    /// `generation`. Returns whether anything was cleared.
    pub fn clear(&self, peer: NodeId, generation: u64) -> bool {
        let mut slots = self.table.slots.borrow_mut();
        match slots.get_mut(peer.index()) {
            Some(slot) if slot.as_ref().is_some_and(|s| s.generation == generation) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Whether `peer` has a live writer. This node is always connected.
    pub fn is_connected(&self, peer: NodeId) -> bool {
        peer == self.table.me
            || self
                .table
                .slots
                .borrow()
                .get(peer.index())
                .is_some_and(Option::is_some)
    }

    /// Remote peers with a live writer.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.table
            .slots
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| NodeId::new(i))
            .collect()
    }
}

impl Outbox for TcpOutbox {
    fn send(&self, to: NodeId, message: Message) {
        if to == self.table.me {
            if self.table.loopback.send(message).is_err() {
                warn!(to = %to, "loopback closed, dropping message");
            }
            return;
        }

        let slots = self.table.slots.borrow();
        match slots.get(to.index()).and_then(Option::as_ref) {
            Some(slot) => {
                if let Err(e) = slot.tx.send(message) {
                    warn!(to = %to, kind = ?e.0.kind, "peer writer closed, dropping message");
                }
            }
            None => {
                warn!(to = %to, kind = ?message.kind, "peer not connected, dropping message");
            }
        }
    }
}
