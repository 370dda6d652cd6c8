//! Core types for the weighted multi-round Paxos protocol.
//!
//! This module defines the values that travel between nodes and the error
//! type shared by every layer of the engine:
//!
//! - [`NodeId`]: Index of a process in the node list (`0..Nprocs`)
//! - [`ProposalNumber`]: Globally unique, per-issuer increasing tie-breaker
//! - [`Round`]: Index of one independent consensus instance
//! - [`Proposal`]: A candidate decision for a round
//! - [`MessageType`] / [`Message`]: The wire envelope for every exchange
//! - [`PaxosError`]: Error type for all engine operations

use serde::{Deserialize, Serialize};

use crate::codec::{DecodeError, WireFormat};

/// Identifier of a process, equal to its line index in the node list.
///
/// Every node plays the acceptor role, so a `NodeId` also indexes the
/// per-acceptor weight table and the learner's report slots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Create a node id.
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    /// The id as a slice index.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node({})", self.0)
    }
}

/// Proposal number, the tie-breaker that orders competing proposals.
///
/// # Invariants
///
/// - Node `id` only ever issues numbers congruent to `id` modulo `Nprocs`,
///   so no two nodes issue the same number.
/// - A node's own numbers strictly increase: `id`, `id + Nprocs`,
///   `id + 2·Nprocs`, ...
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ProposalNumber(pub u64);

impl ProposalNumber {
    /// Create a proposal number.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The first number node `id` is allowed to issue.
    pub const fn first_for(id: NodeId) -> Self {
        Self(id.0 as u64)
    }

    /// The next number in the same issuer's lineage.
    pub const fn successor(self, node_count: usize) -> Self {
        Self(self.0 + node_count as u64)
    }
}

impl std::fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proposal({})", self.0)
    }
}

/// Round number, identifying one consensus instance.
///
/// Each round produces at most one chosen value. Rounds are processed
/// roughly in sequence; a node's `current_round` never decreases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Round(pub u64);

impl Round {
    /// The first round.
    pub const ZERO: Self = Self(0);

    /// Create a round number.
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The following round, or `None` at `u64::MAX`.
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Parse a round carried as a decimal string in a message `value`.
    pub fn parse(value: &str) -> Result<Self, DecodeError> {
        value
            .parse::<u64>()
            .map(Self)
            .map_err(|_| DecodeError::InvalidInteger(value.to_string()))
    }

    /// Render the round as the decimal string carried in a message `value`.
    pub fn to_wire(self) -> String {
        self.0.to_string()
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "round({})", self.0)
    }
}

/// A candidate decision for a round.
///
/// Tagged with the proposal number that won (or is trying to win)
/// acceptance. Proposals are immutable values; recency is decided by
/// `number` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Proposal {
    /// The proposal number under which the value is pushed.
    pub number: ProposalNumber,

    /// The round this proposal is for.
    pub round: Round,

    /// The application value, opaque to the engine.
    pub value: String,
}

impl Proposal {
    /// Create a proposal.
    pub fn new(number: ProposalNumber, round: Round, value: impl Into<String>) -> Self {
        Self {
            number,
            round,
            value: value.into(),
        }
    }

    /// Decode a proposal embedded in a message `value`.
    ///
    /// The empty string is the "no proposal" marker. A payload that fails to
    /// decode is also treated as absent; the caller never aborts message
    /// processing because of it.
    pub fn from_embedded(value: &str) -> Option<Self> {
        if value.is_empty() {
            return None;
        }
        match Self::decode(value) {
            Ok(proposal) => Some(proposal),
            Err(e) => {
                tracing::debug!(error = %e, "embedded proposal is malformed, treating as absent");
                None
            }
        }
    }

    /// Encode an optional proposal for embedding in a message `value`.
    pub fn to_embedded(proposal: Option<&Proposal>) -> String {
        proposal.map(|p| p.encode()).unwrap_or_default()
    }
}

impl std::fmt::Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}={:?}", self.number, self.round, self.value)
    }
}

impl WireFormat for Proposal {}

/// Message kinds.
///
/// `Init` and `Ack` belong to the transport handshake and are consumed
/// below the engine; everything else is dispatched by
/// [`PaxosNode::handle`](crate::PaxosNode::handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Transport handshake: dialer announces its id.
    #[serde(rename = "INIT")]
    Init,
    /// Transport handshake: listener accepts and announces its id.
    #[serde(rename = "ACK")]
    Ack,
    /// Rejection: proposal number too low. Carries the acceptor's accepted
    /// proposal (or the empty marker).
    #[serde(rename = "NACK")]
    Nack,
    /// Rejection: round too old. `value` carries the acceptor's current round.
    #[serde(rename = "NACK_OLDROUND")]
    NackOldRound,
    /// Phase 1a. `value` is the round, `number` the proposal number.
    #[serde(rename = "PREPARE_REQUEST")]
    PrepareRequest,
    /// Phase 1b promise. `value` is the accepted proposal (or empty).
    #[serde(rename = "PREPARE_RESPONSE")]
    PrepareResponse,
    /// Phase 2a. `value` is the proposal to accept.
    #[serde(rename = "ACCEPT_REQUEST")]
    AcceptRequest,
    /// Phase 2b, sent to every distinguished learner.
    #[serde(rename = "ACCEPT_NOTIFICATION")]
    AcceptNotification,
    /// Learner broadcast. `number` is the round, `value` the chosen value.
    #[serde(rename = "CHOSEN_VALUE")]
    ChosenValue,
}

impl MessageType {
    /// Whether this kind belongs to the transport handshake.
    pub const fn is_handshake(self) -> bool {
        matches!(self, MessageType::Init | MessageType::Ack)
    }
}

/// The wire envelope for every protocol exchange.
///
/// `kind` selects how `value` and `number` are interpreted; `id` is always
/// the sender. The engine, not this type, knows whether `value` holds a
/// decimal round, an encoded [`Proposal`], or an opaque application value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    /// The message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Kind-dependent payload.
    pub value: String,

    /// Proposal number, or round number for `CHOSEN_VALUE`.
    pub number: u64,

    /// The sender.
    pub id: NodeId,
}

impl Message {
    /// Create a message.
    pub fn new(kind: MessageType, value: impl Into<String>, number: u64, id: NodeId) -> Self {
        Self {
            kind,
            value: value.into(),
            number,
            id,
        }
    }

    /// Handshake greeting from a dialing node.
    pub fn init(from: NodeId) -> Self {
        Self::new(MessageType::Init, "id", from.0 as u64, from)
    }

    /// Handshake acceptance from a listening node.
    pub fn ack(from: NodeId) -> Self {
        Self::new(MessageType::Ack, "ACK", 0, from)
    }

    /// Handshake refusal from a listening node.
    pub fn reject(from: NodeId) -> Self {
        Self::new(MessageType::Nack, "reject", 0, from)
    }

    /// Phase 1a: ask an acceptor to promise `number` for `round`.
    pub fn prepare_request(round: Round, number: ProposalNumber, from: NodeId) -> Self {
        Self::new(MessageType::PrepareRequest, round.to_wire(), number.0, from)
    }

    /// Phase 1b: promise `number`, reporting the last accepted proposal.
    pub fn prepare_response(
        accepted: Option<&Proposal>,
        number: ProposalNumber,
        from: NodeId,
    ) -> Self {
        Self::new(
            MessageType::PrepareResponse,
            Proposal::to_embedded(accepted),
            number.0,
            from,
        )
    }

    /// Rejection of a too-low proposal number.
    pub fn nack(accepted: Option<&Proposal>, promised: ProposalNumber, from: NodeId) -> Self {
        Self::new(
            MessageType::Nack,
            Proposal::to_embedded(accepted),
            promised.0,
            from,
        )
    }

    /// Rejection of a too-old round, carrying the acceptor's current round.
    pub fn nack_old_round(current_round: Round, number: u64, from: NodeId) -> Self {
        Self::new(MessageType::NackOldRound, current_round.to_wire(), number, from)
    }

    /// Phase 2a: ask an acceptor to accept `proposal`.
    pub fn accept_request(proposal: &Proposal, from: NodeId) -> Self {
        Self::new(
            MessageType::AcceptRequest,
            proposal.encode(),
            proposal.number.0,
            from,
        )
    }

    /// Phase 2b: tell a learner `proposal` was accepted.
    pub fn accept_notification(proposal: &Proposal, from: NodeId) -> Self {
        Self::new(
            MessageType::AcceptNotification,
            proposal.encode(),
            proposal.number.0,
            from,
        )
    }

    /// Learner broadcast of the chosen value for `round`.
    pub fn chosen_value(round: Round, value: impl Into<String>, from: NodeId) -> Self {
        Self::new(MessageType::ChosenValue, value, round.0, from)
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}(value={:?}, number={}) from {}",
            self.kind, self.value, self.number, self.id
        )
    }
}

impl WireFormat for Message {}

/// Errors surfaced by the engine.
///
/// Stale-protocol conditions and malformed embedded payloads are absorbed
/// by the engine and never appear here.
///
/// | Error | When it happens |
/// |-------|-----------------|
/// | `Storage` | A snapshot could not be written or read |
/// | `Codec` | A stored snapshot could not be decoded |
/// | `NoSnapshot` | Recovery was requested but nothing was persisted |
/// | `SnapshotMismatch` | The snapshot belongs to another node |
/// | `ConflictingChosenValue` | Two different values reported chosen for a round |
/// | `UnknownNode` | A node id outside `0..Nprocs` |
#[derive(Debug, thiserror::Error)]
pub enum PaxosError {
    /// Persistent storage failed.
    ///
    /// The node can no longer justify the messages it sends, so the caller
    /// must treat this as fatal to crash safety.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted snapshot could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] DecodeError),

    /// Recovery was requested but the store holds no snapshot.
    #[error("no persisted state to recover from")]
    NoSnapshot,

    /// The snapshot was written by another node.
    #[error("snapshot belongs to {found}, expected {expected}")]
    SnapshotMismatch {
        /// The node being started.
        expected: NodeId,
        /// The id recorded in the snapshot.
        found: NodeId,
    },

    /// Safety violation: a peer reported a different chosen value for a
    /// round that already has one. The stored value is kept.
    #[error(
        "conflicting chosen value for {round} from {from}: stored {stored:?}, reported {reported:?}"
    )]
    ConflictingChosenValue {
        /// The round in conflict.
        round: Round,
        /// The value already recorded.
        stored: String,
        /// The value the peer reported.
        reported: String,
        /// The reporting node.
        from: NodeId,
    },

    /// A node id outside the configured cluster.
    #[error("unknown {id} (cluster has {node_count} nodes)")]
    UnknownNode {
        /// The offending id.
        id: NodeId,
        /// Configured cluster size.
        node_count: usize,
    },
}

impl From<std::io::Error> for PaxosError {
    fn from(err: std::io::Error) -> Self {
        PaxosError::Storage(err.to_string())
    }
}
