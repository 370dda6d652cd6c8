//! # wpaxos: Multi-Round Weighted-Quorum Paxos
//!
//! This crate implements a single-decree-per-round, multi-round Paxos engine
//! run by each of `N` cooperating processes. Every process can act as
//! proposer, acceptor and (if configured) learner at the same time. Quorums
//! are weighted: each acceptor carries a configured weight and a set of
//! acceptors is a quorum when its weights sum to more than one half. Every
//! node persists its full state before sending any message that depends on
//! it, so a crashed node can rejoin mid-protocol without violating safety.
//!
//! ## Protocol at a glance
//!
//! | Step | Message | Sender | Receiver |
//! |---|---|---|---|
//! | 1a | `PREPARE_REQUEST(round, n)` | proposer | acceptor window |
//! | 1b | `PREPARE_RESPONSE(accepted, n)` / `NACK` / `NACK_OLDROUND` | acceptor | proposer |
//! | 2a | `ACCEPT_REQUEST(proposal)` | proposer | acceptor window |
//! | 2b | `ACCEPT_NOTIFICATION(proposal)` / `NACK` / `NACK_OLDROUND` | acceptor | learners / proposer |
//! | 3 | `CHOSEN_VALUE(round, value)` | learner | every node |
//!
//! The proposer contacts a fixed window of `floor(N/2) + 1` acceptors that
//! starts right after its own id, not every acceptor. A window may not hold
//! enough weight for a quorum (see [`ClusterConfig::acceptor_set`]).
//!
//! Each acceptor keeps a single accepted proposal across rounds. When several
//! proposers run in different rounds at once, a newer round's acceptance can
//! overwrite an older round's before the acceptor learns the older outcome,
//! so deployments run a single distinguished proposer. A proposer also defers
//! to the highest-numbered proposal any acceptor reports, whatever its round,
//! so an acceptance that was never cleared can carry its value forward.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              runtime (TCP transport + demo app)          │
//! │   reader task per peer ──► handle(msg)   start_round ◄── │
//! └───────────────┬──────────────────────────────▲───────────┘
//!                 │                              │ Outbox::send
//!                 ▼                              │
//! ┌──────────────────────────────────────────────┴───────────┐
//! │                      PaxosNode                           │
//! │  proposer · acceptor · learner  ──► StateStore::save     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use wpaxos::{ClusterConfig, InMemoryStateStore, MemoryOutbox, NodeId, PaxosNode};
//!
//! let config = ClusterConfig::uniform(3);
//! let outbox = MemoryOutbox::new();
//! let mut node = PaxosNode::new(NodeId::new(0), &config, InMemoryStateStore::new(), outbox.clone())
//!     .expect("create node");
//!
//! node.start_round("hello").expect("start round");
//! // One PREPARE_REQUEST to each member of the acceptor window {1, 2}.
//! assert_eq!(outbox.drain().len(), 2);
//! ```
//!
//! ## Crate Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | `NodeId`, `ProposalNumber`, `Round`, `Proposal`, `Message`, `PaxosError` |
//! | [`codec`] | `WireFormat` single-line encoding and `DecodeError` |
//! | [`state`] | `PaxosState` snapshot and `ProposerPhase` |
//! | [`storage`] | `StateStore` trait, in-memory and file-backed stores |
//! | [`config`] | Node list parsing and `ClusterConfig` |
//! | [`quorum`] | Weighted-quorum arithmetic |
//! | [`outbox`] | `Outbox` send capability and `MemoryOutbox` |
//! | [`node`] | `PaxosNode`: the consensus engine |
//! | [`runtime`] | TCP transport, node runtime and demo application loop |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod codec;
pub mod config;
pub mod node;
pub mod outbox;
pub mod quorum;
pub mod runtime;
pub mod state;
pub mod storage;
pub mod types;

// Re-export key types at crate root for convenience
pub use codec::{DecodeError, WireFormat};
pub use config::{ClusterConfig, ConfigError, NodeSpec};
pub use node::{ChosenListener, PaxosNode};
pub use outbox::{Envelope, MemoryOutbox, Outbox};
pub use state::{PaxosState, ProposerPhase};
pub use storage::{FileStateStore, InMemoryStateStore, StateStore};
pub use types::{Message, MessageType, NodeId, PaxosError, Proposal, ProposalNumber, Round};
