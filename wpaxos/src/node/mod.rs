//! The consensus engine.
//!
//! A [`PaxosNode`] runs all three Paxos roles for one process:
//!
//! - **Proposer** ([`proposer`]): drives prepare and accept phases for the
//!   value the application wants chosen. Only distinguished proposers are
//!   expected to call [`PaxosNode::start_round`], but nothing stops others.
//! - **Acceptor** ([`acceptor`]): answers prepare and accept requests. Runs on
//!   every node.
//! - **Learner** ([`learner`]): tallies accept notifications and detects the
//!   chosen value. Active only on distinguished learners, though every node
//!   records the chosen values it is told about.
//!
//! ## Execution model
//!
//! The engine is a synchronous state machine. The host delivers one inbound
//! [`Message`] at a time to [`PaxosNode::handle`] and holds exclusive access
//! (`&mut self`) for the whole call. Each handler mutates [`PaxosState`],
//! saves it through the [`StateStore`], and only then hands outgoing messages
//! to the [`Outbox`]. After a crash the node therefore never appears to have
//! sent a message its recovered state cannot justify.
//!
//! ```text
//!   transport ──► handle(msg) ──► mutate state ──► store.save ──► outbox.send
//!   app ───────► start_round ──┘
//! ```
//!
//! ## Errors
//!
//! Stale responses, old rounds and malformed embedded payloads are absorbed
//! and logged. Storage failures and conflicting chosen values are returned
//! to the caller.

mod acceptor;
mod learner;
mod proposer;

use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::config::ClusterConfig;
use crate::outbox::Outbox;
use crate::state::PaxosState;
use crate::storage::StateStore;
use crate::types::{Message, MessageType, NodeId, PaxosError, Round};

/// Callback invoked when a chosen value is first recorded for a round.
pub type ChosenListener = Box<dyn FnMut(Round, &str)>;

/// One node's Paxos engine.
pub struct PaxosNode<S: StateStore, O: Outbox> {
    id: NodeId,
    weights: Vec<f64>,
    acceptors: Vec<NodeId>,
    learners: Vec<NodeId>,
    distinguished_proposer: bool,
    distinguished_learner: bool,
    state: PaxosState,
    store: S,
    outbox: O,
    chosen_listener: Option<ChosenListener>,
}

impl<S: StateStore, O: Outbox> PaxosNode<S, O> {
    /// Start a node that has never run, saving its fresh state.
    pub fn new(
        id: NodeId,
        config: &ClusterConfig,
        store: S,
        outbox: O,
    ) -> Result<Self, PaxosError> {
        let mut node = Self::with_state(id, config, PaxosState::fresh(id), store, outbox)?;
        if node.distinguished_learner {
            node.learner_init();
        }
        node.persist()?;
        info!(
            node = %id,
            proposer = node.distinguished_proposer,
            learner = node.distinguished_learner,
            "paxos node created"
        );
        Ok(node)
    }

    /// Restart a node from the snapshot held by `store`.
    pub fn recover(
        id: NodeId,
        config: &ClusterConfig,
        store: S,
        outbox: O,
    ) -> Result<Self, PaxosError> {
        let state = store.load()?.ok_or(PaxosError::NoSnapshot)?;
        if state.id != id {
            return Err(PaxosError::SnapshotMismatch {
                expected: id,
                found: state.id,
            });
        }

        let mut node = Self::with_state(id, config, state, store, outbox)?;
        if node.distinguished_learner && node.state.accepted_proposals.len() != node.node_count() {
            warn!(
                node = %id,
                slots = node.state.accepted_proposals.len(),
                "learner report table does not match cluster size, resetting it"
            );
            node.learner_init();
            node.persist()?;
        }
        info!(
            node = %id,
            round = %node.state.current_round,
            phase = %node.state.phase,
            chosen = node.state.chosen_values.len(),
            "paxos node recovered"
        );
        Ok(node)
    }

    fn with_state(
        id: NodeId,
        config: &ClusterConfig,
        state: PaxosState,
        store: S,
        outbox: O,
    ) -> Result<Self, PaxosError> {
        if id.index() >= config.node_count() {
            return Err(PaxosError::UnknownNode {
                id,
                node_count: config.node_count(),
            });
        }
        Ok(Self {
            id,
            weights: config.weights(),
            acceptors: config.acceptor_set(id),
            learners: config.distinguished_learners(),
            distinguished_proposer: config.is_distinguished_proposer(id),
            distinguished_learner: config.is_distinguished_learner(id),
            state,
            store,
            outbox,
            chosen_listener: None,
        })
    }

    // =========================================================================
    // Application-facing operations
    // =========================================================================

    /// Dispatch one inbound message.
    ///
    /// Messages from ids outside the cluster and handshake frames are
    /// ignored.
    pub fn handle(&mut self, msg: Message) -> Result<(), PaxosError> {
        let started = Instant::now();
        if msg.id.index() >= self.node_count() {
            warn!(from = %msg.id, kind = ?msg.kind, "message from unknown node, ignoring");
            return Ok(());
        }

        let result = match msg.kind {
            MessageType::Init | MessageType::Ack => {
                debug!(from = %msg.id, kind = ?msg.kind, "handshake frame reached the engine, ignoring");
                Ok(())
            }
            MessageType::PrepareRequest => self.receive_prepare_request(&msg),
            MessageType::PrepareResponse => self.receive_prepare_response(&msg),
            MessageType::AcceptRequest => self.receive_accept_request(&msg),
            MessageType::AcceptNotification => self.receive_accept_notification(&msg),
            MessageType::Nack => self.receive_nack(&msg),
            MessageType::NackOldRound => self.receive_nack_old_round(&msg),
            MessageType::ChosenValue => self.receive_chosen_value(&msg),
        };

        trace!(
            kind = ?msg.kind,
            from = %msg.id,
            elapsed_us = started.elapsed().as_micros() as u64,
            "handled message"
        );
        result
    }

    /// Begin a new attempt to get `value` chosen in the current round.
    ///
    /// Abandons any attempt already in flight.
    pub fn start_round(&mut self, value: impl Into<String>) -> Result<(), PaxosError> {
        let value = value.into();
        info!(node = %self.id, round = %self.state.current_round, value = %value, "starting round");
        self.reset(value)?;
        self.send_prepare_request()
    }

    /// Set the preferred value and clear the learner's report table.
    pub fn reset(&mut self, value: impl Into<String>) -> Result<(), PaxosError> {
        let value = value.into();
        debug!(node = %self.id, value = %value, "resetting preferred value");
        self.state.my_value = Some(value);
        if self.distinguished_learner {
            self.learner_init();
        }
        self.persist()
    }

    /// Register the sink for chosen values, replacing any previous one.
    pub fn set_chosen_listener(&mut self, listener: ChosenListener) {
        self.chosen_listener = Some(listener);
    }

    /// The chosen value for `round`, if known.
    pub fn chosen_value(&self, round: Round) -> Option<&str> {
        self.state.chosen_values.get(&round).map(String::as_str)
    }

    /// The chosen value for the round before the current one.
    pub fn latest_chosen_value(&self) -> Option<&str> {
        let previous = self.state.current_round.0.checked_sub(1)?;
        self.chosen_value(Round::new(previous))
    }

    /// The round this node is working on.
    pub fn current_round(&self) -> Round {
        self.state.current_round
    }

    /// Whether this node is configured as a distinguished proposer.
    pub fn is_distinguished_proposer(&self) -> bool {
        self.distinguished_proposer
    }

    /// Whether this node is configured as a distinguished learner.
    pub fn is_distinguished_learner(&self) -> bool {
        self.distinguished_learner
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Cluster size (`Nprocs`).
    pub fn node_count(&self) -> usize {
        self.weights.len()
    }

    /// The acceptors this node's proposer contacts.
    pub fn acceptor_set(&self) -> &[NodeId] {
        &self.acceptors
    }

    /// Read-only view of the current state.
    pub fn state(&self) -> &PaxosState {
        &self.state
    }

    /// The snapshot store.
    pub fn store(&self) -> &S {
        &self.store
    }

    // =========================================================================
    // Shared plumbing
    // =========================================================================

    fn weight_of(&self, id: NodeId) -> f64 {
        self.weights.get(id.index()).copied().unwrap_or(0.0)
    }

    fn persist(&mut self) -> Result<(), PaxosError> {
        let started = Instant::now();
        self.store.save(&self.state).inspect_err(|e| {
            tracing::error!(node = %self.id, error = %e, "failed to persist state");
        })?;
        trace!(
            node = %self.id,
            elapsed_us = started.elapsed().as_micros() as u64,
            "state persisted"
        );
        Ok(())
    }

    fn send(&self, to: NodeId, message: Message) {
        debug!(to = %to, message = %message, "send");
        self.outbox.send(to, message);
    }

    fn send_to_all(&self, targets: &[NodeId], message: &Message) {
        for &to in targets {
            self.send(to, message.clone());
        }
    }
}

impl<S: StateStore, O: Outbox> std::fmt::Debug for PaxosNode<S, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaxosNode")
            .field("id", &self.id)
            .field("round", &self.state.current_round)
            .field("phase", &self.state.phase)
            .field("proposer", &self.distinguished_proposer)
            .field("learner", &self.distinguished_learner)
            .finish_non_exhaustive()
    }
}
