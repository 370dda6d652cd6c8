//! Learner role and chosen-value bookkeeping.
//!
//! A distinguished learner keeps the latest proposal each acceptor reported
//! accepting. When the reports for the current round contain a value backed
//! by a weighted quorum, that value is chosen: it is recorded, the local
//! proposer and acceptor state for the round is cleared, and every node is
//! told with a CHOSEN_VALUE broadcast.
//!
//! Every node, learner or not, records the chosen values it is told about.
//! A report that contradicts an already recorded value is a safety violation;
//! it is logged at error level and returned, and the stored value is kept.

use tracing::{debug, error, info, warn};

use super::PaxosNode;
use crate::codec::WireFormat;
use crate::outbox::Outbox;
use crate::quorum::find_chosen;
use crate::state::ProposerPhase;
use crate::storage::StateStore;
use crate::types::{Message, NodeId, PaxosError, Proposal, Round};

impl<S: StateStore, O: Outbox> PaxosNode<S, O> {
    /// Allocate an empty report slot per acceptor.
    pub(super) fn learner_init(&mut self) {
        self.state.accepted_proposals = vec![None; self.node_count()];
    }

    pub(super) fn receive_accept_notification(&mut self, msg: &Message) -> Result<(), PaxosError> {
        if !self.distinguished_learner {
            debug!(node = %self.id, from = %msg.id, "accept notification on a non-learner, ignoring");
            return Ok(());
        }
        let proposal = match Proposal::decode(&msg.value) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!(node = %self.id, from = %msg.id, error = %e, "malformed accept notification, ignoring");
                return Ok(());
            }
        };

        let round = proposal.round;
        let Some(slot) = self.state.accepted_proposals.get_mut(msg.id.index()) else {
            warn!(node = %self.id, from = %msg.id, "no report slot for sender, ignoring");
            return Ok(());
        };
        debug!(node = %self.id, from = %msg.id, proposal = %proposal, "acceptance reported");
        *slot = Some(proposal);
        self.persist()?;

        if round != self.state.current_round {
            return Ok(());
        }
        let chosen = find_chosen(&self.state.accepted_proposals, &self.weights, round)
            .map(str::to_string);
        if let Some(value) = chosen
            && self.record_chosen(round, &value, self.id)?
        {
            let broadcast = Message::chosen_value(round, value, self.id);
            let everyone: Vec<NodeId> = (0..self.node_count()).map(NodeId::new).collect();
            self.send_to_all(&everyone, &broadcast);
        }
        Ok(())
    }

    pub(super) fn receive_chosen_value(&mut self, msg: &Message) -> Result<(), PaxosError> {
        let round = Round::new(msg.number);
        self.record_chosen(round, &msg.value, msg.id)?;
        Ok(())
    }

    /// Record `value` as chosen for `round`.
    ///
    /// Returns `Ok(true)` when the value is new, `Ok(false)` for a repeat of
    /// the stored value, and an error when it contradicts the stored value.
    pub(super) fn record_chosen(
        &mut self,
        round: Round,
        value: &str,
        from: NodeId,
    ) -> Result<bool, PaxosError> {
        let Some(successor) = round.checked_next() else {
            warn!(node = %self.id, round = %round, from = %from, "chosen round has no successor, ignoring");
            return Ok(false);
        };
        if let Some(stored) = self.state.chosen_values.get(&round) {
            if stored == value {
                debug!(node = %self.id, round = %round, from = %from, "chosen value confirmed");
                return Ok(false);
            }
            error!(
                node = %self.id,
                round = %round,
                from = %from,
                stored = %stored,
                reported = %value,
                "SAFETY VIOLATION: conflicting chosen value"
            );
            return Err(PaxosError::ConflictingChosenValue {
                round,
                stored: stored.clone(),
                reported: value.to_string(),
                from,
            });
        }

        self.state.chosen_values.insert(round, value.to_string());
        // A newer round's proposals are still live; keep them.
        if self
            .state
            .accepted_proposal
            .as_ref()
            .is_some_and(|p| p.round <= round)
        {
            self.state.accepted_proposal = None;
        }
        if self
            .state
            .received_proposal
            .as_ref()
            .is_some_and(|p| p.round <= round)
        {
            self.state.received_proposal = None;
        }
        if round >= self.state.current_round {
            self.state.current_round = successor;
            self.state.phase = ProposerPhase::Idle;
        }
        self.persist()?;

        info!(node = %self.id, round = %round, value = %value, from = %from, "value chosen");
        if let Some(listener) = self.chosen_listener.as_mut() {
            listener(round, value);
        }
        Ok(true)
    }
}
