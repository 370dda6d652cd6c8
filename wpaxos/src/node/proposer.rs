//! Proposer role.
//!
//! ```text
//! Idle ──start_round──► PrepareSent ──promise quorum──► AcceptSent
//!   ▲                      │   ▲                            │
//!   │                      │   └────── NACK quorum ─────────┤
//!   │                      └── NACK_OLDROUND (newer round) ─┤
//!   └──────────────── chosen value recorded ────────────────┘
//! ```
//!
//! Each attempt uses a fresh proposal number from this node's lineage
//! (`id`, `id + N`, `id + 2N`, ...). Promises are tallied only for the
//! outstanding number while the prepare phase is open; anything else is
//! stale and dropped. Refusals are tallied in every phase, and a newer round
//! reported by an acceptor always restarts the prepare phase there.
//!
//! The value pushed in phase 2a defers to the highest-numbered proposal any
//! acceptor reported, whatever round it was accepted in.

use tracing::{debug, info, warn};

use super::PaxosNode;
use crate::outbox::Outbox;
use crate::quorum::is_quorum;
use crate::state::ProposerPhase;
use crate::storage::StateStore;
use crate::types::{Message, PaxosError, Proposal, ProposalNumber, Round};

impl<S: StateStore, O: Outbox> PaxosNode<S, O> {
    /// Phase 1a: allocate the next proposal number and ask the acceptor set
    /// to promise it.
    pub(crate) fn send_prepare_request(&mut self) -> Result<(), PaxosError> {
        self.state.reset_tallies();
        let number = match self.state.last_proposal_number {
            None => ProposalNumber::first_for(self.id),
            Some(last) => last.successor(self.node_count()),
        };
        self.state.last_proposal_number = Some(number);
        self.state.phase = ProposerPhase::PrepareSent;
        self.persist()?;

        let round = self.state.current_round;
        debug!(node = %self.id, round = %round, number = %number, "sending prepare request");
        let msg = Message::prepare_request(round, number, self.id);
        self.send_to_all(&self.acceptors, &msg);
        Ok(())
    }

    /// Phase 1b: tally a promise for the outstanding number.
    pub(super) fn receive_prepare_response(&mut self, msg: &Message) -> Result<(), PaxosError> {
        let outstanding = self.state.last_proposal_number;
        if self.state.phase != ProposerPhase::PrepareSent
            || outstanding != Some(ProposalNumber::new(msg.number))
        {
            debug!(
                node = %self.id,
                from = %msg.id,
                number = msg.number,
                phase = %self.state.phase,
                "stale prepare response, ignoring"
            );
            return Ok(());
        }

        self.adopt_reported(Proposal::from_embedded(&msg.value));
        self.state.prepare_response_sum += self.weight_of(msg.id);
        self.persist()?;

        debug!(
            node = %self.id,
            from = %msg.id,
            sum = self.state.prepare_response_sum,
            "prepare response tallied"
        );
        if is_quorum(self.state.prepare_response_sum) {
            self.send_accept_request()?;
        }
        Ok(())
    }

    /// Phase 2a: push a value under the promised number.
    ///
    /// The value is the highest-numbered proposal any promise or refusal
    /// reported, if there was one; otherwise this node's own value.
    pub(crate) fn send_accept_request(&mut self) -> Result<(), PaxosError> {
        self.state.reset_tallies();
        self.state.phase = ProposerPhase::AcceptSent;
        self.persist()?;

        let round = self.state.current_round;
        let value = match &self.state.received_proposal {
            Some(received) => received.value.clone(),
            None => self.state.my_value.clone().unwrap_or_default(),
        };
        let number = self
            .state
            .last_proposal_number
            .unwrap_or(ProposalNumber::first_for(self.id));
        let proposal = Proposal::new(number, round, value);

        info!(node = %self.id, proposal = %proposal, "sending accept request");
        let msg = Message::accept_request(&proposal, self.id);
        self.send_to_all(&self.acceptors, &msg);
        Ok(())
    }

    /// A too-low number: ratchet on the reported proposal and restart the
    /// prepare phase once a quorum has refused.
    pub(super) fn receive_nack(&mut self, msg: &Message) -> Result<(), PaxosError> {
        self.adopt_reported(Proposal::from_embedded(&msg.value));
        self.state.nack_sum += self.weight_of(msg.id);
        self.persist()?;

        debug!(
            node = %self.id,
            from = %msg.id,
            promised = msg.number,
            sum = self.state.nack_sum,
            "nack tallied"
        );
        if is_quorum(self.state.nack_sum) {
            info!(node = %self.id, round = %self.state.current_round, "quorum refused, restarting prepare");
            self.send_prepare_request()?;
        }
        Ok(())
    }

    /// A too-old round: adopt the newer round and retry there.
    pub(super) fn receive_nack_old_round(&mut self, msg: &Message) -> Result<(), PaxosError> {
        let reported = match Round::parse(&msg.value) {
            Ok(round) => round,
            Err(e) => {
                warn!(node = %self.id, from = %msg.id, error = %e, "malformed old-round nack, ignoring");
                return Ok(());
            }
        };
        if reported <= self.state.current_round {
            debug!(
                node = %self.id,
                from = %msg.id,
                reported = %reported,
                current = %self.state.current_round,
                "stale old-round nack, ignoring"
            );
            return Ok(());
        }

        info!(node = %self.id, from = %msg.id, round = %reported, "adopting newer round");
        self.state.current_round = reported;
        self.persist()?;
        self.send_prepare_request()
    }

    /// Ratchet `received_proposal` on a reported proposal, by number only.
    fn adopt_reported(&mut self, reported: Option<Proposal>) {
        if self.state.ratchet_received(reported) {
            debug!(
                node = %self.id,
                received = ?self.state.received_proposal,
                "adopted reported proposal"
            );
        }
    }
}
