//! Acceptor role, active on every node.
//!
//! ## Key invariant
//!
//! An acceptor never promises a number at or below one it already promised,
//! and never accepts a proposal numbered below its promise. `promise_number`
//! only grows.
//!
//! | Request | Condition | Effect | Reply |
//! |---|---|---|---|
//! | PREPARE(r, n) | `r < current_round` | none | NACK_OLDROUND(current_round) |
//! | PREPARE(r, n) | `n > promise` | promise `n` | PREPARE_RESPONSE(accepted, n) |
//! | PREPARE(r, n) | otherwise | none | NACK(accepted, promise) |
//! | ACCEPT(p) | `p.round < current_round` | none | NACK_OLDROUND(current_round) |
//! | ACCEPT(p) | `p.number >= promise` | accept `p` | ACCEPT_NOTIFICATION(p) to learners |
//! | ACCEPT(p) | otherwise | none | NACK(accepted, promise) |

use tracing::{debug, warn};

use super::PaxosNode;
use crate::codec::WireFormat;
use crate::outbox::Outbox;
use crate::storage::StateStore;
use crate::types::{Message, PaxosError, Proposal, ProposalNumber, Round};

impl<S: StateStore, O: Outbox> PaxosNode<S, O> {
    pub(super) fn receive_prepare_request(&mut self, msg: &Message) -> Result<(), PaxosError> {
        let round = match Round::parse(&msg.value) {
            Ok(round) => round,
            Err(e) => {
                warn!(node = %self.id, from = %msg.id, error = %e, "malformed prepare request, ignoring");
                return Ok(());
            }
        };

        if round < self.state.current_round {
            debug!(
                node = %self.id,
                from = %msg.id,
                round = %round,
                current = %self.state.current_round,
                "prepare for old round"
            );
            let reply = Message::nack_old_round(self.state.current_round, msg.number, self.id);
            self.send(msg.id, reply);
            return Ok(());
        }

        let number = ProposalNumber::new(msg.number);
        if Some(number) > self.state.promise_number {
            self.state.promise_number = Some(number);
            self.persist()?;
            debug!(node = %self.id, from = %msg.id, number = %number, "promised");
            let reply =
                Message::prepare_response(self.state.accepted_proposal.as_ref(), number, self.id);
            self.send(msg.id, reply);
        } else {
            self.send_nack(msg);
        }
        Ok(())
    }

    pub(super) fn receive_accept_request(&mut self, msg: &Message) -> Result<(), PaxosError> {
        let proposal = match Proposal::decode(&msg.value) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!(node = %self.id, from = %msg.id, error = %e, "malformed accept request, ignoring");
                return Ok(());
            }
        };

        if proposal.round < self.state.current_round {
            debug!(
                node = %self.id,
                from = %msg.id,
                proposal = %proposal,
                current = %self.state.current_round,
                "accept for old round"
            );
            let reply = Message::nack_old_round(self.state.current_round, msg.number, self.id);
            self.send(msg.id, reply);
            return Ok(());
        }

        if Some(proposal.number) >= self.state.promise_number {
            debug!(node = %self.id, from = %msg.id, proposal = %proposal, "accepted");
            let notification = Message::accept_notification(&proposal, self.id);
            self.state.accepted_proposal = Some(proposal);
            self.persist()?;
            self.send_to_all(&self.learners, &notification);
        } else {
            self.send_nack(msg);
        }
        Ok(())
    }

    fn send_nack(&self, msg: &Message) {
        let promised = self.state.promise_number.unwrap_or_default();
        debug!(
            node = %self.id,
            from = %msg.id,
            number = msg.number,
            promised = %promised,
            "refusing"
        );
        let reply = Message::nack(self.state.accepted_proposal.as_ref(), promised, self.id);
        self.send(msg.id, reply);
    }
}
