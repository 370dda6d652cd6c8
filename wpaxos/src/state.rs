//! The persistent state of one node.
//!
//! A [`PaxosState`] is the whole durable footprint of a node: proposer
//! bookkeeping, acceptor promises, learner tallies and the chosen-value
//! history. It is written as a single snapshot after every change that a
//! later outgoing message depends on, and reloaded verbatim on restart.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::WireFormat;
use crate::types::{NodeId, Proposal, ProposalNumber, Round};

/// Where the proposer is within the current attempt.
///
/// Responses that arrive while the proposer is in a different phase belong
/// to an attempt it has already moved past, and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProposerPhase {
    /// No attempt in flight.
    #[default]
    Idle,
    /// PREPARE_REQUEST sent for `last_proposal_number`.
    PrepareSent,
    /// ACCEPT_REQUEST sent for `last_proposal_number`.
    AcceptSent,
}

impl std::fmt::Display for ProposerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposerPhase::Idle => write!(f, "idle"),
            ProposerPhase::PrepareSent => write!(f, "prepare-sent"),
            ProposerPhase::AcceptSent => write!(f, "accept-sent"),
        }
    }
}

/// Durable state of one node.
///
/// `None` stands for "no number yet" in every proposal-number field, and
/// `Option` ordering (`None < Some(_)`) gives the comparisons the protocol
/// needs: any real number beats an empty promise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaxosState {
    /// The node this snapshot belongs to.
    pub id: NodeId,

    // ---- proposer ----
    /// The last proposal number this node issued.
    pub last_proposal_number: Option<ProposalNumber>,
    /// Weight of PREPARE_RESPONSEs received for the current attempt.
    pub prepare_response_sum: f64,
    /// Weight of NACKs received for the current attempt.
    pub nack_sum: f64,
    /// Highest-numbered accepted proposal reported back during phase 1.
    pub received_proposal: Option<Proposal>,
    /// The round this node is working on.
    pub current_round: Round,
    /// The value the application asked to propose.
    pub my_value: Option<String>,
    /// Which phase of the current attempt is in flight.
    pub phase: ProposerPhase,

    // ---- acceptor ----
    /// Highest number promised.
    pub promise_number: Option<ProposalNumber>,
    /// Last accepted proposal.
    pub accepted_proposal: Option<Proposal>,

    // ---- learner ----
    /// Latest ACCEPT_NOTIFICATION per acceptor, indexed by node id. Empty
    /// unless this node is a distinguished learner.
    pub accepted_proposals: Vec<Option<Proposal>>,
    /// Chosen value per round.
    pub chosen_values: BTreeMap<Round, String>,
}

impl PaxosState {
    /// The state of a node that has never run.
    pub fn fresh(id: NodeId) -> Self {
        Self {
            id,
            last_proposal_number: None,
            prepare_response_sum: 0.0,
            nack_sum: 0.0,
            received_proposal: None,
            current_round: Round::ZERO,
            my_value: None,
            phase: ProposerPhase::Idle,
            promise_number: None,
            accepted_proposal: None,
            accepted_proposals: Vec::new(),
            chosen_values: BTreeMap::new(),
        }
    }

    /// Keep `candidate` as the received proposal if it outranks the current one.
    ///
    /// Returns `true` when the received proposal changed.
    pub fn ratchet_received(&mut self, candidate: Option<Proposal>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        let outranks = match &self.received_proposal {
            None => true,
            Some(current) => candidate.number > current.number,
        };
        if outranks {
            self.received_proposal = Some(candidate);
        }
        outranks
    }

    /// Zero both response tallies ahead of a new send.
    pub fn reset_tallies(&mut self) {
        self.prepare_response_sum = 0.0;
        self.nack_sum = 0.0;
    }

    /// The chosen value with the greatest round, if any.
    pub fn latest_chosen(&self) -> Option<(Round, &str)> {
        self.chosen_values
            .iter()
            .next_back()
            .map(|(round, value)| (*round, value.as_str()))
    }
}

impl WireFormat for PaxosState {}
