//! Weighted-quorum arithmetic.
//!
//! Every acceptor carries a configured weight and weights are expected to sum
//! to one. A set of acceptors is a quorum when its weights sum to strictly
//! more than one half.

use std::collections::HashMap;

use crate::types::{Proposal, Round};

/// The threshold a weight sum must strictly exceed.
pub const QUORUM_THRESHOLD: f64 = 0.5;

/// Whether `weight` is a quorum.
pub fn is_quorum(weight: f64) -> bool {
    weight > QUORUM_THRESHOLD
}

/// Scan learner reports for a value accepted by a weighted quorum in `round`.
///
/// `accepted[i]` is the latest proposal acceptor `i` reported and `weights[i]`
/// its weight. Reports for other rounds are skipped. Slots are visited in id
/// order and the first value whose accumulated weight crosses the threshold
/// wins; under Paxos safety at most one value can.
pub fn find_chosen<'a>(
    accepted: &'a [Option<Proposal>],
    weights: &[f64],
    round: Round,
) -> Option<&'a str> {
    let mut tally: HashMap<&str, f64> = HashMap::new();
    for (proposal, weight) in accepted.iter().zip(weights) {
        let Some(proposal) = proposal else {
            continue;
        };
        if proposal.round != round {
            continue;
        }
        let sum = tally.entry(proposal.value.as_str()).or_insert(0.0);
        *sum += weight;
        if is_quorum(*sum) {
            return Some(proposal.value.as_str());
        }
    }
    None
}
