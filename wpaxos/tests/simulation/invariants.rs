//! Safety checks over a [`SimCluster`].
//!
//! 1. **Agreement**: no two nodes hold different chosen values for a round,
//!    and no listener ever reported two values for a round.
//! 2. **Proposal lineage**: every PREPARE_REQUEST number sent by node `i` is
//!    congruent to `i` modulo `N`, never goes backwards, and is never sent
//!    twice to the same acceptor.
//! 3. **No violations**: no node returned an error.

use std::collections::{BTreeMap, HashMap, HashSet};

use wpaxos::{MessageType, NodeId, Round};

use super::harness::SimCluster;

pub fn assert_agreement(cluster: &SimCluster) {
    let mut decided: BTreeMap<Round, (NodeId, String)> = BTreeMap::new();
    for node in cluster.up_nodes() {
        for (round, value) in &node.state().chosen_values {
            match decided.get(round) {
                Some((first, existing)) => assert_eq!(
                    existing,
                    value,
                    "{first} and {} disagree on {round}",
                    node.id()
                ),
                None => {
                    decided.insert(*round, (node.id(), value.clone()));
                }
            }
        }
    }

    let mut reported: BTreeMap<Round, String> = BTreeMap::new();
    for event in cluster.chosen_events() {
        let existing = reported
            .entry(event.round)
            .or_insert_with(|| event.value.clone());
        assert_eq!(
            existing, &event.value,
            "{} was told a second value for {}",
            event.node, event.round
        );
    }
    for (round, (_, value)) in &decided {
        if let Some(told) = reported.get(round) {
            assert_eq!(told, value, "stored and reported values differ for {round}");
        }
    }
}

pub fn assert_proposal_lineage(cluster: &mut SimCluster) {
    let n = cluster.config().node_count() as u64;
    let mut last: HashMap<NodeId, u64> = HashMap::new();
    let mut seen: HashSet<(NodeId, u64, NodeId)> = HashSet::new();
    for env in cluster.sent() {
        if env.message.kind != MessageType::PrepareRequest {
            continue;
        }
        let from = env.message.id;
        let number = env.message.number;
        assert_eq!(number % n, from.index() as u64, "{from} sent foreign number {number}");
        if let Some(&previous) = last.get(&from) {
            assert!(number >= previous, "{from} rewound: {previous} then {number}");
        }
        assert!(
            seen.insert((from, number, env.to)),
            "{from} sent {number} to {} twice",
            env.to
        );
        last.insert(from, number);
    }
}

pub fn assert_no_errors(cluster: &SimCluster) {
    assert!(
        cluster.errors().is_empty(),
        "engine errors: {:?}",
        cluster.errors()
    );
}
