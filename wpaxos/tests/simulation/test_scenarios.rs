//! Hand-driven protocol scenarios.

use wpaxos::{
    ClusterConfig, InMemoryStateStore, MemoryOutbox, MessageType, NodeId, PaxosError, PaxosNode,
    PaxosState, Proposal, ProposalNumber, ProposerPhase, Round, WireFormat,
};

use super::harness::{SimCluster, SimNode};
use super::invariants::{assert_agreement, assert_no_errors, assert_proposal_lineage};

/// Recover node `id` of `uniform(n)` from a hand-built snapshot.
fn node_from(state: PaxosState, n: usize) -> (SimNode, MemoryOutbox) {
    let outbox = MemoryOutbox::new();
    let id = state.id;
    let node = PaxosNode::recover(
        id,
        &ClusterConfig::uniform(n),
        InMemoryStateStore::with_snapshot(&state),
        outbox.clone(),
    )
    .expect("recover");
    (node, outbox)
}

#[test]
fn test_prepare_quorum_issues_accept_with_own_value() {
    let mut cluster = SimCluster::uniform(3);
    cluster.start_round(0, "A");
    assert_eq!(cluster.in_flight(), 2);

    // Both prepares, then the first response.
    assert!(cluster.deliver_next());
    assert!(cluster.deliver_next());
    assert!(cluster.deliver_next());
    let proposer = cluster.node(0).state();
    assert!((proposer.prepare_response_sum - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(proposer.phase, ProposerPhase::PrepareSent);

    assert!(cluster.deliver_next());
    assert_eq!(cluster.node(0).state().phase, ProposerPhase::AcceptSent);

    let accepts: Vec<_> = cluster
        .sent()
        .iter()
        .filter(|env| env.message.kind == MessageType::AcceptRequest)
        .cloned()
        .collect();
    assert_eq!(accepts.len(), 2);
    for env in accepts {
        let proposal = Proposal::decode(&env.message.value).expect("decode");
        assert_eq!(proposal, Proposal::new(ProposalNumber::new(0), Round::ZERO, "A"));
    }
}

#[test]
fn test_stale_round_prepare_rejected() {
    let mut state = PaxosState::fresh(NodeId::new(1));
    state.current_round = Round::new(5);
    state.promise_number = Some(ProposalNumber::new(7));
    let (mut acceptor, outbox) = node_from(state, 3);

    acceptor
        .handle(wpaxos::Message::prepare_request(
            Round::new(3),
            ProposalNumber::new(9),
            NodeId::new(0),
        ))
        .expect("handle");

    let sent = outbox.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, NodeId::new(0));
    assert_eq!(sent[0].message.kind, MessageType::NackOldRound);
    assert_eq!(Round::parse(&sent[0].message.value).expect("round"), Round::new(5));
    assert_eq!(acceptor.state().promise_number, Some(ProposalNumber::new(7)));
}

#[test]
fn test_learner_quorum_chooses_and_advances() {
    let report = Proposal::new(ProposalNumber::new(7), Round::new(2), "X");
    let mut state = PaxosState::fresh(NodeId::new(0));
    state.current_round = Round::new(2);
    state.accepted_proposals = vec![None; 3];
    state.accepted_proposal = Some(report.clone());
    state.received_proposal = Some(report.clone());
    let (mut learner, outbox) = node_from(state, 3);

    learner
        .handle(wpaxos::Message::accept_notification(&report, NodeId::new(0)))
        .expect("first report");
    assert!(learner.chosen_value(Round::new(2)).is_none());
    assert!(outbox.is_empty());

    learner
        .handle(wpaxos::Message::accept_notification(&report, NodeId::new(1)))
        .expect("second report");
    assert_eq!(learner.chosen_value(Round::new(2)), Some("X"));
    assert!(learner.state().accepted_proposal.is_none());
    assert!(learner.state().received_proposal.is_none());
    assert_eq!(learner.current_round(), Round::new(3));

    let broadcast = outbox.drain();
    assert_eq!(broadcast.len(), 3);
    assert!(broadcast.iter().all(|env| env.message.kind == MessageType::ChosenValue
        && env.message.number == 2
        && env.message.value == "X"));

    learner
        .handle(wpaxos::Message::accept_notification(&report, NodeId::new(2)))
        .expect("third report");
    assert!(outbox.is_empty());
    assert_eq!(learner.current_round(), Round::new(3));
}

#[test]
fn test_conflicting_chosen_value_is_flagged() {
    let mut state = PaxosState::fresh(NodeId::new(2));
    state.current_round = Round::new(5);
    state.accepted_proposals = vec![None; 3];
    state.chosen_values.insert(Round::new(4), "A".to_string());
    let (mut learner, _) = node_from(state, 3);

    let err = learner
        .handle(wpaxos::Message::chosen_value(Round::new(4), "B", NodeId::new(1)))
        .expect_err("conflict");
    match err {
        PaxosError::ConflictingChosenValue {
            round,
            stored,
            reported,
            from,
        } => {
            assert_eq!(round, Round::new(4));
            assert_eq!(stored, "A");
            assert_eq!(reported, "B");
            assert_eq!(from, NodeId::new(1));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(learner.chosen_value(Round::new(4)), Some("A"));
}

#[test]
fn test_full_round_reaches_every_node() {
    let mut cluster = SimCluster::uniform(3);
    cluster.start_round(0, "A");
    cluster.run_until_quiet(1_000);

    for node in cluster.up_nodes() {
        assert_eq!(node.chosen_value(Round::ZERO), Some("A"), "{}", node.id());
        assert_eq!(node.current_round(), Round::new(1));
    }
    assert_eq!(cluster.node(0).state().phase, ProposerPhase::Idle);
    assert_no_errors(&cluster);
    assert_agreement(&cluster);
}

#[test]
fn test_consecutive_rounds() {
    let mut cluster = SimCluster::uniform(5);
    for round in 0..4u64 {
        cluster.start_round(0, &format!("v{round}"));
        cluster.run_until_quiet(1_000);
        assert_eq!(cluster.node(3).chosen_value(Round::new(round)), Some(format!("v{round}").as_str()));
    }
    assert_eq!(cluster.node(4).current_round(), Round::new(4));
    assert_eq!(cluster.node(0).state().latest_chosen(), Some((Round::new(3), "v3")));
    assert_no_errors(&cluster);
    assert_proposal_lineage(&mut cluster);
}

#[test]
fn test_heavy_acceptor_alone_is_a_quorum() {
    let config = ClusterConfig::uniform(3).with_weights([0.1, 0.1, 0.8]);
    let mut cluster = SimCluster::new(config);
    cluster.start_round(0, "A");
    cluster.run_until_quiet(1_000);

    for node in cluster.up_nodes() {
        assert_eq!(node.chosen_value(Round::ZERO), Some("A"));
    }
    assert_no_errors(&cluster);
}

#[test]
fn test_light_window_never_reaches_quorum() {
    let config = ClusterConfig::uniform(3).with_weights([0.6, 0.2, 0.2]);
    let mut cluster = SimCluster::new(config);
    cluster.start_round(0, "A");
    cluster.run_until_quiet(1_000);

    assert_eq!(cluster.node(0).state().phase, ProposerPhase::PrepareSent);
    assert!(cluster.chosen_events().is_empty());
    assert!(
        !cluster
            .sent()
            .iter()
            .any(|env| env.message.kind == MessageType::AcceptRequest)
    );
}

#[test]
fn test_lagging_proposer_catches_up_through_old_round_nack() {
    let mut cluster = SimCluster::uniform(5);
    cluster.crash(4);
    for round in 0..2u64 {
        cluster.start_round(0, &format!("v{round}"));
        cluster.run_until_quiet(1_000);
    }
    cluster.restart(4);
    assert_eq!(cluster.node(4).current_round(), Round::ZERO);

    cluster.start_round(4, "late");
    cluster.run_until_quiet(1_000);

    let node = cluster.node(4);
    assert_eq!(node.current_round(), Round::new(3));
    assert_eq!(node.chosen_value(Round::new(2)), Some("late"));
    assert!(node.chosen_value(Round::ZERO).is_none());
    for node in cluster.up_nodes() {
        assert_eq!(node.chosen_value(Round::new(2)), Some("late"));
    }
    assert_no_errors(&cluster);
    assert_agreement(&cluster);
    assert_proposal_lineage(&mut cluster);
}

#[test]
fn test_restarted_acceptor_keeps_its_promise() {
    let mut cluster = SimCluster::uniform(3);
    cluster.start_round(0, "A");
    // Deliver both prepares so acceptors 1 and 2 promise number 0.
    cluster.deliver_next();
    cluster.deliver_next();
    cluster.crash(1);
    cluster.restart(1);
    assert_eq!(
        cluster.node(1).state().promise_number,
        Some(ProposalNumber::new(0))
    );
}
