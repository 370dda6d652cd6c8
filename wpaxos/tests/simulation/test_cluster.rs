//! Randomized cluster runs with seeded delivery order and crashes.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use wpaxos::runtime::demo_value;
use wpaxos::{
    ClusterConfig, InMemoryStateStore, MemoryOutbox, Message, NodeId, PaxosNode, Proposal,
    ProposalNumber, Round,
};

use super::harness::SimCluster;
use super::invariants::{assert_agreement, assert_no_errors, assert_proposal_lineage};

const SEEDS: [u64; 6] = [1, 7, 42, 1234, 0xdead_beef, 0x5eed];

#[test]
fn test_proposal_numbers_unique_per_node() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut cluster = SimCluster::uniform(4);
    for attempt in 0..40 {
        let id = rng.random_range(0..4);
        cluster.start_round(id, &format!("attempt-{attempt}"));
    }
    assert_proposal_lineage(&mut cluster);

    for id in 0..4 {
        if let Some(last) = cluster.node(id).state().last_proposal_number {
            assert_eq!(last.0 % 4, id as u64);
        }
    }
}

#[test]
fn test_promise_never_decreases() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let config = ClusterConfig::uniform(5);
    let store = InMemoryStateStore::new();
    let outbox = MemoryOutbox::new();
    let id = NodeId::new(2);
    let mut acceptor =
        PaxosNode::new(id, &config, store.clone(), outbox.clone()).expect("create node");

    let mut highest: Option<ProposalNumber> = None;
    for step in 0..500 {
        let from = NodeId::new(rng.random_range(0..5));
        let number = ProposalNumber::new(rng.random_range(0..60));
        let msg = if rng.random_bool(0.5) {
            Message::prepare_request(Round::ZERO, number, from)
        } else {
            let proposal = Proposal::new(number, Round::ZERO, format!("v{step}"));
            Message::accept_request(&proposal, from)
        };
        let accepted_before = acceptor.state().accepted_proposal.clone();
        acceptor.handle(msg).expect("handle");

        let state = acceptor.state();
        assert!(state.promise_number >= highest, "promise went backwards at step {step}");
        if state.accepted_proposal != accepted_before
            && let Some(accepted) = &state.accepted_proposal
        {
            assert!(
                Some(accepted.number) >= highest,
                "accepted {} below promise at step {step}",
                accepted.number
            );
        }
        highest = state.promise_number;

        if step % 97 == 96 {
            acceptor = PaxosNode::recover(id, &config, store.clone(), outbox.clone())
                .expect("recover");
            assert_eq!(acceptor.state().promise_number, highest);
        }
        outbox.drain();
    }
    assert!(highest.is_some());
}

#[test]
fn test_learners_agree_on_identical_reports() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let config = ClusterConfig::uniform(5);
    let mut learners: Vec<_> = [1, 2]
        .into_iter()
        .map(|i| {
            PaxosNode::new(
                NodeId::new(i),
                &config,
                InMemoryStateStore::new(),
                MemoryOutbox::new(),
            )
            .expect("create learner")
        })
        .collect();

    for step in 0..300u64 {
        let round = learners[0].current_round();
        let from = NodeId::new(rng.random_range(0..5));
        let value = ["a", "b", "c"][rng.random_range(0..3)];
        let reported_round = if rng.random_bool(0.8) { round } else { Round::new(round.0 + 1) };
        let proposal = Proposal::new(ProposalNumber::new(step), reported_round, value);
        let msg = Message::accept_notification(&proposal, from);
        for learner in &mut learners {
            learner.handle(msg.clone()).expect("handle");
        }
    }

    assert!(!learners[0].state().chosen_values.is_empty());
    assert_eq!(learners[0].state().chosen_values, learners[1].state().chosen_values);
    assert_eq!(learners[0].current_round(), learners[1].current_round());
}

/// Drive `rounds` rounds from node 0 with random delivery order.
///
/// With `crash_percent > 0`, a random node may crash between deliveries;
/// it is restarted once the network drains. Whenever the cluster is quiet
/// and everyone is up, the proposer starts (or retries) its round.
fn run_random(seed: u64, rounds: u64, crash_percent: u32) -> SimCluster {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut cluster = SimCluster::uniform(5);
    let n = cluster.config().node_count();

    for _ in 0..200_000 {
        if cluster.is_quiet() {
            if let Some(&id) = cluster.crashed().first() {
                cluster.restart(id);
                continue;
            }
            let round = cluster.node(0).current_round();
            if round.0 >= rounds {
                break;
            }
            cluster.start_round(0, &demo_value(0, round));
            continue;
        }

        if cluster.crashed().is_empty() && rng.random_range(0..100) < crash_percent {
            cluster.crash(rng.random_range(0..n));
        } else {
            cluster.deliver_random(&mut rng);
        }
    }
    cluster
}

#[test]
fn test_random_delivery_single_proposer() {
    for seed in SEEDS {
        let mut cluster = run_random(seed, 8, 0);
        assert_no_errors(&cluster);
        assert_agreement(&cluster);
        assert_proposal_lineage(&mut cluster);

        for node in cluster.up_nodes() {
            assert_eq!(node.current_round(), Round::new(8), "seed {seed}: {}", node.id());
            for round in 0..8 {
                assert_eq!(
                    node.chosen_value(Round::new(round)),
                    Some(demo_value(0, Round::new(round)).as_str()),
                    "seed {seed}"
                );
            }
        }
    }
}

#[test]
fn test_random_delivery_with_crashes() {
    for seed in SEEDS {
        let mut cluster = run_random(seed, 6, 3);
        assert_no_errors(&cluster);
        assert_agreement(&cluster);
        assert_proposal_lineage(&mut cluster);

        assert!(cluster.node(0).current_round() >= Round::new(6), "seed {seed}");
        for round in 0..6 {
            let known = cluster
                .up_nodes()
                .any(|node| node.chosen_value(Round::new(round)).is_some());
            assert!(known, "seed {seed}: nobody knows round {round}");
        }
    }
}
