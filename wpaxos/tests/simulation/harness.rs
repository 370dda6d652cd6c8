//! In-memory cluster driven one message at a time.
//!
//! Every node shares a single [`MemoryOutbox`]. Sent envelopes move into an
//! in-flight queue, and the test decides which one is delivered next. The
//! sender of an envelope is its message's `id`, so per-link FIFO order can be
//! kept while links are interleaved at random.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::Rng;
use wpaxos::{
    ClusterConfig, Envelope, InMemoryStateStore, MemoryOutbox, NodeId, PaxosError, PaxosNode,
    Round,
};

pub type SimNode = PaxosNode<InMemoryStateStore, MemoryOutbox>;

/// One chosen value as reported to a node's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChosenEvent {
    pub node: NodeId,
    pub round: Round,
    pub value: String,
}

pub struct SimCluster {
    config: ClusterConfig,
    nodes: Vec<Option<SimNode>>,
    stores: Vec<InMemoryStateStore>,
    outbox: MemoryOutbox,
    network: VecDeque<Envelope>,
    sent: Vec<Envelope>,
    chosen: Rc<RefCell<Vec<ChosenEvent>>>,
    errors: Vec<(NodeId, PaxosError)>,
    dropped: usize,
}

impl SimCluster {
    pub fn new(config: ClusterConfig) -> Self {
        let outbox = MemoryOutbox::new();
        let chosen = Rc::new(RefCell::new(Vec::new()));
        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        for id in config.node_ids() {
            let store = InMemoryStateStore::new();
            let mut node =
                PaxosNode::new(id, &config, store.clone(), outbox.clone()).expect("create node");
            node.set_chosen_listener(listener(id, chosen.clone()));
            nodes.push(Some(node));
            stores.push(store);
        }
        Self {
            config,
            nodes,
            stores,
            outbox,
            network: VecDeque::new(),
            sent: Vec::new(),
            chosen,
            errors: Vec::new(),
            dropped: 0,
        }
    }

    pub fn uniform(n: usize) -> Self {
        Self::new(ClusterConfig::uniform(n))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn node(&self, id: usize) -> &SimNode {
        self.nodes[id].as_ref().expect("node is up")
    }

    pub fn node_mut(&mut self, id: usize) -> &mut SimNode {
        self.nodes[id].as_mut().expect("node is up")
    }

    pub fn is_up(&self, id: usize) -> bool {
        self.nodes[id].is_some()
    }

    pub fn up_nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.iter().flatten()
    }

    pub fn crashed(&self) -> Vec<usize> {
        (0..self.nodes.len()).filter(|&i| !self.is_up(i)).collect()
    }

    pub fn store(&self, id: usize) -> &InMemoryStateStore {
        &self.stores[id]
    }

    /// Ask node `id` to start proposing `value`.
    pub fn start_round(&mut self, id: usize, value: &str) {
        let result = self.node_mut(id).start_round(value);
        if let Err(e) = result {
            self.errors.push((NodeId::new(id), e));
        }
        self.collect();
    }

    /// Drop node `id` together with everything in flight to it.
    pub fn crash(&mut self, id: usize) {
        self.collect();
        self.nodes[id] = None;
        let before = self.network.len();
        self.network.retain(|env| env.to.index() != id);
        self.dropped += before - self.network.len();
    }

    /// Bring node `id` back from its last saved snapshot.
    pub fn restart(&mut self, id: usize) {
        let node_id = NodeId::new(id);
        let mut node = PaxosNode::recover(
            node_id,
            &self.config,
            self.stores[id].clone(),
            self.outbox.clone(),
        )
        .expect("recover node");
        node.set_chosen_listener(listener(node_id, self.chosen.clone()));
        self.nodes[id] = Some(node);
        self.collect();
    }

    /// Whether nothing is in flight.
    pub fn is_quiet(&mut self) -> bool {
        self.collect();
        self.network.is_empty()
    }

    pub fn in_flight(&mut self) -> usize {
        self.collect();
        self.network.len()
    }

    /// Deliver the oldest in-flight envelope.
    pub fn deliver_next(&mut self) -> bool {
        self.collect();
        match self.network.pop_front() {
            Some(env) => {
                self.deliver(env);
                true
            }
            None => false,
        }
    }

    /// Deliver the oldest envelope on a randomly picked link.
    pub fn deliver_random(&mut self, rng: &mut impl Rng) -> bool {
        self.collect();
        if self.network.is_empty() {
            return false;
        }
        let pick = rng.random_range(0..self.network.len());
        let link = (self.network[pick].message.id, self.network[pick].to);
        let first = self
            .network
            .iter()
            .position(|env| (env.message.id, env.to) == link)
            .expect("picked link has an envelope");
        let env = self.network.remove(first).expect("index in range");
        self.deliver(env);
        true
    }

    /// Deliver in FIFO order until nothing is in flight; returns the count.
    pub fn run_until_quiet(&mut self, limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < limit && self.deliver_next() {
            delivered += 1;
        }
        assert!(self.is_quiet(), "cluster still busy after {limit} deliveries");
        delivered
    }

    /// Everything sent so far, in send order.
    pub fn sent(&mut self) -> &[Envelope] {
        self.collect();
        &self.sent
    }

    pub fn chosen_events(&self) -> Vec<ChosenEvent> {
        self.chosen.borrow().clone()
    }

    pub fn errors(&self) -> &[(NodeId, PaxosError)] {
        &self.errors
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    fn deliver(&mut self, env: Envelope) {
        let to = env.to.index();
        let Some(node) = self.nodes.get_mut(to).and_then(Option::as_mut) else {
            self.dropped += 1;
            return;
        };
        if let Err(e) = node.handle(env.message) {
            self.errors.push((env.to, e));
        }
        self.collect();
    }

    fn collect(&mut self) {
        for env in self.outbox.drain() {
            self.sent.push(env.clone());
            self.network.push_back(env);
        }
    }
}

fn listener(id: NodeId, log: Rc<RefCell<Vec<ChosenEvent>>>) -> wpaxos::ChosenListener {
    Box::new(move |round, value| {
        log.borrow_mut().push(ChosenEvent {
            node: id,
            round,
            value: value.to_string(),
        });
    })
}
