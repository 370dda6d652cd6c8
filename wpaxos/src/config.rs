//! Static cluster configuration.
//!
//! The cluster is described by a node list file with one line per node.
//! The line index (ignoring blank lines) is the node id:
//!
//! ```text
//! # ip        port  weight  msg_delay  unreliability  dl  dp
//! 127.0.0.1   9000  0.3333  0          0              1   1
//! 127.0.0.1   9005  0.3333  0          0              1   0
//! 127.0.0.1   9010  0.3333  0          0              1   0
//! ```
//!
//! `dl` / `dp` flag the distinguished learners and proposers. Lines starting
//! with `#` are comments.
//!
//! In code, [`ClusterConfig::uniform`] and its builder methods produce the
//! same shape without a file:
//!
//! ```rust
//! use wpaxos::{ClusterConfig, NodeId};
//!
//! let config = ClusterConfig::uniform(5).with_learners([NodeId::new(0)]);
//! assert_eq!(config.node_count(), 5);
//! assert_eq!(config.distinguished_learners(), vec![NodeId::new(0)]);
//! ```

use std::path::{Path, PathBuf};

use crate::types::NodeId;

/// Errors from reading or validating a node list.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The node list file could not be read.
    #[error("cannot read node list {path}: {source}")]
    Io {
        /// The file that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A line has fewer columns than required.
    #[error("line {line}: missing column `{column}`")]
    MissingColumn {
        /// 1-based line number.
        line: usize,
        /// Column name.
        column: &'static str,
    },

    /// A column could not be parsed.
    #[error("line {line}: invalid `{column}` value {value:?}")]
    InvalidColumn {
        /// 1-based line number.
        line: usize,
        /// Column name.
        column: &'static str,
        /// The raw text.
        value: String,
    },

    /// A weight is negative or not finite.
    #[error("line {line}: invalid weight {weight}")]
    InvalidWeight {
        /// 1-based line number.
        line: usize,
        /// The parsed weight.
        weight: f64,
    },

    /// The node list holds no nodes.
    #[error("node list is empty")]
    Empty,

    /// A node id outside the list.
    #[error("{id} is out of range (cluster has {node_count} nodes)")]
    NodeOutOfRange {
        /// The offending id.
        id: NodeId,
        /// Configured cluster size.
        node_count: usize,
    },

    /// A generated layout would run past the last TCP port.
    #[error("{node_count} nodes do not fit in the port range from {base_port}")]
    TooManyNodes {
        /// Requested cluster size.
        node_count: usize,
        /// First port of the layout.
        base_port: u16,
    },
}

const BASE_PORT: u16 = 9000;
const PORT_STRIDE: usize = 5;

/// One line of the node list.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Host or IP address the node listens on.
    pub host: String,
    /// TCP port the node listens on.
    pub port: u16,
    /// Quorum weight of this node's acceptor.
    pub weight: f64,
    /// Artificial inbound delay factor; each received message waits
    /// `rand(0..1) * 100ms * msg_delay` before dispatch.
    pub msg_delay: f64,
    /// Message-drop probability. Parsed and reported, never applied.
    pub unreliability: f64,
    /// Whether this node is a distinguished learner.
    pub distinguished_learner: bool,
    /// Whether this node is a distinguished proposer.
    pub distinguished_proposer: bool,
}

impl NodeSpec {
    /// A node on `host:port` with the given weight and no flags.
    pub fn new(host: impl Into<String>, port: u16, weight: f64) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            msg_delay: 0.0,
            unreliability: 0.0,
            distinguished_learner: false,
            distinguished_proposer: false,
        }
    }

    /// The `host:port` string to bind or dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The full, static cluster description.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    nodes: Vec<NodeSpec>,
}

impl ClusterConfig {
    /// Wrap an explicit node list.
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self, ConfigError> {
        if nodes.is_empty() {
            return Err(ConfigError::Empty);
        }
        let config = Self { nodes };
        config.check_weights();
        Ok(config)
    }

    /// `n` equal-weight nodes on `127.0.0.1`, ports `9000 + 5·i`.
    ///
    /// Nodes `0..3` are distinguished learners and node 0 is the
    /// distinguished proposer, the layout the node list generator produces.
    ///
    /// # Panics
    ///
    /// If `n` is zero or the ports would overflow; see [`Self::try_uniform`].
    pub fn uniform(n: usize) -> Self {
        match Self::try_uniform(n) {
            Ok(config) => config,
            Err(e) => panic!("cannot build uniform cluster: {e}"),
        }
    }

    /// Fallible form of [`Self::uniform`].
    pub fn try_uniform(n: usize) -> Result<Self, ConfigError> {
        if n == 0 {
            return Err(ConfigError::Empty);
        }
        let weight = 1.0 / n as f64;
        let nodes = (0..n)
            .map(|i| {
                let port = PORT_STRIDE
                    .checked_mul(i)
                    .and_then(|offset| offset.checked_add(usize::from(BASE_PORT)))
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or(ConfigError::TooManyNodes {
                        node_count: n,
                        base_port: BASE_PORT,
                    })?;
                Ok(NodeSpec {
                    distinguished_learner: i < 3,
                    distinguished_proposer: i == 0,
                    ..NodeSpec::new("127.0.0.1", port, weight)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nodes })
    }

    /// Replace the distinguished learner set.
    pub fn with_learners(mut self, learners: impl IntoIterator<Item = NodeId>) -> Self {
        let learners: Vec<NodeId> = learners.into_iter().collect();
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.distinguished_learner = learners.contains(&NodeId::new(i));
        }
        self
    }

    /// Make `proposer` the only distinguished proposer.
    pub fn with_proposer(mut self, proposer: NodeId) -> Self {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.distinguished_proposer = i == proposer.index();
        }
        self
    }

    /// Replace the weights, in node order. Extra weights are ignored.
    pub fn with_weights(mut self, weights: impl IntoIterator<Item = f64>) -> Self {
        for (node, weight) in self.nodes.iter_mut().zip(weights) {
            node.weight = weight;
        }
        self.check_weights();
        self
    }

    /// Replace the listening ports, in node order.
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        for (node, port) in self.nodes.iter_mut().zip(ports) {
            node.port = port;
        }
        self
    }

    /// Replace every node's message delay factor.
    pub fn with_msg_delay(mut self, msg_delay: f64) -> Self {
        for node in &mut self.nodes {
            node.msg_delay = msg_delay;
        }
        self
    }

    /// Read and parse a node list file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        tracing::info!(
            path = %path.display(),
            nodes = config.node_count(),
            "loaded node list"
        );
        Ok(config)
    }

    /// Parse node list text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut nodes = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            nodes.push(parse_line(line_no, trimmed)?);
        }
        Self::new(nodes)
    }

    /// Number of nodes (`Nprocs`).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes, in id order.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    /// The entry for node `id`.
    pub fn node(&self, id: NodeId) -> Result<&NodeSpec, ConfigError> {
        self.nodes
            .get(id.index())
            .ok_or(ConfigError::NodeOutOfRange {
                id,
                node_count: self.nodes.len(),
            })
    }

    /// Every node id, in order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId::new)
    }

    /// Weight of node `id`, or zero if the id is unknown.
    pub fn weight(&self, id: NodeId) -> f64 {
        self.nodes.get(id.index()).map_or(0.0, |node| node.weight)
    }

    /// Weights of all nodes, indexed by id.
    pub fn weights(&self) -> Vec<f64> {
        self.nodes.iter().map(|node| node.weight).collect()
    }

    /// Ids of the distinguished learners.
    pub fn distinguished_learners(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|id| self.nodes[id.index()].distinguished_learner)
            .collect()
    }

    /// Whether `id` is a distinguished learner.
    pub fn is_distinguished_learner(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.index())
            .is_some_and(|node| node.distinguished_learner)
    }

    /// Whether `id` is a distinguished proposer.
    pub fn is_distinguished_proposer(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.index())
            .is_some_and(|node| node.distinguished_proposer)
    }

    /// The acceptors a proposer on `id` contacts.
    ///
    /// This is the window of `floor(N/2) + 1` ids that starts right after
    /// `id` and wraps modulo `N`, not a broadcast to every acceptor.
    ///
    /// Windows are majorities by count, but quorums are counted by weight.
    /// A window whose weights sum to one half or less can never gather a
    /// quorum, and when the configured weights do not sum to one, quorums
    /// gathered from two different windows need not intersect.
    pub fn acceptor_set(&self, id: NodeId) -> Vec<NodeId> {
        let n = self.nodes.len();
        (1..=n / 2 + 1)
            .map(|offset| NodeId::new((id.index() + offset) % n))
            .collect()
    }

    fn check_weights(&self) {
        let total: f64 = self.nodes.iter().map(|node| node.weight).sum();
        if (total - 1.0).abs() > 1e-6 {
            tracing::warn!(total, "node weights do not sum to 1");
        }
    }
}

const COLUMNS: [&str; 7] = [
    "ip",
    "port",
    "weight",
    "msg_delay",
    "unreliability",
    "dl",
    "dp",
];

fn parse_line(line: usize, text: &str) -> Result<NodeSpec, ConfigError> {
    let mut cols = text.split_whitespace();
    let mut next = |column: usize| {
        cols.next().ok_or(ConfigError::MissingColumn {
            line,
            column: COLUMNS[column],
        })
    };

    let host = next(0)?.to_string();
    let port = parse_column::<u16>(line, 1, next(1)?)?;
    let weight = parse_column::<f64>(line, 2, next(2)?)?;
    let msg_delay = parse_column::<f64>(line, 3, next(3)?)?;
    let unreliability = parse_column::<f64>(line, 4, next(4)?)?;
    let distinguished_learner = parse_flag(line, 5, next(5)?)?;
    let distinguished_proposer = parse_flag(line, 6, next(6)?)?;

    if !weight.is_finite() || weight < 0.0 {
        return Err(ConfigError::InvalidWeight { line, weight });
    }
    if !msg_delay.is_finite() || msg_delay < 0.0 {
        return Err(ConfigError::InvalidColumn {
            line,
            column: COLUMNS[3],
            value: msg_delay.to_string(),
        });
    }

    Ok(NodeSpec {
        host,
        port,
        weight,
        msg_delay,
        unreliability,
        distinguished_learner,
        distinguished_proposer,
    })
}

fn parse_column<T: std::str::FromStr>(
    line: usize,
    column: usize,
    value: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidColumn {
        line,
        column: COLUMNS[column],
        value: value.to_string(),
    })
}

fn parse_flag(line: usize, column: usize, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(ConfigError::InvalidColumn {
            line,
            column: COLUMNS[column],
            value: value.to_string(),
        }),
    }
}
