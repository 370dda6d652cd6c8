//! Canonical single-line encoding for wire types and state snapshots.
//!
//! Every record that crosses a process boundary (a [`Message`] on a socket,
//! a [`Proposal`] embedded in a message, a [`PaxosState`] in a state file)
//! is encoded as one line of field-tagged JSON. Field tagging lets a
//! receiver read `type` before it interprets `value` and `number`.
//!
//! # Example
//!
//! ```rust
//! use wpaxos::{Message, NodeId, ProposalNumber, Round, WireFormat};
//!
//! let msg = Message::prepare_request(Round::new(0), ProposalNumber::new(3), NodeId::new(3));
//! let line = msg.encode();
//! assert!(!line.contains('\n'));
//!
//! let decoded = Message::decode(&line).expect("decode");
//! assert_eq!(decoded, msg);
//! ```
//!
//! [`Message`]: crate::Message
//! [`Proposal`]: crate::Proposal
//! [`PaxosState`]: crate::PaxosState

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for decoding wire payloads.
///
/// Decoding never partially succeeds: a truncated record, a missing field,
/// an unknown field or a field of the wrong type all reject the whole input.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not a well-formed record of the expected type.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A `value` that should carry a decimal integer does not.
    #[error("invalid integer payload: {0:?}")]
    InvalidInteger(String),

    /// A handshake frame of the wrong kind.
    #[error("unexpected message type: {0}")]
    UnexpectedType(String),
}

/// Stable, round-trip exact, single-line encoding.
///
/// Implemented by [`Proposal`](crate::Proposal), [`Message`](crate::Message)
/// and [`PaxosState`](crate::PaxosState). `decode(encode(x)) == x` holds for
/// every value of those types.
pub trait WireFormat: Serialize + DeserializeOwned {
    /// Encode to a single line (no trailing newline).
    fn encode(&self) -> String {
        // Only strings, integers, floats, options and integer-keyed maps:
        // serde_json cannot fail on these.
        serde_json::to_string(self).expect("wire types always serialize")
    }

    /// Decode from a single line, rejecting anything malformed.
    fn decode(line: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
    }
}
