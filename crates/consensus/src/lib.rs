//! LEO Consensus - decentralized ADMM with micro-attestations
//!
//! Architecture:
//! - Every node owns its optimization state (θ, w, u) and never ships it
//! - Each round a node takes a local proximal step, broadcasts θ with an
//!   attestation fragment, collects peer updates for a bounded window,
//!   and aggregates the verified ones with a robust statistic
//! - No coordinator: peers are configured explicitly, one message per TCP
//!   connection

pub mod attestation;
pub mod engine;
pub mod error;
pub mod node;
pub mod round;
pub mod transport;
pub mod types;

pub use attestation::{canonical_encoding, commitment_of, AttestationLayer, RejectReason};
pub use engine::{ConsensusEngine, Residuals};
pub use error::{ConsensusError, Result};
pub use node::{ConsensusNode, ConsensusNodeBuilder};
pub use round::{ConsensusRound, Quorum, RoundInbox, RoundOutcome, RoundPhase};
pub use transport::{BroadcastReport, InboundMessage, Inbox, PeerTransport, TransportStats};
pub use types::*;
