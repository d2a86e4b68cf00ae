//! Consensus errors

use std::net::SocketAddr;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors raised by the consensus core.
///
/// None of these are process-fatal except `Bind`, which is returned from
/// `PeerTransport::start` when the listening endpoint cannot be opened.
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("No candidate updates to aggregate")]
    EmptyCandidateSet,

    #[error("Vector contains a non-finite value")]
    NonFiniteValue,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Refusing to add own address {0} as a peer")]
    SelfPeer(SocketAddr),

    #[error("Could not resolve {host}:{port}: {reason}")]
    AddressResolution {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Peer {peer} unreachable: {reason}")]
    NetworkUnreachable { peer: SocketAddr, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Attestation from {node_id} rejected: {reason}")]
    AttestationRejected { node_id: String, reason: String },
}

impl ConsensusError {
    /// Shorthand for a dimension check
    pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(ConsensusError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}
