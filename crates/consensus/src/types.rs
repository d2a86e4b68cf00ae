//! Core types for consensus rounds and update exchange

use crate::error::{ConsensusError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// A micro-attestation over a single local update.
///
/// Fields are crate-private: a fragment is immutable once produced by
/// `AttestationLayer::generate_fragment` or decoded off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationFragment {
    /// Node that produced the fragment
    pub(crate) node_id: String,
    /// Local constraint satisfied
    pub(crate) lcs: bool,
    /// BLAKE3 digest of the canonical encoding of the transformed state
    #[serde(with = "hex_digest")]
    pub(crate) commitment: [u8; 32],
    /// Semantic-consistency score supplied by the collaborator
    pub(crate) semantic_score: f64,
    /// Bounded privacy jitter, not covered by the commitment
    pub(crate) noise: Vec<f64>,
    /// Creation time
    pub(crate) timestamp: DateTime<Utc>,
}

impl AttestationFragment {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn lcs(&self) -> bool {
        self.lcs
    }

    pub fn commitment(&self) -> &[u8; 32] {
        &self.commitment
    }

    /// Commitment as lowercase hex
    pub fn commitment_hex(&self) -> String {
        hex::encode(self.commitment)
    }

    pub fn semantic_score(&self) -> f64 {
        self.semantic_score
    }

    pub fn noise(&self) -> &[f64] {
        &self.noise
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Hex (de)serialization for 32-byte digests
mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(digest: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(digest))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&s, &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}

/// Messages exchanged between consensus peers.
///
/// One message per connection; the connection lifetime is the frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// A peer's local update for one round
    AdmmUpdate(AdmmUpdate),
}

/// Payload of an `ADMM_UPDATE` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmmUpdate {
    pub round_id: u64,
    pub node_id: String,
    /// Sender's listening address, used to refresh peer contact times
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
    pub theta: Vec<f64>,
    pub fragment: AttestationFragment,
}

impl WireMessage {
    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConsensusError::MalformedMessage(e.to_string()))
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| ConsensusError::MalformedMessage(e.to_string()))
    }

    pub fn round_id(&self) -> u64 {
        match self {
            WireMessage::AdmmUpdate(update) => update.round_id,
        }
    }
}

/// A known peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peer {
    pub address: SocketAddr,
    /// Last successful send or receive, if any
    pub last_contact: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            last_contact: None,
        }
    }
}

/// Robust statistic used by `global_update`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    /// Coordinate-wise median
    Median,
    /// Coordinate-wise mean after dropping `trim_fraction` of the
    /// candidates from each end
    TrimmedMean { trim_fraction: f64 },
}

impl Default for Aggregator {
    fn default() -> Self {
        Aggregator::Median
    }
}

/// Configuration for a consensus node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's identity
    pub node_id: String,
    /// Address the transport listens on
    pub listen_addr: SocketAddr,
    /// Length of every state vector
    pub dimension: usize,
    /// ADMM penalty
    pub rho: f64,
    /// Trust/mixing weight for the local target
    pub alpha: f64,
    /// Correctness tolerance for local constraint satisfaction
    pub delta_c: f64,
    /// Minimum semantic score for an accepted fragment
    pub tau: f64,
    /// Per-coordinate noise bound
    pub delta_n: f64,
    /// Collection window for one round
    pub round_timeout_ms: u64,
    /// Per-peer connect/write/read timeout
    pub io_timeout_ms: u64,
    /// Rounds before `run_until_converged` gives up
    pub max_iterations: usize,
    /// Residual threshold for convergence
    pub epsilon: f64,
    pub aggregator: Aggregator,
    /// Regularizer weight (Γ) for Ω(w) = ½‖w‖²
    pub regularization: f64,
    /// Radius of the feasible L2 ball, unbounded if `None`
    pub feasible_radius: Option<f64>,
    /// Upper bound on an inbound message
    pub max_message_bytes: usize,
    /// Capacity of the inbound message channel
    pub inbox_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "leo-node".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            dimension: 128,
            rho: 1.0,
            alpha: 0.8,
            delta_c: 1e-5,
            tau: 0.8,
            delta_n: 0.01,
            round_timeout_ms: 2000,
            io_timeout_ms: 500,
            max_iterations: 50,
            epsilon: 1e-4,
            aggregator: Aggregator::Median,
            regularization: 0.0,
            feasible_radius: None,
            max_message_bytes: 4 * 1024 * 1024,
            inbox_capacity: 1024,
        }
    }
}

impl NodeConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Reject parameter combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ConsensusError::InvalidConfig(msg.to_string()));

        if self.node_id.is_empty() {
            return invalid("node_id must not be empty");
        }
        if self.dimension == 0 {
            return invalid("dimension must be positive");
        }
        if !(self.rho > 0.0 && self.rho.is_finite()) {
            return invalid("rho must be positive and finite");
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return invalid("alpha must lie in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.tau) {
            return invalid("tau must lie in [0, 1]");
        }
        let bounded = |x: f64| x >= 0.0 && x.is_finite();
        if !bounded(self.delta_c) || !bounded(self.delta_n) {
            return invalid("tolerances must be non-negative and finite");
        }
        if !(self.epsilon > 0.0) {
            return invalid("epsilon must be positive");
        }
        if !(self.regularization >= 0.0) {
            return invalid("regularization must be non-negative");
        }
        if let Some(radius) = self.feasible_radius {
            if !(radius > 0.0) {
                return invalid("feasible_radius must be positive");
            }
        }
        if let Aggregator::TrimmedMean { trim_fraction } = self.aggregator {
            if !(0.0..0.5).contains(&trim_fraction) {
                return invalid("trim_fraction must lie in [0, 0.5)");
            }
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1");
        }
        if self.inbox_capacity == 0 {
            return invalid("inbox_capacity must be positive");
        }
        Ok(())
    }
}

/// Stats about the consensus node
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub rounds_completed: u64,
    pub updates_accepted: u64,
    pub fragments_rejected: u64,
    pub partial_rounds: u64,
    pub known_peers: usize,
    pub last_confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment() -> AttestationFragment {
        AttestationFragment {
            node_id: "node-a".to_string(),
            lcs: true,
            commitment: [0xab; 32],
            semantic_score: 0.9,
            noise: vec![0.001, -0.002],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_wire_message_uses_type_tag() {
        let msg = WireMessage::AdmmUpdate(AdmmUpdate {
            round_id: 7,
            node_id: "node-a".to_string(),
            listen_addr: None,
            theta: vec![1.0, 2.0],
            fragment: fragment(),
        });

        let bytes = msg.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "ADMM_UPDATE");
        assert_eq!(value["round_id"], 7);
        assert_eq!(value["fragment"]["commitment"], "ab".repeat(32));

        let decoded = WireMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.round_id(), 7);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = WireMessage::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(err, ConsensusError::MalformedMessage(_)));

        let err = WireMessage::from_bytes(br#"{"type":"HEARTBEAT","round_id":1}"#).unwrap_err();
        assert!(matches!(err, ConsensusError::MalformedMessage(_)));
    }

    #[test]
    fn test_short_commitment_rejected() {
        let mut value = serde_json::to_value(fragment()).unwrap();
        value["commitment"] = serde_json::Value::String("abcd".to_string());
        assert!(serde_json::from_value::<AttestationFragment>(value).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_config_validation() {
        let bad = [
            NodeConfig {
                dimension: 0,
                ..Default::default()
            },
            NodeConfig {
                rho: 0.0,
                ..Default::default()
            },
            NodeConfig {
                alpha: 1.5,
                ..Default::default()
            },
            NodeConfig {
                tau: -0.1,
                ..Default::default()
            },
            NodeConfig {
                delta_n: f64::INFINITY,
                ..Default::default()
            },
            NodeConfig {
                delta_c: f64::INFINITY,
                ..Default::default()
            },
            NodeConfig {
                delta_n: f64::NAN,
                ..Default::default()
            },
            NodeConfig {
                feasible_radius: Some(0.0),
                ..Default::default()
            },
            NodeConfig {
                aggregator: Aggregator::TrimmedMean { trim_fraction: 0.5 },
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(ConsensusError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_partial_config_json_uses_defaults() {
        let raw = r#"{"dimension": 4, "aggregator": {"trimmed_mean": {"trim_fraction": 0.25}}}"#;
        let config: NodeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.dimension, 4);
        assert_eq!(config.rho, 1.0);
        assert_eq!(
            config.aggregator,
            Aggregator::TrimmedMean { trim_fraction: 0.25 }
        );
    }
}
