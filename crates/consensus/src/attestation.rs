//! Micro-attestations for local updates
//!
//! A fragment carries four claims about one update:
//! - LCS: the transformed state is within `delta_c` of the reference
//! - commitment: BLAKE3 over the canonical encoding of the transformed state
//! - semantic score supplied by the collaborator, accepted at `>= tau`
//! - bounded noise, each coordinate in `[-delta_n, delta_n]`
//!
//! This is an integrity and consistency check, not a zero-knowledge proof.

use crate::engine::{distance, l2_norm};
use crate::error::{ConsensusError, Result};
use crate::types::{AttestationFragment, NodeConfig};
use chrono::Utc;
use rand::distributions::{Distribution, Uniform};
use std::fmt;

/// Why a fragment failed verification
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    ConstraintUnsatisfied,
    LowSemanticScore { score: f64, tau: f64 },
    NoiseDimension { expected: usize, actual: usize },
    NoiseOutOfBounds { norm: f64, bound: f64 },
    CommitmentMismatch,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ConstraintUnsatisfied => write!(f, "local constraint not satisfied"),
            RejectReason::LowSemanticScore { score, tau } => {
                write!(f, "semantic score {:.4} below {:.4}", score, tau)
            }
            RejectReason::NoiseDimension { expected, actual } => {
                write!(f, "noise has {} coordinates, expected {}", actual, expected)
            }
            RejectReason::NoiseOutOfBounds { norm, bound } => {
                write!(f, "noise norm {:.6} exceeds {:.6}", norm, bound)
            }
            RejectReason::CommitmentMismatch => write!(f, "commitment mismatch"),
        }
    }
}

impl RejectReason {
    pub fn into_error(self, node_id: &str) -> ConsensusError {
        ConsensusError::AttestationRejected {
            node_id: node_id.to_string(),
            reason: self.to_string(),
        }
    }
}

/// Canonical byte encoding: little-endian IEEE-754 doubles, in order
pub fn canonical_encoding(state: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(state.len() * 8);
    for x in state {
        bytes.extend_from_slice(&x.to_le_bytes());
    }
    bytes
}

/// Commitment to a state vector
pub fn commitment_of(state: &[f64]) -> [u8; 32] {
    *blake3::hash(&canonical_encoding(state)).as_bytes()
}

/// Produces and verifies attestation fragments for one node
#[derive(Debug, Clone)]
pub struct AttestationLayer {
    node_id: String,
    /// State vector length every fragment must cover
    dimension: usize,
    /// Correctness tolerance
    delta_c: f64,
    /// Semantic threshold
    tau: f64,
    /// Noise bound
    delta_n: f64,
}

impl AttestationLayer {
    pub fn new(
        node_id: impl Into<String>,
        dimension: usize,
        delta_c: f64,
        tau: f64,
        delta_n: f64,
    ) -> Result<Self> {
        let invalid = |msg: &str| Err(ConsensusError::InvalidConfig(msg.to_string()));
        if dimension == 0 {
            return invalid("dimension must be positive");
        }
        if !(delta_c >= 0.0 && delta_c.is_finite()) || !(delta_n >= 0.0 && delta_n.is_finite()) {
            return invalid("tolerances must be non-negative and finite");
        }
        if !(0.0..=1.0).contains(&tau) {
            return invalid("tau must lie in [0, 1]");
        }
        Ok(Self {
            node_id: node_id.into(),
            dimension,
            delta_c,
            tau,
            delta_n,
        })
    }

    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        Self::new(
            config.node_id.clone(),
            config.dimension,
            config.delta_c,
            config.tau,
            config.delta_n,
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Attest that `transformed_state` is a well-formed transformation of
    /// `local_state`.
    pub fn generate_fragment(
        &self,
        local_state: &[f64],
        transformed_state: &[f64],
        semantic_score: f64,
    ) -> Result<AttestationFragment> {
        ConsensusError::check_dimension(local_state.len(), transformed_state.len())?;
        ConsensusError::check_dimension(self.dimension, transformed_state.len())?;

        let diff = distance(transformed_state, local_state);
        // NaN compares false
        let lcs = diff <= self.delta_c;

        let noise = if self.delta_n > 0.0 {
            let dist = Uniform::new_inclusive(-self.delta_n, self.delta_n);
            let mut rng = rand::thread_rng();
            transformed_state
                .iter()
                .map(|_| dist.sample(&mut rng).clamp(-self.delta_n, self.delta_n))
                .collect()
        } else {
            vec![0.0; transformed_state.len()]
        };

        tracing::trace!(node_id = %self.node_id, diff, lcs, "Generated fragment");

        Ok(AttestationFragment {
            node_id: self.node_id.clone(),
            lcs,
            commitment: commitment_of(transformed_state),
            semantic_score,
            noise,
            timestamp: Utc::now(),
        })
    }

    /// Check every acceptance predicate, reporting the first that fails
    pub fn check_fragment(
        &self,
        fragment: &AttestationFragment,
        state_to_verify: Option<&[f64]>,
    ) -> std::result::Result<(), RejectReason> {
        if !fragment.lcs {
            return Err(RejectReason::ConstraintUnsatisfied);
        }

        // Written so that a NaN score is rejected
        if !(fragment.semantic_score >= self.tau) {
            return Err(RejectReason::LowSemanticScore {
                score: fragment.semantic_score,
                tau: self.tau,
            });
        }

        if fragment.noise.len() != self.dimension {
            return Err(RejectReason::NoiseDimension {
                expected: self.dimension,
                actual: fragment.noise.len(),
            });
        }
        let norm = l2_norm(&fragment.noise);
        let bound = self.delta_n * (self.dimension as f64).sqrt();
        if !(norm <= bound) {
            return Err(RejectReason::NoiseOutOfBounds { norm, bound });
        }

        if let Some(state) = state_to_verify {
            if commitment_of(state) != fragment.commitment {
                return Err(RejectReason::CommitmentMismatch);
            }
        }

        Ok(())
    }

    /// Accept iff all predicates hold; no partial credit
    pub fn verify_fragment(
        &self,
        fragment: &AttestationFragment,
        state_to_verify: Option<&[f64]>,
    ) -> bool {
        self.check_fragment(fragment, state_to_verify).is_ok()
    }

    /// Fraction of fragments that verify on their own, `0.0` when empty
    pub fn aggregate_attestations<'a, I>(&self, fragments: I) -> f64
    where
        I: IntoIterator<Item = &'a AttestationFragment>,
    {
        let (valid, total) = fragments.into_iter().fold((0usize, 0usize), |(v, t), f| {
            (v + self.verify_fragment(f, None) as usize, t + 1)
        });
        if total == 0 {
            0.0
        } else {
            valid as f64 / total as f64
        }
    }
}
