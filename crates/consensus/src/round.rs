//! One consensus round and the round-indexed inbox feeding it
//!
//! `LOCAL_STEP → BROADCAST → COLLECT → AGGREGATE → DUAL_UPDATE → ATTEST → DONE`
//!
//! The driving loop lives in `ConsensusNode::run_round`; this module holds
//! the per-round bookkeeping and the admission rules for peer updates.

use crate::attestation::AttestationLayer;
use crate::engine::Residuals;
use crate::error::{ConsensusError, Result};
use crate::transport::Inbox;
use crate::types::{AdmmUpdate, AttestationFragment, WireMessage};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tokio::time::{timeout_at, Instant};

/// Upper bound on messages stashed for future rounds
const MAX_PENDING_MESSAGES: usize = 4096;

/// Phases of a round, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoundPhase {
    LocalStep,
    Broadcast,
    Collect,
    Aggregate,
    DualUpdate,
    Attest,
    Done,
}

/// Whether every known peer reported before the collection window closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    Full,
    Partial,
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quorum::Full => write!(f, "full"),
            Quorum::Partial => write!(f, "partial"),
        }
    }
}

/// Round-indexed view over the transport inbox.
///
/// Updates for later rounds are stashed until their round starts; updates
/// for earlier rounds are dropped.
pub struct RoundInbox {
    rx: Inbox,
    pending: BTreeMap<u64, VecDeque<AdmmUpdate>>,
    pending_len: usize,
    stale: u64,
}

impl RoundInbox {
    pub fn new(rx: Inbox) -> Self {
        Self {
            rx,
            pending: BTreeMap::new(),
            pending_len: 0,
            stale: 0,
        }
    }

    /// Messages dropped because their round had already passed
    pub fn stale_count(&self) -> u64 {
        self.stale
    }

    /// Next update for `round_id`, or `None` once `deadline` passes or the
    /// transport has gone away.
    pub async fn next_for_round(&mut self, round_id: u64, deadline: Instant) -> Option<AdmmUpdate> {
        let current = self.pending.split_off(&round_id);
        let expired: usize = self.pending.values().map(VecDeque::len).sum();
        self.stale += expired as u64;
        self.pending_len -= expired;
        self.pending = current;

        if let Some(queue) = self.pending.get_mut(&round_id) {
            if let Some(update) = queue.pop_front() {
                self.pending_len -= 1;
                if queue.is_empty() {
                    self.pending.remove(&round_id);
                }
                return Some(update);
            }
        }

        loop {
            let inbound = match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(inbound)) => inbound,
                Ok(None) | Err(_) => return None,
            };
            let WireMessage::AdmmUpdate(update) = inbound.message;

            if update.round_id == round_id {
                return Some(update);
            }
            if update.round_id < round_id {
                self.stale += 1;
                tracing::debug!(
                    "Dropping stale update from {} for round {} (now {})",
                    update.node_id,
                    update.round_id,
                    round_id
                );
                continue;
            }
            if self.pending_len >= MAX_PENDING_MESSAGES {
                tracing::warn!(
                    "Pending update stash full, dropping update from {}",
                    update.node_id
                );
                continue;
            }
            self.pending_len += 1;
            self.pending.entry(update.round_id).or_default().push_back(update);
        }
    }
}

/// Ephemeral state of a single round
#[derive(Debug)]
pub struct ConsensusRound {
    round_id: u64,
    phase: RoundPhase,
    local_theta: Vec<f64>,
    /// Every fragment seen this round, keyed by sender
    received_fragments: BTreeMap<String, AttestationFragment>,
    /// Verified peer updates
    accepted_updates: BTreeMap<String, Vec<f64>>,
    rejected: usize,
}

impl ConsensusRound {
    pub fn new(round_id: u64) -> Self {
        Self {
            round_id,
            phase: RoundPhase::LocalStep,
            local_theta: Vec::new(),
            received_fragments: BTreeMap::new(),
            accepted_updates: BTreeMap::new(),
            rejected: 0,
        }
    }

    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub(crate) fn advance(&mut self, next: RoundPhase) {
        debug_assert!(next > self.phase);
        tracing::trace!(round_id = self.round_id, "{:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    pub(crate) fn set_local_theta(&mut self, theta: Vec<f64>) {
        self.local_theta = theta;
    }

    pub fn local_theta(&self) -> &[f64] {
        &self.local_theta
    }

    pub fn received_fragments(&self) -> &BTreeMap<String, AttestationFragment> {
        &self.received_fragments
    }

    pub fn accepted_updates(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.accepted_updates
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Drain the inbox until each of `expected` peers has reported or the
    /// deadline passes. A peer whose update is rejected on content still
    /// counts as reported; an update failing the identity checks does not.
    pub(crate) async fn collect(
        &mut self,
        inbox: &mut RoundInbox,
        own_id: &str,
        attestation: &AttestationLayer,
        expected: usize,
        deadline: Instant,
    ) -> Quorum {
        let mut reported = BTreeSet::new();
        while reported.len() < expected {
            let Some(update) = inbox.next_for_round(self.round_id, deadline).await else {
                break;
            };
            if let Err(e) = self.check_identity(&update, own_id) {
                self.rejected += 1;
                tracing::warn!(round_id = self.round_id, "Ignored update: {}", e);
                continue;
            }
            let node_id = update.node_id.clone();
            reported.insert(node_id.clone());
            match self.admit(update, own_id, attestation) {
                Ok(()) => {
                    tracing::debug!(round_id = self.round_id, "Accepted update from {}", node_id);
                }
                Err(e) => {
                    self.rejected += 1;
                    tracing::warn!(round_id = self.round_id, "Rejected update: {}", e);
                }
            }
        }

        if reported.len() >= expected {
            Quorum::Full
        } else {
            tracing::info!(
                round_id = self.round_id,
                "Collection window closed with {}/{} peers",
                reported.len(),
                expected
            );
            Quorum::Partial
        }
    }

    /// Sender must not be us, must not have reported already this round,
    /// and must have produced the fragment it carries
    fn check_identity(&self, update: &AdmmUpdate, own_id: &str) -> Result<()> {
        let reject = |reason: &str| {
            Err(ConsensusError::AttestationRejected {
                node_id: update.node_id.clone(),
                reason: reason.to_string(),
            })
        };
        if update.node_id == own_id {
            return reject("sender claims our node id");
        }
        if self.received_fragments.contains_key(&update.node_id) {
            return reject("duplicate update this round");
        }
        if update.fragment.node_id() != update.node_id {
            return reject("fragment produced by a different node");
        }
        Ok(())
    }

    /// Admission rules for one peer update
    pub(crate) fn admit(
        &mut self,
        update: AdmmUpdate,
        own_id: &str,
        attestation: &AttestationLayer,
    ) -> Result<()> {
        self.check_identity(&update, own_id)?;
        let AdmmUpdate {
            node_id,
            theta,
            fragment,
            ..
        } = update;

        ConsensusError::check_dimension(attestation.dimension(), theta.len())?;
        if theta.iter().any(|x| !x.is_finite()) {
            return Err(ConsensusError::NonFiniteValue);
        }
        self.received_fragments.insert(node_id.clone(), fragment);
        let fragment = &self.received_fragments[&node_id];

        attestation
            .check_fragment(fragment, Some(theta.as_slice()))
            .map_err(|reason| reason.into_error(&node_id))?;

        self.accepted_updates.insert(node_id, theta);
        Ok(())
    }

    /// Own θ plus every accepted peer θ
    pub(crate) fn candidates(&self) -> Vec<Vec<f64>> {
        std::iter::once(self.local_theta.clone())
            .chain(self.accepted_updates.values().cloned())
            .collect()
    }
}

/// What a finished round hands back to the collaborator
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub round_id: u64,
    pub aggregated_state: Vec<f64>,
    /// Mean of `aggregated_state`
    pub mean: f64,
    /// Fraction of this round's fragments that verify
    pub confidence: f64,
    /// Updates aggregated, own included
    pub accepted: usize,
    pub rejected: usize,
    pub quorum: Quorum,
    pub residuals: Residuals,
    pub converged: bool,
    /// This node's attestation over the round
    pub attestation: AttestationFragment,
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Consensus] round {}: mean {:.4}, confidence {:.2} ({} accepted, {} rejected, {} quorum, {}) com {}",
            self.round_id,
            self.mean,
            self.confidence,
            self.accepted,
            self.rejected,
            self.quorum,
            if self.converged { "converged" } else { "in progress" },
            &self.attestation.commitment_hex()[..16],
        )
    }
}

pub(crate) fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f64>() / v.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InboundMessage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn layer(node_id: &str, dimension: usize) -> AttestationLayer {
        AttestationLayer::new(node_id, dimension, 1e-5, 0.8, 0.01).unwrap()
    }

    fn update(round_id: u64, node_id: &str, theta: Vec<f64>, score: f64) -> AdmmUpdate {
        let fragment = layer(node_id, theta.len())
            .generate_fragment(&theta, &theta, score)
            .unwrap();
        AdmmUpdate {
            round_id,
            node_id: node_id.to_string(),
            listen_addr: None,
            theta,
            fragment,
        }
    }

    fn inbound(update: AdmmUpdate) -> InboundMessage {
        InboundMessage {
            from: "127.0.0.1:9".parse().unwrap(),
            message: WireMessage::AdmmUpdate(update),
        }
    }

    #[test]
    fn test_admit_accepts_valid_update() {
        let mut round = ConsensusRound::new(1);
        round
            .admit(update(1, "b", vec![1.0, 2.0], 0.9), "a", &layer("a", 2))
            .unwrap();
        assert_eq!(round.accepted_updates()["b"], vec![1.0, 2.0]);
        assert!(round.received_fragments().contains_key("b"));
    }

    #[test]
    fn test_admit_rejections() {
        let verifier = layer("a", 2);
        let mut round = ConsensusRound::new(1);

        // Low semantic score: fragment seen, update not accepted
        let err = round
            .admit(update(1, "b", vec![1.0, 2.0], 0.5), "a", &verifier)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::AttestationRejected { .. }));
        assert!(round.received_fragments().contains_key("b"));
        assert!(round.accepted_updates().is_empty());

        // Duplicate sender
        let err = round
            .admit(update(1, "b", vec![1.0, 2.0], 0.9), "a", &verifier)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::AttestationRejected { .. }));

        // Wrong dimension
        let err = round
            .admit(update(1, "c", vec![1.0], 0.9), "a", &verifier)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::DimensionMismatch { .. }));

        // Theta swapped after attesting
        let mut tampered = update(1, "d", vec![1.0, 2.0], 0.9);
        tampered.theta = vec![50.0, 2.0];
        let err = round.admit(tampered, "a", &verifier).unwrap_err();
        assert!(err.to_string().contains("commitment mismatch"));

        // Impersonating us
        assert!(round
            .admit(update(1, "a", vec![1.0, 2.0], 0.9), "a", &verifier)
            .is_err());

        // Fragment from someone else
        let mut forwarded = update(1, "e", vec![1.0, 2.0], 0.9);
        forwarded.node_id = "f".to_string();
        assert!(round.admit(forwarded, "a", &verifier).is_err());

        assert!(round.accepted_updates().is_empty());
    }

    #[test]
    fn test_candidates_include_own_theta() {
        let mut round = ConsensusRound::new(1);
        round.set_local_theta(vec![0.0, 0.0]);
        round
            .admit(update(1, "b", vec![1.0, 2.0], 0.9), "a", &layer("a", 2))
            .unwrap();
        let candidates = round.candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_inbox_routes_by_round() {
        let (tx, rx) = mpsc::channel(16);
        let mut inbox = RoundInbox::new(rx);

        tx.send(inbound(update(0, "old", vec![0.0], 0.9))).await.unwrap();
        tx.send(inbound(update(2, "future", vec![2.0], 0.9))).await.unwrap();
        tx.send(inbound(update(1, "now", vec![1.0], 0.9))).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(200);
        let got = inbox.next_for_round(1, deadline).await.unwrap();
        assert_eq!(got.node_id, "now");
        assert_eq!(inbox.stale_count(), 1);

        // Nothing else for round 1
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(inbox.next_for_round(1, deadline).await.is_none());

        // The stashed update is served when round 2 starts
        let deadline = Instant::now() + Duration::from_millis(50);
        let got = inbox.next_for_round(2, deadline).await.unwrap();
        assert_eq!(got.node_id, "future");
    }

    #[tokio::test]
    async fn test_collect_times_out_with_partial_quorum() {
        let (tx, rx) = mpsc::channel(16);
        let mut inbox = RoundInbox::new(rx);
        tx.send(inbound(update(1, "b", vec![1.0], 0.9))).await.unwrap();

        let mut round = ConsensusRound::new(1);
        let started = std::time::Instant::now();
        let deadline = Instant::now() + Duration::from_millis(100);
        let quorum = round
            .collect(&mut inbox, "a", &layer("a", 1), 2, deadline)
            .await;

        assert_eq!(quorum, Quorum::Partial);
        assert_eq!(round.accepted_updates().len(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_collect_stops_when_all_peers_reported() {
        let (tx, rx) = mpsc::channel(16);
        let mut inbox = RoundInbox::new(rx);
        tx.send(inbound(update(1, "b", vec![1.0], 0.9))).await.unwrap();
        tx.send(inbound(update(1, "c", vec![1.0], 0.1))).await.unwrap();

        let mut round = ConsensusRound::new(1);
        let deadline = Instant::now() + Duration::from_secs(30);
        let started = std::time::Instant::now();
        let quorum = round
            .collect(&mut inbox, "a", &layer("a", 1), 2, deadline)
            .await;

        assert_eq!(quorum, Quorum::Full);
        assert_eq!(round.accepted_updates().len(), 1);
        assert_eq!(round.rejected(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_impostor_does_not_fill_quorum() {
        let (tx, rx) = mpsc::channel(16);
        let mut inbox = RoundInbox::new(rx);
        // Claims our id, then a fragment relayed under another name
        tx.send(inbound(update(1, "a", vec![5.0], 0.9))).await.unwrap();
        let mut relayed = update(1, "c", vec![5.0], 0.9);
        relayed.node_id = "d".to_string();
        tx.send(inbound(relayed)).await.unwrap();
        tx.send(inbound(update(1, "b", vec![1.0], 0.9))).await.unwrap();

        let mut round = ConsensusRound::new(1);
        let deadline = Instant::now() + Duration::from_secs(5);
        let quorum = round
            .collect(&mut inbox, "a", &layer("a", 1), 1, deadline)
            .await;

        assert_eq!(quorum, Quorum::Full);
        assert_eq!(round.accepted_updates()["b"], vec![1.0]);
        assert_eq!(round.rejected(), 2);
        assert!(!round.received_fragments().contains_key("a"));
    }

    #[tokio::test]
    async fn test_duplicate_sender_counted_once() {
        let (tx, rx) = mpsc::channel(16);
        let mut inbox = RoundInbox::new(rx);
        tx.send(inbound(update(1, "b", vec![1.0], 0.9))).await.unwrap();
        tx.send(inbound(update(1, "b", vec![9.0], 0.9))).await.unwrap();

        let mut round = ConsensusRound::new(1);
        let deadline = Instant::now() + Duration::from_millis(150);
        let quorum = round
            .collect(&mut inbox, "a", &layer("a", 1), 2, deadline)
            .await;

        assert_eq!(quorum, Quorum::Partial);
        assert_eq!(round.accepted_updates()["b"], vec![1.0]);
        assert_eq!(round.rejected(), 1);
    }

    #[test]
    fn test_malformed_update_leaves_no_fragment() {
        let verifier = layer("a", 2);
        let mut round = ConsensusRound::new(1);

        let mut short_noise = update(1, "b", vec![1.0, 2.0], 0.9);
        short_noise.fragment.noise = Vec::new();
        assert!(round.admit(short_noise, "a", &verifier).is_err());
        // Recorded, but it cannot lift confidence
        assert_eq!(
            verifier.aggregate_attestations(round.received_fragments().values()),
            0.0
        );

        let err = round
            .admit(update(1, "c", vec![1.0], 0.9), "a", &verifier)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::DimensionMismatch { .. }));
        assert!(!round.received_fragments().contains_key("c"));
    }

    #[test]
    fn test_outcome_display() {
        let theta = vec![1.0, 3.0];
        let outcome = RoundOutcome {
            round_id: 4,
            mean: mean(&theta),
            aggregated_state: theta.clone(),
            confidence: 0.5,
            accepted: 2,
            rejected: 1,
            quorum: Quorum::Partial,
            residuals: Residuals::default(),
            converged: false,
            attestation: layer("a", 2)
                .generate_fragment(&theta, &theta, 0.9)
                .unwrap(),
        };
        let text = outcome.to_string();
        assert!(text.starts_with("[Consensus] round 4: mean 2.0000, confidence 0.50"));
        assert!(text.contains("partial quorum"));
    }
}
