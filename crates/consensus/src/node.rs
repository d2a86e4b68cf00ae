//! Consensus node - drives rounds over the engine, attestation layer and
//! transport

use crate::attestation::AttestationLayer;
use crate::engine::ConsensusEngine;
use crate::error::{ConsensusError, Result};
use crate::round::{mean, ConsensusRound, Quorum, RoundInbox, RoundOutcome, RoundPhase};
use crate::transport::PeerTransport;
use crate::types::{AdmmUpdate, Aggregator, ConsensusStats, NodeConfig, Peer, WireMessage};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

/// A node taking part in decentralized consensus
pub struct ConsensusNode {
    config: NodeConfig,
    engine: ConsensusEngine,
    attestation: AttestationLayer,
    /// Shared so that `stop` can be called from another task mid-round
    transport: Arc<PeerTransport>,
    inbox: RoundInbox,
    /// Id of the last round started
    round_id: u64,
    stats: RwLock<ConsensusStats>,
}

impl ConsensusNode {
    /// Create a node with zeroed state
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let engine = ConsensusEngine::new(&config)?;
        let attestation = AttestationLayer::from_config(&config)?;
        let (transport, inbox) = PeerTransport::new(&config);
        Ok(Self {
            config,
            engine,
            attestation,
            transport: Arc::new(transport),
            inbox: RoundInbox::new(inbox),
            round_id: 0,
            stats: RwLock::new(ConsensusStats::default()),
        })
    }

    /// Start the transport; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.transport.start().await?;
        tracing::info!("Consensus node {} started on {}", self.config.node_id, addr);
        Ok(addr)
    }

    /// Stop accepting updates. Safe to call while a round is collecting.
    pub async fn stop(&self) {
        self.transport.stop().await;
        tracing::info!("Consensus node {} stopped", self.config.node_id);
    }

    pub async fn connect_to_peer(&self, host: &str, port: u16) -> Result<bool> {
        self.transport.connect_to_peer(host, port).await
    }

    pub fn add_peer(&self, addr: SocketAddr) -> Result<bool> {
        self.transport.add_peer(addr)
    }

    pub fn remove_peer(&self, addr: &SocketAddr) -> bool {
        self.transport.remove_peer(addr)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.transport.peers()
    }

    /// Handle to the transport, e.g. for stopping from another task
    pub fn transport(&self) -> Arc<PeerTransport> {
        self.transport.clone()
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    pub fn attestation(&self) -> &AttestationLayer {
        &self.attestation
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Id of the last round started (0 before the first)
    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn stats(&self) -> ConsensusStats {
        let mut stats = self.stats.read().clone();
        stats.known_peers = self.transport.peer_count();
        stats
    }

    /// Run one round with the collaborator's target and semantic score.
    ///
    /// Errors only on bad input (dimension, non-finite values, score out of
    /// range). Unreachable peers, rejected fragments and an expired
    /// collection window all leave the round to finish with what it has.
    pub async fn run_round(
        &mut self,
        target: &[f64],
        semantic_score: f64,
    ) -> Result<RoundOutcome> {
        ConsensusError::check_dimension(self.engine.dimension(), target.len())?;
        if target.iter().any(|x| !x.is_finite()) {
            return Err(ConsensusError::NonFiniteValue);
        }
        if !(0.0..=1.0).contains(&semantic_score) {
            return Err(ConsensusError::InvalidConfig(format!(
                "semantic score {} outside [0, 1]",
                semantic_score
            )));
        }

        self.round_id += 1;
        let round_id = self.round_id;
        let mut round = ConsensusRound::new(round_id);
        let w_before = self.engine.consensus_state().to_vec();

        // LOCAL_STEP
        let reference = self.engine.proximal_target(target)?;
        let theta = self.engine.local_step(target)?;
        round.set_local_theta(theta.clone());

        // BROADCAST
        round.advance(RoundPhase::Broadcast);
        let fragment = self
            .attestation
            .generate_fragment(&reference, &theta, semantic_score)?;
        let message = WireMessage::AdmmUpdate(AdmmUpdate {
            round_id,
            node_id: self.config.node_id.clone(),
            listen_addr: self.transport.local_addr(),
            theta: theta.clone(),
            fragment,
        });
        let report = self.transport.broadcast(&message).await?;

        // COLLECT
        round.advance(RoundPhase::Collect);
        let expected = self.transport.peer_count();
        let deadline = Instant::now() + self.config.round_timeout();
        let quorum = round
            .collect(
                &mut self.inbox,
                &self.config.node_id,
                &self.attestation,
                expected,
                deadline,
            )
            .await;

        // AGGREGATE
        round.advance(RoundPhase::Aggregate);
        let candidates = round.candidates();
        let aggregated_state = self.engine.global_update(&candidates)?;

        // DUAL_UPDATE
        round.advance(RoundPhase::DualUpdate);
        self.engine.dual_update();
        let residuals = self.engine.residuals(&w_before)?;

        // ATTEST
        round.advance(RoundPhase::Attest);
        let attestation = self
            .attestation
            .generate_fragment(&w_before, &theta, semantic_score)?;
        let confidence = self.attestation.aggregate_attestations(
            round
                .received_fragments()
                .values()
                .chain(std::iter::once(&attestation)),
        );

        round.advance(RoundPhase::Done);
        let outcome = RoundOutcome {
            round_id,
            mean: mean(&aggregated_state),
            aggregated_state,
            confidence,
            accepted: candidates.len(),
            rejected: round.rejected(),
            quorum,
            residuals,
            converged: residuals.converged(self.config.epsilon),
            attestation,
        };

        {
            let mut stats = self.stats.write();
            stats.rounds_completed += 1;
            stats.updates_accepted += (candidates.len() - 1) as u64;
            stats.fragments_rejected += round.rejected() as u64;
            if quorum == Quorum::Partial {
                stats.partial_rounds += 1;
            }
            stats.last_confidence = confidence;
        }

        tracing::debug!(
            round_id,
            delivered = report.delivered,
            unreachable = report.failed.len(),
            primal = residuals.primal,
            dual = residuals.dual,
            "Round complete"
        );

        Ok(outcome)
    }

    /// Repeat rounds until the residuals drop below `epsilon` or
    /// `max_iterations` rounds have run. Hitting the limit is not an error;
    /// the last outcome is returned with `converged == false`.
    pub async fn run_until_converged(
        &mut self,
        target: &[f64],
        semantic_score: f64,
    ) -> Result<RoundOutcome> {
        let mut iteration = 0;
        loop {
            iteration += 1;
            let outcome = self.run_round(target, semantic_score).await?;
            if outcome.converged {
                tracing::info!("Converged after {} rounds", iteration);
                return Ok(outcome);
            }
            if iteration >= self.config.max_iterations {
                tracing::info!(
                    "Stopping after {} rounds without convergence (primal {:.3e}, dual {:.3e})",
                    iteration,
                    outcome.residuals.primal,
                    outcome.residuals.dual
                );
                return Ok(outcome);
            }
        }
    }
}

/// Builder for ConsensusNode
pub struct ConsensusNodeBuilder {
    config: NodeConfig,
}

impl ConsensusNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    /// Start from an existing configuration
    pub fn with_config(config: NodeConfig) -> Self {
        Self { config }
    }

    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = id.into();
        self
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    pub fn dimension(mut self, dimension: usize) -> Self {
        self.config.dimension = dimension;
        self
    }

    pub fn rho(mut self, rho: f64) -> Self {
        self.config.rho = rho;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.config.alpha = alpha;
        self
    }

    pub fn aggregator(mut self, aggregator: Aggregator) -> Self {
        self.config.aggregator = aggregator;
        self
    }

    pub fn round_timeout_ms(mut self, ms: u64) -> Self {
        self.config.round_timeout_ms = ms;
        self
    }

    pub fn io_timeout_ms(mut self, ms: u64) -> Self {
        self.config.io_timeout_ms = ms;
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.config.max_iterations = n;
        self
    }

    pub fn build(self) -> Result<ConsensusNode> {
        ConsensusNode::new(self.config)
    }
}

impl Default for ConsensusNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
