//! ADMM consensus engine - local, global and dual updates
//!
//! Each node minimizes its share of
//! `Σ α_i f_i(θ_i) + Γ Ω(w)` subject to `θ_i = w`, alternating:
//! - local step: proximal pull of θ toward the collaborator's target
//! - global step: robust aggregate of peer θ's, regularized and projected
//! - dual step: u accumulates the disagreement θ - w

use crate::error::{ConsensusError, Result};
use crate::types::{Aggregator, NodeConfig};

/// Primal and dual residuals after a round
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Residuals {
    /// ‖θ - w‖₂
    pub primal: f64,
    /// ρ·‖w_new - w_old‖₂
    pub dual: f64,
}

impl Residuals {
    pub fn converged(&self, epsilon: f64) -> bool {
        self.primal < epsilon && self.dual < epsilon
    }
}

/// Per-node optimization state
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    dimension: usize,
    /// Local decision
    theta: Vec<f64>,
    /// Global consensus estimate
    w: Vec<f64>,
    /// Dual variable
    u: Vec<f64>,
    rho: f64,
    alpha: f64,
    aggregator: Aggregator,
    regularization: f64,
    feasible_radius: Option<f64>,
}

impl ConsensusEngine {
    /// Zeroed state with the tuning from `config`
    pub fn new(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dimension: config.dimension,
            theta: vec![0.0; config.dimension],
            w: vec![0.0; config.dimension],
            u: vec![0.0; config.dimension],
            rho: config.rho,
            alpha: config.alpha,
            aggregator: config.aggregator,
            regularization: config.regularization,
            feasible_radius: config.feasible_radius,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Change the trust weight between rounds
    pub fn set_alpha(&mut self, alpha: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(ConsensusError::InvalidConfig(format!(
                "alpha {} outside [0, 1]",
                alpha
            )));
        }
        self.alpha = alpha;
        Ok(())
    }

    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    /// Current global consensus estimate
    pub fn consensus_state(&self) -> &[f64] {
        &self.w
    }

    pub fn dual(&self) -> &[f64] {
        &self.u
    }

    /// `α·target + (1-α)·(w - u)` without touching state
    pub fn proximal_target(&self, target: &[f64]) -> Result<Vec<f64>> {
        ConsensusError::check_dimension(self.dimension, target.len())?;
        let alpha = self.alpha;
        Ok(target
            .iter()
            .zip(self.w.iter().zip(&self.u))
            .map(|(t, (w, u))| alpha * t + (1.0 - alpha) * (w - u))
            .collect())
    }

    /// Local step: pull θ toward the target, regularized by w - u
    pub fn local_step(&mut self, target: &[f64]) -> Result<Vec<f64>> {
        self.theta = self.proximal_target(target)?;
        Ok(self.theta.clone())
    }

    /// Global step over the accepted θ's (own included).
    ///
    /// `w = Π_C(A(candidates) - (Γ/ρ)·w_old)` where `A` is the configured
    /// robust statistic. The result depends only on the multiset of
    /// candidates. State is untouched on error.
    pub fn global_update(&mut self, candidates: &[Vec<f64>]) -> Result<Vec<f64>> {
        if candidates.is_empty() {
            return Err(ConsensusError::EmptyCandidateSet);
        }
        for candidate in candidates {
            ConsensusError::check_dimension(self.dimension, candidate.len())?;
            if candidate.iter().any(|x| !x.is_finite()) {
                return Err(ConsensusError::NonFiniteValue);
            }
        }

        let mut next = robust_aggregate(self.aggregator, candidates, self.dimension);

        if self.regularization > 0.0 {
            // ∇Ω(w) = w for Ω(w) = ½‖w‖²
            let step = self.regularization / self.rho;
            for (x, w) in next.iter_mut().zip(&self.w) {
                *x -= step * w;
            }
        }

        if let Some(radius) = self.feasible_radius {
            project_onto_ball(&mut next, radius);
        }

        self.w = next;
        Ok(self.w.clone())
    }

    /// Dual step: `u = u + θ - w`
    pub fn dual_update(&mut self) -> Vec<f64> {
        for ((u, theta), w) in self.u.iter_mut().zip(&self.theta).zip(&self.w) {
            *u += theta - w;
        }
        self.u.clone()
    }

    /// Residuals relative to the estimate before the last global step
    pub fn residuals(&self, w_old: &[f64]) -> Result<Residuals> {
        ConsensusError::check_dimension(self.dimension, w_old.len())?;
        Ok(Residuals {
            primal: distance(&self.theta, &self.w),
            dual: self.rho * distance(&self.w, w_old),
        })
    }
}

/// Coordinate-wise robust statistic. Candidates must all have `dimension`
/// finite entries.
pub fn robust_aggregate(
    aggregator: Aggregator,
    candidates: &[Vec<f64>],
    dimension: usize,
) -> Vec<f64> {
    let mut column = Vec::with_capacity(candidates.len());
    (0..dimension)
        .map(|i| {
            column.clear();
            column.extend(candidates.iter().map(|c| c[i]));
            column.sort_by(f64::total_cmp);
            match aggregator {
                Aggregator::Median => median_of_sorted(&column),
                Aggregator::TrimmedMean { trim_fraction } => {
                    trimmed_mean_of_sorted(&column, trim_fraction)
                }
            }
        })
        .collect()
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn trimmed_mean_of_sorted(sorted: &[f64], trim_fraction: f64) -> f64 {
    let n = sorted.len();
    let mut trim = (n as f64 * trim_fraction).floor() as usize;
    // Always keep at least one value
    if 2 * trim >= n {
        trim = (n - 1) / 2;
    }
    let kept = &sorted[trim..n - trim];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Project onto the L2 ball of `radius` around the origin
fn project_onto_ball(v: &mut [f64], radius: f64) {
    let norm = l2_norm(v);
    if norm > radius {
        let scale = radius / norm;
        v.iter_mut().for_each(|x| *x *= scale);
    }
}

pub(crate) fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

pub(crate) fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
