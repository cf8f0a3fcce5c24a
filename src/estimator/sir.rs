//! Sequential importance resampling of the individual posterior.
//!
//! The prior is the proposal: candidates are drawn from a zero-mean
//! multivariate normal under the (possibly IOV-merged) covariance, weighted
//! by the ratio of the posterior kernel to the proposal density, and
//! resampled with replacement in proportion to the normalized weights. Log
//! weights are stabilized by subtracting their maximum before
//! exponentiation.
//!
//! This is the sampler of choice for IOV models: the sampled vector carries
//! both the IIV effects and one KAPPA block per occasion beyond the first,
//! and each block is broadcast back onto its occasion before evaluation.

use nalgebra::DVector;
use ndarray::Array2;
use rand::distr::weighted::WeightedIndex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::data::Subject;
use crate::error::EstimationError;
use crate::estimator::{Objective, PosteriorSample, Workspace};
use crate::model::{Interpolation, ModelEvaluator, PriorModel, SubjectPredictions};

/// Settings for the SIR sampler
#[derive(Debug, Clone)]
pub struct SirSettings {
    /// Number of candidates drawn from the prior (S-step)
    pub n_sample: usize,
    /// Number of draws resampled from the weighted candidates (R-step)
    pub n_resample: usize,
    /// Seed for the sampling and resampling random stream
    pub seed: u64,
    /// Covariate interpolation mode forwarded to the structural model
    pub interpolation: Interpolation,
}

impl Default for SirSettings {
    fn default() -> Self {
        SirSettings {
            n_sample: 100_000,
            n_resample: 1_000,
            seed: 42,
            interpolation: Interpolation::Locf,
        }
    }
}

/// SIR sampler for one subject under one prior
pub struct SirSampler<'a, M: ModelEvaluator> {
    prior: &'a PriorModel<M>,
    subject: &'a Subject,
    settings: SirSettings,
}

impl<'a, M: ModelEvaluator> SirSampler<'a, M> {
    /// Create a sampler with default settings
    pub fn new(prior: &'a PriorModel<M>, subject: &'a Subject) -> Self {
        SirSampler {
            prior,
            subject,
            settings: SirSettings::default(),
        }
    }

    /// Replace the settings
    pub fn with_settings(mut self, settings: SirSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run the sampler and return the resampled posterior
    ///
    /// The public sample carries the IIV dimensions only; for IOV models the
    /// per-occasion KAPPA draws stay internal (see
    /// [sample_with_predictions](Self::sample_with_predictions)).
    pub fn sample(&self) -> Result<PosteriorSample, EstimationError> {
        Ok(self.run()?.0)
    }

    /// Run the sampler and additionally resolve the structural model at the
    /// posterior-mean effects, including any retained IOV deviations
    pub fn sample_with_predictions(
        &self,
    ) -> Result<(PosteriorSample, SubjectPredictions), EstimationError> {
        let (sample, resampled, workspace) = self.run()?;

        // Posterior-mean reduced vector, IOV blocks included.
        let dim = workspace.dim();
        let mut mean = DVector::zeros(dim);
        for candidate in &resampled {
            mean += candidate;
        }
        if !resampled.is_empty() {
            mean /= resampled.len() as f64;
        }

        let effects = workspace.scatter(&mean);
        let grid = self.subject.expand(0.1, 1.0);
        let predictions = self.prior.model().evaluate(
            self.prior.theta(),
            &effects,
            &grid,
            self.settings.interpolation,
        )?;
        Ok((sample, predictions))
    }

    fn run(
        &self,
    ) -> Result<(PosteriorSample, Vec<DVector<f64>>, Workspace), EstimationError> {
        let workspace = Workspace::prepare(self.prior, self.subject)?;
        let objective = Objective::new(
            self.prior,
            self.subject,
            &workspace,
            self.settings.interpolation,
        );
        let names = self.prior.omega().names().to_vec();
        let dim = workspace.dim();

        if dim == 0 {
            let draws = Array2::zeros((self.settings.n_resample, workspace.n_full));
            return Ok((PosteriorSample::new(names, draws), Vec::new(), workspace));
        }

        let mut rng = StdRng::seed_from_u64(self.settings.seed);

        // S-step: candidates from the prior's covariance shape.
        let candidates: Vec<DVector<f64>> = (0..self.settings.n_sample)
            .map(|_| {
                let z: DVector<f64> =
                    DVector::from_fn(dim, |_, _| StandardNormal.sample(&mut rng));
                &workspace.cholesky * z
            })
            .collect();

        // I-step: log importance weight of every candidate, evaluated in
        // parallel since candidates are independent.
        let log_weights: Result<Vec<f64>, EstimationError> = candidates
            .par_iter()
            .map(|candidate| {
                Ok(objective.log_target(candidate)? - objective.log_prior(candidate))
            })
            .collect();
        let log_weights = log_weights?;

        // Stabilize by the maximum before exponentiating, then renormalize.
        let max_log_weight = log_weights
            .iter()
            .fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let mut weights: Vec<f64> = log_weights
            .iter()
            .map(|&lw| (lw - max_log_weight).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        for weight in weights.iter_mut() {
            *weight /= total;
        }

        let effective = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();
        tracing::info!(
            "SIR: {} candidates, effective sample size {:.1}, resampling {}",
            self.settings.n_sample,
            effective,
            self.settings.n_resample
        );

        // R-step: resample with replacement in proportion to the weights.
        let index = WeightedIndex::new(&weights)
            .map_err(|e| EstimationError::Optimization(format!("resampling failed: {}", e)))?;
        let resampled: Vec<DVector<f64>> = (0..self.settings.n_resample)
            .map(|_| candidates[index.sample(&mut rng)].clone())
            .collect();

        // Public result: IIV dimensions scattered back to full omega order.
        let mut draws = Array2::zeros((self.settings.n_resample, workspace.n_full));
        for (row, candidate) in resampled.iter().enumerate() {
            let full = workspace.scatter_eta(candidate);
            for (col, &value) in full.iter().enumerate() {
                draws[(row, col)] = value;
            }
        }

        Ok((PosteriorSample::new(names, draws), resampled, workspace))
    }
}
