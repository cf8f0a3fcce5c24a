//! Metropolis–Hastings sampling of the individual posterior.
//!
//! Each chain applies three proposal kernels per iteration: an independence
//! kernel drawing whole vectors from the prior's covariance shape, a
//! componentwise random-walk kernel over random index subsets, and a
//! multivariate kernel moving contiguous blocks jointly. The random-walk
//! kernels share per-effect step sizes that adapt multiplicatively toward a
//! target acceptance probability after every kernel pass.
//!
//! Chains are logically independent: each owns its random stream and
//! step-size state, so parallel execution changes wall-clock time only.

use nalgebra::DVector;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::data::Subject;
use crate::error::EstimationError;
use crate::estimator::{Objective, PosteriorSample, Workspace};
use crate::model::{Interpolation, ModelEvaluator, PriorModel};

/// Floor for adapted step sizes.
const MIN_STEP_SIZE: f64 = 1e-10;

/// Settings for the MCMC sampler
#[derive(Debug, Clone)]
pub struct McmcSettings {
    /// Iterations discarded from the start of every chain
    pub burn_in: usize,
    /// Iterations kept per chain
    pub n_iter: usize,
    /// Number of independent chains
    pub n_chains: usize,
    /// Sub-iterations of the (independence, random-walk, multivariate)
    /// kernels per iteration
    pub n_kernel: (usize, usize, usize),
    /// Target acceptance probability for the adaptive kernels
    pub target_acceptance: f64,
    /// Multiplicative step-size adaptation rate
    pub adaptation_rate: f64,
    /// Largest random block size used by kernels 2 and 3
    pub nb_max: usize,
    /// Base seed; chain `c` uses `seed + c`
    pub seed: u64,
    /// Covariate interpolation mode forwarded to the structural model
    pub interpolation: Interpolation,
}

impl Default for McmcSettings {
    fn default() -> Self {
        McmcSettings {
            burn_in: 50,
            n_iter: 1000,
            n_chains: 4,
            n_kernel: (2, 2, 2),
            target_acceptance: 0.3,
            adaptation_rate: 0.4,
            nb_max: 3,
            seed: 42,
            interpolation: Interpolation::Locf,
        }
    }
}

/// Aggregate acceptance rates observed after burn-in, across all chains
#[derive(Debug, Clone, Copy, Default)]
pub struct McmcDiagnostics {
    /// Acceptance rate of the independence kernel
    pub independence_acceptance: f64,
    /// Acceptance rate of the componentwise random-walk kernel
    pub random_walk_acceptance: f64,
    /// Acceptance rate of the multivariate block kernel
    pub multivariate_acceptance: f64,
}

/// Metropolis–Hastings sampler for one subject under one prior
///
/// Supports IIV-only models; priors with inter-occasion variability are
/// rejected with a pointer to the [SIR sampler](crate::estimator::SirSampler).
pub struct McmcSampler<'a, M: ModelEvaluator> {
    prior: &'a PriorModel<M>,
    subject: &'a Subject,
    settings: McmcSettings,
}

/// Chain-local mutable state threaded through every kernel call
struct ChainState {
    eta: DVector<f64>,
    data_term: f64,
    prior_term: f64,
    step_sizes: DVector<f64>,
    rng: StdRng,
}

/// Post-burn-in acceptance tallies for one chain
#[derive(Default, Clone, Copy)]
struct AcceptanceCounts {
    independence: (usize, usize),
    random_walk: (usize, usize),
    multivariate: (usize, usize),
}

impl<'a, M: ModelEvaluator> McmcSampler<'a, M> {
    /// Create a sampler with default settings
    pub fn new(prior: &'a PriorModel<M>, subject: &'a Subject) -> Self {
        McmcSampler {
            prior,
            subject,
            settings: McmcSettings::default(),
        }
    }

    /// Replace the settings
    pub fn with_settings(mut self, settings: McmcSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run all chains and return the pooled posterior sample
    pub fn sample(&self) -> Result<PosteriorSample, EstimationError> {
        Ok(self.sample_with_diagnostics()?.0)
    }

    /// Run all chains, returning the pooled sample and acceptance diagnostics
    pub fn sample_with_diagnostics(
        &self,
    ) -> Result<(PosteriorSample, McmcDiagnostics), EstimationError> {
        if self.prior.has_iov() {
            return Err(EstimationError::UnsupportedConfiguration(
                "the MCMC sampler does not support inter-occasion variability; \
                 use the SIR sampler for IOV models"
                    .to_string(),
            ));
        }

        let workspace = Workspace::prepare(self.prior, self.subject)?;
        let objective = Objective::new(
            self.prior,
            self.subject,
            &workspace,
            self.settings.interpolation,
        );
        let names = self.prior.omega().names().to_vec();
        let total = self.settings.n_chains * self.settings.n_iter;

        if workspace.dim() == 0 {
            let draws = Array2::zeros((total, workspace.n_full));
            return Ok((PosteriorSample::new(names, draws), McmcDiagnostics::default()));
        }

        let chains: Result<Vec<(Vec<DVector<f64>>, AcceptanceCounts)>, EstimationError> = (0
            ..self.settings.n_chains)
            .into_par_iter()
            .map(|chain| {
                self.run_chain(
                    &objective,
                    &workspace,
                    self.settings.seed.wrapping_add(chain as u64),
                )
            })
            .collect();
        let chains = chains?;

        // Discard burn-in and concatenate the remainder across chains.
        let mut draws = Array2::zeros((total, workspace.n_full));
        let mut row = 0;
        let mut counts = AcceptanceCounts::default();
        for (records, chain_counts) in chains {
            for record in records.into_iter().skip(self.settings.burn_in) {
                let full = workspace.scatter_eta(&record);
                for (col, &value) in full.iter().enumerate() {
                    draws[(row, col)] = value;
                }
                row += 1;
            }
            counts.independence.0 += chain_counts.independence.0;
            counts.independence.1 += chain_counts.independence.1;
            counts.random_walk.0 += chain_counts.random_walk.0;
            counts.random_walk.1 += chain_counts.random_walk.1;
            counts.multivariate.0 += chain_counts.multivariate.0;
            counts.multivariate.1 += chain_counts.multivariate.1;
        }

        let rate = |(accepted, proposed): (usize, usize)| {
            if proposed == 0 {
                0.0
            } else {
                accepted as f64 / proposed as f64
            }
        };
        let diagnostics = McmcDiagnostics {
            independence_acceptance: rate(counts.independence),
            random_walk_acceptance: rate(counts.random_walk),
            multivariate_acceptance: rate(counts.multivariate),
        };
        tracing::info!(
            "MCMC: {} chains x {} kept iterations, acceptance (ind/rw/mv) = \
             {:.3}/{:.3}/{:.3}",
            self.settings.n_chains,
            self.settings.n_iter,
            diagnostics.independence_acceptance,
            diagnostics.random_walk_acceptance,
            diagnostics.multivariate_acceptance
        );

        Ok((PosteriorSample::new(names, draws), diagnostics))
    }

    fn run_chain(
        &self,
        objective: &Objective<'_, M>,
        workspace: &Workspace,
        seed: u64,
    ) -> Result<(Vec<DVector<f64>>, AcceptanceCounts), EstimationError> {
        let dim = workspace.dim();
        let eta = DVector::zeros(dim);

        // Step sizes start at half the prior variance of each effect.
        let step_sizes =
            DVector::from_fn(dim, |i, _| 0.5 * workspace.covariance[(i, i)]);

        let mut state = ChainState {
            data_term: objective.data_term(&eta)?,
            prior_term: objective.prior_term(&eta),
            eta,
            step_sizes,
            rng: StdRng::seed_from_u64(seed),
        };

        let iterations = self.settings.burn_in + self.settings.n_iter;
        let mut records = Vec::with_capacity(iterations);
        let mut counts = AcceptanceCounts::default();

        for iteration in 0..iterations {
            let tally = iteration >= self.settings.burn_in;

            for _ in 0..self.settings.n_kernel.0 {
                let accepted = self.independence_kernel(objective, workspace, &mut state)?;
                if tally {
                    counts.independence.0 += accepted as usize;
                    counts.independence.1 += 1;
                }
            }
            for _ in 0..self.settings.n_kernel.1 {
                let (accepted, proposed) =
                    self.random_walk_kernel(objective, &mut state)?;
                if tally {
                    counts.random_walk.0 += accepted;
                    counts.random_walk.1 += proposed;
                }
            }
            for _ in 0..self.settings.n_kernel.2 {
                let (accepted, proposed) =
                    self.multivariate_kernel(objective, &mut state)?;
                if tally {
                    counts.multivariate.0 += accepted;
                    counts.multivariate.1 += proposed;
                }
            }

            // Record the post-accept state, unchanged on rejection.
            records.push(state.eta.clone());
        }

        Ok((records, counts))
    }

    /// Kernel 1: propose the whole vector from the prior's covariance shape
    ///
    /// The acceptance ratio uses the data term only; the prior term cancels
    /// because proposals are drawn from the prior itself.
    fn independence_kernel(
        &self,
        objective: &Objective<'_, M>,
        workspace: &Workspace,
        state: &mut ChainState,
    ) -> Result<bool, EstimationError> {
        let z: DVector<f64> = DVector::from_fn(workspace.dim(), |_, _| {
            StandardNormal.sample(&mut state.rng)
        });
        let candidate = &workspace.cholesky * z;
        let candidate_data = objective.data_term(&candidate)?;

        let log_ratio = -0.5 * (candidate_data - state.data_term);
        if state.rng.random::<f64>().ln() < log_ratio {
            state.prior_term = objective.prior_term(&candidate);
            state.data_term = candidate_data;
            state.eta = candidate;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Kernel 2: componentwise random walk over random index subsets
    ///
    /// For every block size up to `min(n, nb_max)` and every effect index,
    /// perturbs a uniformly chosen subset of effects by independent normal
    /// steps scaled by the per-effect step size, accepting on the full
    /// posterior ratio. Step sizes adapt after the pass.
    fn random_walk_kernel(
        &self,
        objective: &Objective<'_, M>,
        state: &mut ChainState,
    ) -> Result<(usize, usize), EstimationError> {
        let dim = state.eta.len();
        let max_block = dim.min(self.settings.nb_max);
        let mut accepted_per_effect = vec![0usize; dim];
        let mut proposed_per_effect = vec![0usize; dim];
        let mut accepted_total = 0;
        let mut proposed_total = 0;

        for block_size in 1..=max_block {
            for _ in 0..dim {
                let subset = rand::seq::index::sample(&mut state.rng, dim, block_size);
                let mut candidate = state.eta.clone();
                for index in subset.iter() {
                    let z: f64 = StandardNormal.sample(&mut state.rng);
                    candidate[index] += state.step_sizes[index] * z;
                }

                let accepted = self.metropolis_step(objective, state, candidate)?;
                proposed_total += 1;
                accepted_total += accepted as usize;
                for index in subset.iter() {
                    proposed_per_effect[index] += 1;
                    accepted_per_effect[index] += accepted as usize;
                }
            }
        }

        adapt_step_sizes(
            &mut state.step_sizes,
            &accepted_per_effect,
            &proposed_per_effect,
            self.settings.target_acceptance,
            self.settings.adaptation_rate,
        );

        Ok((accepted_total, proposed_total))
    }

    /// Kernel 3: joint moves over contiguous blocks of effects
    ///
    /// Sweeps contiguous chunks of each block size with vector-valued
    /// perturbations and a single accept/reject per chunk, then applies the
    /// same step-size adaptation as kernel 2.
    fn multivariate_kernel(
        &self,
        objective: &Objective<'_, M>,
        state: &mut ChainState,
    ) -> Result<(usize, usize), EstimationError> {
        let dim = state.eta.len();
        let max_block = dim.min(self.settings.nb_max);
        let mut accepted_per_effect = vec![0usize; dim];
        let mut proposed_per_effect = vec![0usize; dim];
        let mut accepted_total = 0;
        let mut proposed_total = 0;

        for block_size in 1..=max_block {
            let mut offset = 0;
            while offset < dim {
                let end = (offset + block_size).min(dim);
                let mut candidate = state.eta.clone();
                for index in offset..end {
                    let z: f64 = StandardNormal.sample(&mut state.rng);
                    candidate[index] += state.step_sizes[index] * z;
                }

                let accepted = self.metropolis_step(objective, state, candidate)?;
                proposed_total += 1;
                accepted_total += accepted as usize;
                for index in offset..end {
                    proposed_per_effect[index] += 1;
                    accepted_per_effect[index] += accepted as usize;
                }

                offset = end;
            }
        }

        adapt_step_sizes(
            &mut state.step_sizes,
            &accepted_per_effect,
            &proposed_per_effect,
            self.settings.target_acceptance,
            self.settings.adaptation_rate,
        );

        Ok((accepted_total, proposed_total))
    }

    /// Accept or reject a candidate on the full posterior ratio
    fn metropolis_step(
        &self,
        objective: &Objective<'_, M>,
        state: &mut ChainState,
        candidate: DVector<f64>,
    ) -> Result<bool, EstimationError> {
        let candidate_data = objective.data_term(&candidate)?;
        let candidate_prior = objective.prior_term(&candidate);
        let log_ratio = -0.5
            * ((candidate_data + candidate_prior) - (state.data_term + state.prior_term));

        if state.rng.random::<f64>().ln() < log_ratio {
            state.eta = candidate;
            state.data_term = candidate_data;
            state.prior_term = candidate_prior;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Multiplicative step-size adaptation toward the target acceptance rate
fn adapt_step_sizes(
    step_sizes: &mut DVector<f64>,
    accepted: &[usize],
    proposed: &[usize],
    target: f64,
    rate: f64,
) {
    for i in 0..step_sizes.len() {
        if proposed[i] == 0 {
            continue;
        }
        let acceptance = accepted[i] as f64 / proposed[i] as f64;
        step_sizes[i] =
            (step_sizes[i] * (1.0 + rate * (acceptance - target))).max(MIN_STEP_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::error_model::ErrorModel;
    use crate::model::{Omega, OneCompartmentIV, Sigma, Theta};

    fn subject() -> Subject {
        Subject::builder("mcmc")
            .bolus(0.0, 100.0, 0)
            .observation(1.0, 9.0, None)
            .observation(6.0, 5.5, None)
            .build()
    }

    fn prior(pi: Option<Omega>) -> PriorModel<OneCompartmentIV> {
        PriorModel::new(
            Theta::new(vec![("Cl", 1.0), ("Vc", 10.0)]),
            Omega::diagonal(vec![("Cl", 0.09), ("Vc", 0.04)]),
            Sigma::Single(vec![0.5]),
            pi,
            vec![],
            ErrorModel::additive(),
            OneCompartmentIV::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_iov_is_rejected_with_pointer_to_sir() {
        let prior = prior(Some(Omega::diagonal(vec![("Cl", 0.02)])));
        let subject = subject();
        let result = McmcSampler::new(&prior, &subject).sample();
        match result {
            Err(EstimationError::UnsupportedConfiguration(message)) => {
                assert!(message.contains("SIR"));
            }
            _ => panic!("expected an unsupported-configuration error"),
        }
    }

    #[test]
    fn test_sample_dimensions() {
        let prior = prior(None);
        let subject = subject();
        let settings = McmcSettings {
            burn_in: 5,
            n_iter: 20,
            n_chains: 2,
            ..Default::default()
        };
        let sample = McmcSampler::new(&prior, &subject)
            .with_settings(settings)
            .sample()
            .unwrap();

        assert_eq!(sample.draws().nrows(), 40);
        assert_eq!(sample.draws().ncols(), 2);
    }

    #[test]
    fn test_seed_reproducibility() {
        let prior = prior(None);
        let subject = subject();
        let settings = McmcSettings {
            burn_in: 5,
            n_iter: 20,
            n_chains: 2,
            ..Default::default()
        };

        let a = McmcSampler::new(&prior, &subject)
            .with_settings(settings.clone())
            .sample()
            .unwrap();
        let b = McmcSampler::new(&prior, &subject)
            .with_settings(settings)
            .sample()
            .unwrap();
        assert_eq!(a.draws(), b.draws());
    }

    #[test]
    fn test_step_size_adaptation_direction() {
        let mut step_sizes = DVector::from_vec(vec![0.1, 0.1]);
        // Effect 0 over-accepts, effect 1 under-accepts.
        adapt_step_sizes(&mut step_sizes, &[9, 0], &[10, 10], 0.3, 0.4);
        assert!(step_sizes[0] > 0.1);
        assert!(step_sizes[1] < 0.1);
    }
}
