use std::collections::HashMap;

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::EstimationError;
use crate::model::error_model::ErrorModel;
use crate::model::ModelEvaluator;

/// Named population fixed-effect estimates (THETA)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theta {
    names: Vec<String>,
    values: Vec<f64>,
}

impl Theta {
    /// Create fixed effects from (name, estimate) pairs
    pub fn new(entries: Vec<(impl Into<String>, f64)>) -> Self {
        let (names, values) = entries
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .unzip();
        Theta { names, values }
    }

    /// Get a fixed effect by name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    /// Names, in declaration order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Values, in declaration order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Number of fixed effects
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if there are no fixed effects
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An axis-labeled symmetric covariance matrix over random effects
///
/// Used for both the IIV covariance (OMEGA) and, in IOV models, the
/// inter-occasion covariance (the PI matrix over KAPPA effects). Diagonal
/// entries of zero mark effects with no variability; those effects are
/// excluded from estimation and their ETA is pinned to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Omega {
    names: Vec<String>,
    matrix: DMatrix<f64>,
}

impl Omega {
    /// Create a covariance matrix from labels and a full symmetric matrix
    pub fn new(
        names: Vec<impl Into<String>>,
        matrix: DMatrix<f64>,
    ) -> Result<Self, EstimationError> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if matrix.nrows() != matrix.ncols() || matrix.nrows() != names.len() {
            return Err(EstimationError::InvalidPrior(format!(
                "covariance matrix is {}x{} but {} names were given",
                matrix.nrows(),
                matrix.ncols(),
                names.len()
            )));
        }
        let max_asymmetry = (&matrix - matrix.transpose()).abs().max();
        if max_asymmetry > 1e-10 {
            return Err(EstimationError::InvalidPrior(
                "covariance matrix is not symmetric".to_string(),
            ));
        }
        Ok(Omega { names, matrix })
    }

    /// Create a diagonal covariance matrix from (name, variance) pairs
    pub fn diagonal(entries: Vec<(impl Into<String>, f64)>) -> Self {
        let (names, variances): (Vec<String>, Vec<f64>) = entries
            .into_iter()
            .map(|(name, variance)| (name.into(), variance))
            .unzip();
        let matrix = DMatrix::from_diagonal(&DVector::from_vec(variances));
        Omega { names, matrix }
    }

    /// Effect names, in matrix order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The full covariance matrix
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Dimension of the full matrix
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// Indices of effects with nonzero prior variance
    pub fn nonzero_indices(&self) -> Vec<usize> {
        (0..self.dim())
            .filter(|&i| self.matrix[(i, i)] > 0.0)
            .collect()
    }

    /// The covariance matrix restricted to the given indices
    pub fn reduced(&self, indices: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(indices.len(), indices.len(), |r, c| {
            self.matrix[(indices[r], indices[c])]
        })
    }
}

/// Residual-error parameters (SIGMA)
///
/// Either one parameter vector shared by all observations, or one vector per
/// named endpoint for multi-endpoint models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Sigma {
    /// A single parameter vector for single-endpoint models
    Single(Vec<f64>),
    /// One parameter vector per endpoint label
    PerEndpoint(HashMap<String, Vec<f64>>),
}

impl Sigma {
    /// Get the parameter vector for an endpoint
    ///
    /// Single-endpoint parameters apply to every endpoint label.
    pub fn for_endpoint(&self, endpoint: Option<&str>) -> Option<&[f64]> {
        match self {
            Sigma::Single(params) => Some(params),
            Sigma::PerEndpoint(map) => endpoint.and_then(|label| map.get(label)).map(Vec::as_slice),
        }
    }
}

/// The immutable population prior consumed by all estimators
///
/// Bundles the fixed-effect estimates, the random-effects covariance
/// structure, the residual-error model and the structural model handle. The
/// structural model is injected as a capability: estimators only ever call
/// [`ModelEvaluator::evaluate`] on it.
pub struct PriorModel<M: ModelEvaluator> {
    theta: Theta,
    omega: Omega,
    sigma: Sigma,
    pi_matrix: Option<Omega>,
    covariates: Vec<String>,
    error_model: ErrorModel,
    model: M,
}

impl<M: ModelEvaluator> PriorModel<M> {
    /// Assemble and validate a prior model
    ///
    /// # Errors
    ///
    /// Returns [`EstimationError::InvalidPrior`] when theta and omega names
    /// disagree, or when a per-endpoint error model and per-endpoint sigma
    /// do not cover the same endpoints.
    pub fn new(
        theta: Theta,
        omega: Omega,
        sigma: Sigma,
        pi_matrix: Option<Omega>,
        covariates: Vec<String>,
        error_model: ErrorModel,
        model: M,
    ) -> Result<Self, EstimationError> {
        for name in omega.names() {
            if theta.get(name).is_none() {
                return Err(EstimationError::InvalidPrior(format!(
                    "random effect '{}' has no matching fixed effect",
                    name
                )));
            }
        }
        if let (ErrorModel::PerEndpoint(functions), Sigma::PerEndpoint(params)) =
            (&error_model, &sigma)
        {
            for endpoint in functions.keys() {
                if !params.contains_key(endpoint) {
                    return Err(EstimationError::InvalidPrior(format!(
                        "endpoint '{}' has an error function but no sigma parameters",
                        endpoint
                    )));
                }
            }
        }
        Ok(PriorModel {
            theta,
            omega,
            sigma,
            pi_matrix,
            covariates,
            error_model,
            model,
        })
    }

    /// The population fixed effects
    pub fn theta(&self) -> &Theta {
        &self.theta
    }

    /// The IIV covariance matrix
    pub fn omega(&self) -> &Omega {
        &self.omega
    }

    /// The residual-error parameters
    pub fn sigma(&self) -> &Sigma {
        &self.sigma
    }

    /// The IOV covariance matrix, if the model has inter-occasion variability
    pub fn pi_matrix(&self) -> Option<&Omega> {
        self.pi_matrix.as_ref()
    }

    /// Covariate names referenced by the structural model
    pub fn covariates(&self) -> &[String] {
        &self.covariates
    }

    /// The residual-error model
    pub fn error_model(&self) -> &ErrorModel {
        &self.error_model
    }

    /// The structural model evaluator
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Whether the prior carries inter-occasion variability
    pub fn has_iov(&self) -> bool {
        self.pi_matrix
            .as_ref()
            .map(|pi| !pi.nonzero_indices().is_empty())
            .unwrap_or(false)
    }

    /// Draw `n_simul` ETA vectors from the prior
    ///
    /// Returns a matrix with one row per draw in the full omega dimension;
    /// effects with zero prior variance stay at zero. For `n_simul == 0` a
    /// single all-zero row is returned, i.e. the population-typical
    /// individual with no random variation.
    pub fn sample_eta(&self, n_simul: usize, seed: u64) -> Result<DMatrix<f64>, EstimationError> {
        let dim = self.omega.dim();
        if n_simul == 0 {
            return Ok(DMatrix::zeros(1, dim));
        }

        let indices = self.omega.nonzero_indices();
        let reduced = self.omega.reduced(&indices);
        let cholesky =
            Cholesky::new(reduced).ok_or(EstimationError::SingularCovariance)?;
        let factor = cholesky.l();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut draws = DMatrix::zeros(n_simul, dim);
        for row in 0..n_simul {
            let z: DVector<f64> =
                DVector::from_fn(indices.len(), |_, _| StandardNormal.sample(&mut rng));
            let eta = &factor * z;
            for (k, &index) in indices.iter().enumerate() {
                draws[(row, index)] = eta[k];
            }
        }
        Ok(draws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::analytical::OneCompartmentIV;
    use crate::model::error_model::ErrorModel;

    fn prior() -> PriorModel<OneCompartmentIV> {
        PriorModel::new(
            Theta::new(vec![("Cl", 4.0), ("Vc", 70.0)]),
            Omega::diagonal(vec![("Cl", 0.09), ("Vc", 0.04)]),
            Sigma::Single(vec![0.5]),
            None,
            vec![],
            ErrorModel::additive(),
            OneCompartmentIV::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_simulations_yield_zero_etas() {
        let draws = prior().sample_eta(0, 42).unwrap();
        assert_eq!(draws.nrows(), 1);
        assert!(draws.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sampled_etas_are_seed_reproducible() {
        let prior = prior();
        let a = prior.sample_eta(25, 7).unwrap();
        let b = prior.sample_eta(25, 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_variance_effects_stay_zero() {
        let prior = PriorModel::new(
            Theta::new(vec![("Cl", 4.0), ("Vc", 70.0)]),
            Omega::diagonal(vec![("Cl", 0.09), ("Vc", 0.0)]),
            Sigma::Single(vec![0.5]),
            None,
            vec![],
            ErrorModel::additive(),
            OneCompartmentIV::new(),
        )
        .unwrap();

        let draws = prior.sample_eta(10, 3).unwrap();
        for row in 0..draws.nrows() {
            assert_eq!(draws[(row, 1)], 0.0);
            assert_ne!(draws[(row, 0)], 0.0);
        }
    }

    #[test]
    fn test_mismatched_names_rejected() {
        let result = PriorModel::new(
            Theta::new(vec![("Cl", 4.0)]),
            Omega::diagonal(vec![("Vc", 0.04)]),
            Sigma::Single(vec![0.5]),
            None,
            vec![],
            ErrorModel::additive(),
            OneCompartmentIV::new(),
        );
        assert!(matches!(result, Err(EstimationError::InvalidPrior(_))));
    }

    #[test]
    fn test_asymmetric_omega_rejected() {
        let matrix = DMatrix::from_row_slice(2, 2, &[0.09, 0.02, 0.01, 0.04]);
        assert!(Omega::new(vec!["Cl", "Vc"], matrix).is_err());
    }
}
