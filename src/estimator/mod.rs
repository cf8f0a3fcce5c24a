pub mod covariance;
pub mod map;
pub mod mcmc;
pub mod objective;
pub mod sir;

pub use map::{MapEstimator, MapResult, MapSettings};
pub use mcmc::{McmcSampler, McmcSettings};
pub use objective::Objective;
pub use sir::{SirSampler, SirSettings};

use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::Array2;
use statrs::distribution::{ContinuousCDF, Normal};

use crate::data::Subject;
use crate::error::EstimationError;
use crate::model::{IndividualEffects, ModelEvaluator, PriorModel};

/// A posterior sample of individual random effects
///
/// Rows are draws, columns are the random effects in full omega order
/// (effects with zero prior variance stay at zero in every draw).
#[derive(Debug, Clone)]
pub struct PosteriorSample {
    names: Vec<String>,
    draws: Array2<f64>,
}

impl PosteriorSample {
    pub(crate) fn new(names: Vec<String>, draws: Array2<f64>) -> Self {
        PosteriorSample { names, draws }
    }

    /// Effect names, one per column
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The draws, one row per kept iteration
    pub fn draws(&self) -> &Array2<f64> {
        &self.draws
    }

    /// Number of draws
    pub fn len(&self) -> usize {
        self.draws.nrows()
    }

    /// Check whether the sample is empty
    pub fn is_empty(&self) -> bool {
        self.draws.nrows() == 0
    }

    /// Column-wise posterior mean
    pub fn mean(&self) -> Vec<f64> {
        let n = self.draws.nrows().max(1) as f64;
        (0..self.draws.ncols())
            .map(|col| self.draws.column(col).sum() / n)
            .collect()
    }
}

/// Per-call precomputation shared by all three estimators
///
/// Derives the nonzero-variance index set, the reduced (and, with IOV, the
/// block-merged) covariance matrix, its Cholesky factor and inverse, and the
/// symmetric search bounds used by the MAP estimator. Built once per
/// estimation call; the covariance inversion is never repeated per objective
/// evaluation.
pub(crate) struct Workspace {
    /// Indices of IIV effects with nonzero variance, into the full omega
    pub iiv_indices: Vec<usize>,
    /// Indices of IOV effects with nonzero variance, into the full pi matrix
    pub iov_indices: Vec<usize>,
    /// Full omega dimension
    pub n_full: usize,
    /// Full pi-matrix dimension (0 without IOV)
    pub n_full_iov: usize,
    /// Number of occasions in the subject's record
    pub n_occasions: usize,
    /// Reduced, possibly IOV-merged covariance
    pub covariance: DMatrix<f64>,
    /// Precomputed inverse of `covariance`
    pub inverse: DMatrix<f64>,
    /// Lower Cholesky factor of `covariance`
    pub cholesky: DMatrix<f64>,
    /// Symmetric per-effect search bound magnitudes (97.5% normal quantile)
    pub bounds: DVector<f64>,
}

impl Workspace {
    pub fn prepare<M: ModelEvaluator>(
        prior: &PriorModel<M>,
        subject: &Subject,
    ) -> Result<Self, EstimationError> {
        let omega = prior.omega();
        let iiv_indices = omega.nonzero_indices();
        let reduced = omega.reduced(&iiv_indices);
        let n_occasions = subject.n_occasions();

        let (iov_indices, n_full_iov, covariance) = match prior.pi_matrix() {
            Some(pi) if prior.has_iov() => {
                let iov_indices = pi.nonzero_indices();
                let pi_reduced = pi.reduced(&iov_indices);
                let merged = covariance::merge_iov(&reduced, &pi_reduced, n_occasions)?;
                (iov_indices, pi.dim(), merged)
            }
            _ => (Vec::new(), 0, reduced),
        };

        let cholesky =
            Cholesky::new(covariance.clone()).ok_or(EstimationError::SingularCovariance)?;
        let inverse = cholesky.inverse();
        let factor = cholesky.l();

        // One-sided 97.5% bound magnitude of a zero-mean normal with the
        // effect's prior variance, used as symmetric box constraints.
        let z = Normal::new(0.0, 1.0)
            .map_err(|e| EstimationError::InvalidPrior(e.to_string()))?
            .inverse_cdf(0.975);
        let bounds = DVector::from_fn(covariance.nrows(), |i, _| {
            z * covariance[(i, i)].sqrt()
        });

        Ok(Workspace {
            iiv_indices,
            iov_indices,
            n_full: omega.dim(),
            n_full_iov,
            n_occasions,
            covariance,
            inverse,
            cholesky: factor,
            bounds,
        })
    }

    /// Total reduced dimension (IIV plus replicated IOV blocks)
    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    /// Reduced IIV dimension
    pub fn n_iiv(&self) -> usize {
        self.iiv_indices.len()
    }

    /// Whether the workspace carries IOV blocks
    pub fn has_iov(&self) -> bool {
        !self.iov_indices.is_empty() && self.n_occasions > 1
    }

    /// Scatter a reduced vector into the [IndividualEffects] handed to the
    /// structural model
    ///
    /// The leading entries fill the nonzero-variance IIV effects; each
    /// trailing block of IOV entries maps deterministically to occasion
    /// `block + 1` (occasion 0 carries no separate deviation).
    pub fn scatter(&self, reduced: &DVector<f64>) -> IndividualEffects {
        let mut eta = DVector::zeros(self.n_full);
        for (k, &index) in self.iiv_indices.iter().enumerate() {
            eta[index] = reduced[k];
        }

        if self.has_iov() {
            let n_iiv = self.n_iiv();
            let n_iov = self.iov_indices.len();
            let mut kappa = DMatrix::zeros(self.n_occasions, self.n_full_iov);
            for occasion in 1..self.n_occasions {
                let offset = n_iiv + (occasion - 1) * n_iov;
                for (j, &index) in self.iov_indices.iter().enumerate() {
                    kappa[(occasion, index)] = reduced[offset + j];
                }
            }
            IndividualEffects::with_kappa(eta, kappa)
        } else {
            IndividualEffects::new(eta)
        }
    }

    /// Scatter the IIV part of a reduced vector into the full omega dimension
    pub fn scatter_eta(&self, reduced: &DVector<f64>) -> DVector<f64> {
        let mut eta = DVector::zeros(self.n_full);
        for (k, &index) in self.iiv_indices.iter().enumerate() {
            eta[index] = reduced[k];
        }
        eta
    }
}
