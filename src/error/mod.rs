use thiserror::Error;

use crate::data::parser::DatasetError;

/// Errors raised during individual parameter estimation.
#[derive(Error, Debug)]
pub enum EstimationError {
    /// The random-effects covariance matrix could not be inverted.
    #[error("random-effects covariance matrix is singular and cannot be inverted")]
    SingularCovariance,

    /// The structural model evaluator failed for a candidate parameter vector.
    ///
    /// The MAP estimator recovers from this by retrying from a new starting
    /// point; the MCMC and SIR samplers propagate it.
    #[error("structural model evaluation failed: {0}")]
    ModelEvaluation(String),

    /// Incompatible matrix dimensions while merging IIV and IOV covariances.
    #[error("dimension mismatch in covariance merge: {context}")]
    Dimension { context: String },

    /// The requested estimator does not support this model configuration.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// An observation references an endpoint with no matching error function.
    #[error("no error model defined for endpoint '{0}'")]
    MissingEndpoint(String),

    /// The prior model failed validation.
    #[error("invalid prior model: {0}")]
    InvalidPrior(String),

    /// The local optimizer failed in a way the retry policy could not absorb.
    #[error("optimization failed: {0}")]
    Optimization(String),

    /// The individual dataset could not be read or parsed.
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
}
