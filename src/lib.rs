//! Bayesian estimation of individual pharmacometric model parameters.
//!
//! Given a population prior (THETA, OMEGA, SIGMA, an optional IOV covariance,
//! a residual-error model and a structural model) and one subject's sparse
//! event record, this crate estimates the posterior of the subject's random
//! effects with three interchangeable strategies:
//!
//! - [`MapEstimator`]: maximum a posteriori point estimation with anomaly
//!   detection and adaptive restart
//! - [`McmcSampler`]: Metropolis–Hastings sampling with three adaptive
//!   proposal kernels (IIV-only models)
//! - [`SirSampler`]: sequential importance resampling from the prior
//!   (supports IOV models)
//!
//! The structural model is injected behind the [`ModelEvaluator`] trait, so
//! estimators are agnostic to how predictions are produced.
//!
//! # Example
//!
//! ```
//! use mapbayes::prelude::*;
//!
//! let subject = Subject::builder("patient_001")
//!     .bolus(0.0, 2000.0, 0)
//!     .observation(1.0, 25.0, None)
//!     .observation(14.0, 5.5, None)
//!     .build();
//!
//! let prior = PriorModel::new(
//!     Theta::new(vec![("Cl", 4.0), ("Vc", 70.0)]),
//!     Omega::diagonal(vec![("Cl", 0.09), ("Vc", 0.04)]),
//!     Sigma::Single(vec![0.5]),
//!     None,
//!     vec![],
//!     ErrorModel::additive(),
//!     OneCompartmentIV::new(),
//! )
//! .unwrap();
//!
//! let result = MapEstimator::new(&prior, &subject).estimate().unwrap();
//! assert!(result.ofv().is_finite());
//! ```

pub mod data;
pub mod error;
pub mod estimator;
pub mod model;

pub use crate::data::builder::SubjectBuilder;
pub use crate::data::parser::{build_subject, read_nonmem, EventRow};
pub use crate::data::{Covariate, Covariates, Event, Occasion, Subject};
pub use crate::estimator::{
    MapEstimator, MapResult, MapSettings, McmcSampler, McmcSettings, PosteriorSample,
    SirSampler, SirSettings,
};
pub use crate::model::{
    ErrorModel, IndividualEffects, Interpolation, ModelEvaluator, Omega, OneCompartmentIV,
    Prediction, PriorModel, Sigma, SubjectPredictions, Theta,
};
pub use error::EstimationError;

pub mod prelude {
    pub mod data {
        pub use crate::data::{
            builder::SubjectBuilder,
            parser::{build_subject, read_nonmem, EventRow},
            Covariate, Covariates, Event, Occasion, Subject,
        };
    }
    pub mod estimator {
        pub use crate::estimator::{
            MapEstimator, MapResult, MapSettings, McmcSampler, McmcSettings, PosteriorSample,
            SirSampler, SirSettings,
        };
    }
    pub mod model {
        pub use crate::model::{
            ErrorModel, IndividualEffects, Interpolation, ModelEvaluator, Omega,
            OneCompartmentIV, Prediction, PriorModel, Sigma, SubjectPredictions, Theta,
        };
    }

    pub use self::data::*;
    pub use self::estimator::*;
    pub use self::model::*;
    pub use crate::error::EstimationError;
}
