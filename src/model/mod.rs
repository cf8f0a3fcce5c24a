pub mod analytical;
pub mod error_model;
pub mod prior;

pub use analytical::OneCompartmentIV;
pub use error_model::{ErrorFn, ErrorModel};
pub use prior::{Omega, PriorModel, Sigma, Theta};

use nalgebra::{DMatrix, DVector};

use crate::data::Subject;
use crate::error::EstimationError;

/// Covariate interpolation mode forwarded to the structural model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    /// Last observation carried forward
    #[default]
    Locf,
    /// Linear interpolation between covariate observations
    Linear,
}

/// The individual random effects handed to the structural model
///
/// `eta` always has the full dimensionality of the prior's omega matrix, with
/// zeros for effects excluded from estimation. For IOV models, `kappa` holds
/// one row per occasion in the subject's record; row 0 is all zeros because
/// the first occasion's inter-occasion deviation is absorbed into `eta`.
#[derive(Debug, Clone)]
pub struct IndividualEffects {
    eta: DVector<f64>,
    kappa: Option<DMatrix<f64>>,
}

impl IndividualEffects {
    /// Effects without inter-occasion variability
    pub fn new(eta: DVector<f64>) -> Self {
        IndividualEffects { eta, kappa: None }
    }

    /// Effects with per-occasion inter-occasion deviations
    pub fn with_kappa(eta: DVector<f64>, kappa: DMatrix<f64>) -> Self {
        IndividualEffects {
            eta,
            kappa: Some(kappa),
        }
    }

    /// The inter-individual random effects, in omega order
    pub fn eta(&self) -> &DVector<f64> {
        &self.eta
    }

    /// The inter-occasion deviation for a given occasion index, if the model
    /// has IOV
    pub fn kappa(&self, occasion: usize) -> Option<DVector<f64>> {
        self.kappa
            .as_ref()
            .map(|kappa| kappa.row(occasion.min(kappa.nrows().saturating_sub(1))).transpose())
    }

    /// The combined effect for one occasion: `eta + kappa[occasion]` where
    /// kappa dimensions align with the leading eta entries, `eta` otherwise
    pub fn occasion_eta(&self, occasion: usize) -> DVector<f64> {
        match self.kappa(occasion) {
            Some(kappa) => {
                let mut eta = self.eta.clone();
                for (i, value) in kappa.iter().enumerate() {
                    if i < eta.len() {
                        eta[i] += value;
                    }
                }
                eta
            }
            None => self.eta.clone(),
        }
    }
}

/// A model prediction at a single observation row
///
/// Predictions are aligned row-for-row with the subject's observation rows
/// and carry the observed value (if any) so downstream likelihood code can
/// pair them without re-walking the event record.
#[derive(Debug, Clone)]
pub struct Prediction {
    time: f64,
    value: f64,
    observation: Option<f64>,
    endpoint: Option<String>,
    occasion: usize,
}

impl Prediction {
    /// Create a new prediction
    pub fn new(
        time: f64,
        value: f64,
        observation: Option<f64>,
        endpoint: Option<String>,
        occasion: usize,
    ) -> Self {
        Prediction {
            time,
            value,
            observation,
            endpoint,
            occasion,
        }
    }

    /// Get the time point of this prediction
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Get the predicted value
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Get the observed value, if the row carries one
    pub fn observation(&self) -> Option<f64> {
        self.observation
    }

    /// Get the endpoint label, if any
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Get the occasion index of the underlying row
    pub fn occasion(&self) -> usize {
        self.occasion
    }

    /// Raw prediction error (prediction − observation)
    pub fn prediction_error(&self) -> Option<f64> {
        self.observation.map(|obs| self.value - obs)
    }
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let obs = match self.observation {
            Some(obs) => format!("{:.4}", obs),
            None => "NA".to_string(),
        };
        write!(
            f,
            "Time: {:.2}\tObs: {}\tPred: {:.4}",
            self.time, obs, self.value
        )
    }
}

/// Predictions for one subject, aligned with its observation rows
#[derive(Debug, Clone, Default)]
pub struct SubjectPredictions {
    predictions: Vec<Prediction>,
}

impl SubjectPredictions {
    /// Get all predictions
    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    /// Add a prediction
    pub fn add_prediction(&mut self, prediction: Prediction) {
        self.predictions.push(prediction);
    }

    /// Number of prediction rows
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    /// Check whether there are no predictions
    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// Predicted values as a flat vector
    pub fn flat_values(&self) -> Vec<f64> {
        self.predictions.iter().map(Prediction::value).collect()
    }
}

impl From<Vec<Prediction>> for SubjectPredictions {
    fn from(predictions: Vec<Prediction>) -> Self {
        SubjectPredictions { predictions }
    }
}

/// The structural model capability consumed by every estimator
///
/// Implementations evaluate the model at one parameter vector for one subject
/// and return predictions aligned row-for-row with the subject's observation
/// rows. Implementations must be callable concurrently for different
/// parameter vectors without shared mutable state; the samplers batch calls
/// across candidates and chains.
pub trait ModelEvaluator: Sync {
    /// Evaluate the model
    ///
    /// # Arguments
    ///
    /// * `theta` - Population fixed effects
    /// * `effects` - The candidate individual random effects
    /// * `subject` - The individual's event record
    /// * `interpolation` - Covariate interpolation mode
    ///
    /// # Returns
    ///
    /// Predictions for every observation row of `subject`, in event order
    fn evaluate(
        &self,
        theta: &Theta,
        effects: &IndividualEffects,
        subject: &Subject,
        interpolation: Interpolation,
    ) -> Result<SubjectPredictions, EstimationError>;
}
