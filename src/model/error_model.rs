//! Residual error models.
//!
//! An error function maps a model prediction `f` and its sigma parameters to
//! the standard deviation `g` of the observation noise at that prediction.
//! Multi-endpoint models carry one function per endpoint label; single
//! endpoint models one function for everything.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::EstimationError;
use crate::model::prior::Sigma;
use crate::model::Prediction;

/// An error function: `(prediction, sigma) → standard deviation`
pub type ErrorFn = Arc<dyn Fn(f64, &[f64]) -> f64 + Send + Sync>;

/// Residual error model for one or more endpoints
///
/// The two variants are dispatched explicitly: [`ErrorModel::Single`] applies
/// its function to every observation, [`ErrorModel::PerEndpoint`] looks the
/// function up by the observation's endpoint label and errors when an
/// endpoint has no entry.
#[derive(Clone)]
pub enum ErrorModel {
    /// One error function for all observations
    Single(ErrorFn),
    /// One error function per endpoint label
    PerEndpoint(HashMap<String, ErrorFn>),
}

impl ErrorModel {
    /// Additive error: `g = sigma[0]`
    pub fn additive() -> Self {
        ErrorModel::Single(Arc::new(|_f, sigma| sigma[0]))
    }

    /// Proportional error: `g = sigma[0] * |f|`
    pub fn proportional() -> Self {
        ErrorModel::Single(Arc::new(|f, sigma| sigma[0] * f.abs()))
    }

    /// Combined error: `g = sqrt(sigma[0]² + sigma[1]² * f²)`
    pub fn combined() -> Self {
        ErrorModel::Single(Arc::new(|f, sigma| {
            (sigma[0].powi(2) + sigma[1].powi(2) * f.powi(2)).sqrt()
        }))
    }

    /// Exponential error for log-transformed data: `g = sigma[0]`
    pub fn exponential() -> Self {
        ErrorModel::Single(Arc::new(|_f, sigma| sigma[0]))
    }

    /// A custom single-endpoint error function
    pub fn custom(function: impl Fn(f64, &[f64]) -> f64 + Send + Sync + 'static) -> Self {
        ErrorModel::Single(Arc::new(function))
    }

    /// Build a per-endpoint error model from (label, function) pairs
    pub fn per_endpoint(entries: Vec<(impl Into<String>, ErrorModel)>) -> Self {
        let mut map = HashMap::new();
        for (label, model) in entries {
            let function = match model {
                ErrorModel::Single(function) => function,
                ErrorModel::PerEndpoint(_) => continue,
            };
            map.insert(label.into(), function);
        }
        ErrorModel::PerEndpoint(map)
    }

    /// Look up the error function for an endpoint label
    fn function_for(&self, endpoint: Option<&str>) -> Result<&ErrorFn, EstimationError> {
        match self {
            ErrorModel::Single(function) => Ok(function),
            ErrorModel::PerEndpoint(map) => {
                let label = endpoint.ok_or_else(|| {
                    EstimationError::MissingEndpoint("<unlabeled>".to_string())
                })?;
                map.get(label)
                    .ok_or_else(|| EstimationError::MissingEndpoint(label.to_string()))
            }
        }
    }

    /// Standard deviation for a single prediction
    ///
    /// A computed `g` of exactly zero is remapped to 1 so that downstream
    /// residual weighting and the `ln(g²)` penalty stay finite.
    pub fn sigma(
        &self,
        prediction: &Prediction,
        sigma: &Sigma,
    ) -> Result<f64, EstimationError> {
        let endpoint = prediction.endpoint();
        let function = self.function_for(endpoint)?;
        let params = sigma.for_endpoint(endpoint).ok_or_else(|| {
            EstimationError::MissingEndpoint(endpoint.unwrap_or("<unlabeled>").to_string())
        })?;
        let g = function(prediction.value(), params);
        Ok(if g == 0.0 { 1.0 } else { g })
    }

    /// Standard deviations for a batch of predictions, matched by endpoint
    pub fn standard_deviations(
        &self,
        predictions: &[Prediction],
        sigma: &Sigma,
    ) -> Result<Vec<f64>, EstimationError> {
        predictions
            .iter()
            .map(|prediction| self.sigma(prediction, sigma))
            .collect()
    }
}

impl fmt::Debug for ErrorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorModel::Single(_) => write!(f, "ErrorModel::Single"),
            ErrorModel::PerEndpoint(map) => {
                let mut labels: Vec<&str> = map.keys().map(String::as_str).collect();
                labels.sort_unstable();
                write!(f, "ErrorModel::PerEndpoint({:?})", labels)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(value: f64, endpoint: Option<&str>) -> Prediction {
        Prediction::new(1.0, value, Some(value), endpoint.map(str::to_string), 0)
    }

    #[test]
    fn test_additive_sigma() {
        let model = ErrorModel::additive();
        let sigma = Sigma::Single(vec![0.5]);
        let g = model.sigma(&prediction(100.0, None), &sigma).unwrap();
        assert_eq!(g, 0.5);
    }

    #[test]
    fn test_proportional_sigma() {
        let model = ErrorModel::proportional();
        let sigma = Sigma::Single(vec![0.1]);
        let g = model.sigma(&prediction(100.0, None), &sigma).unwrap();
        assert!((g - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_combined_sigma() {
        let model = ErrorModel::combined();
        let sigma = Sigma::Single(vec![0.5, 0.1]);
        let g = model.sigma(&prediction(100.0, None), &sigma).unwrap();
        assert!((g - 100.25_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_zero_sigma_clamped_to_one() {
        // Proportional error at a zero prediction yields g = 0, which must be
        // remapped to 1 before use.
        let model = ErrorModel::proportional();
        let sigma = Sigma::Single(vec![0.1]);
        let g = model.sigma(&prediction(0.0, None), &sigma).unwrap();
        assert_eq!(g, 1.0);
    }

    #[test]
    fn test_per_endpoint_dispatch() {
        let model = ErrorModel::per_endpoint(vec![
            ("conc", ErrorModel::additive()),
            ("effect", ErrorModel::proportional()),
        ]);
        let sigma = Sigma::PerEndpoint(HashMap::from([
            ("conc".to_string(), vec![0.5]),
            ("effect".to_string(), vec![0.2]),
        ]));

        let g_conc = model.sigma(&prediction(50.0, Some("conc")), &sigma).unwrap();
        let g_effect = model
            .sigma(&prediction(50.0, Some("effect")), &sigma)
            .unwrap();
        assert_eq!(g_conc, 0.5);
        assert!((g_effect - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_endpoint_errors() {
        let model = ErrorModel::per_endpoint(vec![("conc", ErrorModel::additive())]);
        let sigma = Sigma::PerEndpoint(HashMap::from([("conc".to_string(), vec![0.5])]));

        let result = model.sigma(&prediction(50.0, Some("biomarker")), &sigma);
        assert!(matches!(result, Err(EstimationError::MissingEndpoint(_))));
    }
}
