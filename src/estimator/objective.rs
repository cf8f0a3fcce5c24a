//! The shared objective function.
//!
//! All three estimators minimize or sample the same quantity:
//!
//! ```text
//! objective(η) = Σ_i [((y_i − f_i)/g_i)² + ln(g_i²)]  +  η'·Ω⁻¹·η
//! ```
//!
//! which is twice the negative log-posterior of η up to an additive constant.
//! The data and prior terms are exposed separately because the MCMC
//! independence kernel accepts on the data term alone (the prior cancels when
//! proposals are drawn from it) and the SIR weights are built from the data
//! likelihood.

use nalgebra::DVector;

use crate::data::Subject;
use crate::error::EstimationError;
use crate::estimator::Workspace;
use crate::model::{Interpolation, ModelEvaluator, PriorModel, SubjectPredictions};

/// The (twice negative log) posterior density of a candidate reduced-space
/// random-effects vector
pub struct Objective<'a, M: ModelEvaluator> {
    prior: &'a PriorModel<M>,
    subject: &'a Subject,
    workspace: &'a Workspace,
    interpolation: Interpolation,
}

impl<'a, M: ModelEvaluator> Objective<'a, M> {
    pub(crate) fn new(
        prior: &'a PriorModel<M>,
        subject: &'a Subject,
        workspace: &'a Workspace,
        interpolation: Interpolation,
    ) -> Self {
        Objective {
            prior,
            subject,
            workspace,
            interpolation,
        }
    }

    /// Evaluate the structural model at a reduced candidate vector
    pub fn predict(&self, reduced: &DVector<f64>) -> Result<SubjectPredictions, EstimationError> {
        let effects = self.workspace.scatter(reduced);
        self.prior.model().evaluate(
            self.prior.theta(),
            &effects,
            self.subject,
            self.interpolation,
        )
    }

    /// The data term: `Σ ((y − f)/g)² + ln(g²)` over all observed rows
    pub fn data_term(&self, reduced: &DVector<f64>) -> Result<f64, EstimationError> {
        let predictions = self.predict(reduced)?;
        let error_model = self.prior.error_model();
        let sigma = self.prior.sigma();

        let mut total = 0.0;
        for prediction in predictions.predictions() {
            let observation = match prediction.observation() {
                Some(observation) => observation,
                None => continue,
            };
            let g = error_model.sigma(prediction, sigma)?;
            let residual = (observation - prediction.value()) / g;
            total += residual * residual + (g * g).ln();
        }

        if total.is_finite() {
            Ok(total)
        } else {
            Err(EstimationError::ModelEvaluation(format!(
                "non-finite objective data term ({})",
                total
            )))
        }
    }

    /// The prior term: the Mahalanobis penalty `η'·Ω⁻¹·η`
    ///
    /// Ω⁻¹ is precomputed once per estimation call in the [Workspace].
    pub fn prior_term(&self, reduced: &DVector<f64>) -> f64 {
        (reduced.transpose() * &self.workspace.inverse * reduced)[(0, 0)]
    }

    /// The full objective value (data term plus prior term)
    pub fn value(&self, reduced: &DVector<f64>) -> Result<f64, EstimationError> {
        Ok(self.data_term(reduced)? + self.prior_term(reduced))
    }

    /// Unnormalized log posterior density, `−value/2`
    pub fn log_target(&self, reduced: &DVector<f64>) -> Result<f64, EstimationError> {
        Ok(-0.5 * self.value(reduced)?)
    }

    /// Unnormalized data log-likelihood, `−data_term/2`
    pub fn log_likelihood(&self, reduced: &DVector<f64>) -> Result<f64, EstimationError> {
        Ok(-0.5 * self.data_term(reduced)?)
    }

    /// Unnormalized log density of the prior at a reduced candidate,
    /// `−(η'·Ω⁻¹·η)/2`
    pub fn log_prior(&self, reduced: &DVector<f64>) -> f64 {
        -0.5 * self.prior_term(reduced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::error_model::ErrorModel;
    use crate::model::{Omega, OneCompartmentIV, Sigma, Theta};
    use approx::assert_relative_eq;

    fn prior() -> PriorModel<OneCompartmentIV> {
        PriorModel::new(
            Theta::new(vec![("Cl", 1.0), ("Vc", 10.0)]),
            Omega::diagonal(vec![("Cl", 0.09), ("Vc", 0.04)]),
            Sigma::Single(vec![0.5]),
            None,
            vec![],
            ErrorModel::additive(),
            OneCompartmentIV::new(),
        )
        .unwrap()
    }

    fn subject() -> Subject {
        Subject::builder("obj")
            .bolus(0.0, 100.0, 0)
            .observation(0.0, 10.0, None)
            .observation(2.0, 8.0, None)
            .build()
    }

    #[test]
    fn test_prior_term_is_mahalanobis_distance() {
        let prior = prior();
        let subject = subject();
        let workspace = Workspace::prepare(&prior, &subject).unwrap();
        let objective = Objective::new(&prior, &subject, &workspace, Interpolation::Locf);

        let reduced = DVector::from_vec(vec![0.3, 0.2]);
        // Diagonal omega: eta'.inv(omega).eta = 0.09/0.09 + 0.04/0.04
        assert_relative_eq!(objective.prior_term(&reduced), 2.0, epsilon = 1e-10);
    }

    #[test]
    fn test_value_is_data_plus_prior() {
        let prior = prior();
        let subject = subject();
        let workspace = Workspace::prepare(&prior, &subject).unwrap();
        let objective = Objective::new(&prior, &subject, &workspace, Interpolation::Locf);

        let reduced = DVector::from_vec(vec![0.1, -0.1]);
        let value = objective.value(&reduced).unwrap();
        let expected =
            objective.data_term(&reduced).unwrap() + objective.prior_term(&reduced);
        assert_relative_eq!(value, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_data_term_exact_fit_leaves_only_variance_penalty() {
        // Observations generated at eta = 0 with no noise: the residual sum
        // vanishes and only ln(g²) per observation remains.
        let prior = prior();
        let subject = Subject::builder("fit")
            .bolus(0.0, 100.0, 0)
            .observation(0.0, 10.0, None)
            .build();
        let workspace = Workspace::prepare(&prior, &subject).unwrap();
        let objective = Objective::new(&prior, &subject, &workspace, Interpolation::Locf);

        let data = objective.data_term(&DVector::zeros(2)).unwrap();
        assert_relative_eq!(data, (0.25_f64).ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_zero_sigma_never_produces_nan() {
        // A proportional error model at a zero prediction would divide by
        // zero without the clamp; the objective must stay finite.
        let prior = PriorModel::new(
            Theta::new(vec![("Cl", 1.0), ("Vc", 10.0)]),
            Omega::diagonal(vec![("Cl", 0.09), ("Vc", 0.04)]),
            Sigma::Single(vec![0.1]),
            None,
            vec![],
            ErrorModel::proportional(),
            OneCompartmentIV::new(),
        )
        .unwrap();

        // No dose: every prediction is exactly zero.
        let subject = Subject::builder("zero")
            .observation(1.0, 0.5, None)
            .observation(2.0, 0.2, None)
            .build();

        let workspace = Workspace::prepare(&prior, &subject).unwrap();
        let objective = Objective::new(&prior, &subject, &workspace, Interpolation::Locf);
        let value = objective.value(&DVector::zeros(2)).unwrap();
        assert!(value.is_finite());
    }
}
