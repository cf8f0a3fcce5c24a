//! Closed-form structural models.
//!
//! These evaluators cover the common small models without an ODE solver and
//! double as the reference implementations used by the crate's tests. Real
//! applications plug in their own [`ModelEvaluator`] (typically backed by a
//! compiled ODE model) through the same trait.

use crate::data::{Event, Subject};
use crate::error::EstimationError;
use crate::model::{
    IndividualEffects, Interpolation, ModelEvaluator, Prediction, SubjectPredictions, Theta,
};

/// One-compartment model with intravenous input, parameterized by clearance
/// and central volume
///
/// Individual parameters are `Cl = theta("Cl") · exp(η₁)` and
/// `Vc = theta("Vc") · exp(η₂)`, with `η` ordered as `[Cl, Vc]`. Predictions
/// are concentrations obtained by superposition of all bolus and infusion
/// inputs up to the observation time.
#[derive(Debug, Clone, Default)]
pub struct OneCompartmentIV;

impl OneCompartmentIV {
    /// Create a new evaluator
    pub fn new() -> Self {
        OneCompartmentIV
    }

    fn concentration(subject: &Subject, cl: f64, v: f64, t: f64) -> f64 {
        let ke = cl / v;
        let mut conc = 0.0;

        for occasion in subject.iter() {
            for event in occasion.events() {
                match event {
                    Event::Bolus(bolus) if bolus.time() <= t => {
                        conc += bolus.amount() / v * (-ke * (t - bolus.time())).exp();
                    }
                    Event::Infusion(infusion) if infusion.time() <= t => {
                        let rate = infusion.amount() / infusion.duration();
                        let elapsed = t - infusion.time();
                        if elapsed < infusion.duration() {
                            conc += rate / cl * (1.0 - (-ke * elapsed).exp());
                        } else {
                            conc += rate / cl
                                * (1.0 - (-ke * infusion.duration()).exp())
                                * (-ke * (elapsed - infusion.duration())).exp();
                        }
                    }
                    _ => {}
                }
            }
        }

        conc
    }
}

impl ModelEvaluator for OneCompartmentIV {
    fn evaluate(
        &self,
        theta: &Theta,
        effects: &IndividualEffects,
        subject: &Subject,
        _interpolation: Interpolation,
    ) -> Result<SubjectPredictions, EstimationError> {
        let tv_cl = theta
            .get("Cl")
            .ok_or_else(|| EstimationError::ModelEvaluation("missing theta 'Cl'".to_string()))?;
        let tv_v = theta
            .get("Vc")
            .ok_or_else(|| EstimationError::ModelEvaluation("missing theta 'Vc'".to_string()))?;

        let mut predictions = SubjectPredictions::default();
        for occasion in subject.iter() {
            let eta = effects.occasion_eta(occasion.index());
            let cl = tv_cl * eta.get(0).copied().unwrap_or(0.0).exp();
            let v = tv_v * eta.get(1).copied().unwrap_or(0.0).exp();
            if !cl.is_finite() || !v.is_finite() || cl <= 0.0 || v <= 0.0 {
                return Err(EstimationError::ModelEvaluation(format!(
                    "non-positive individual parameters (Cl = {}, Vc = {})",
                    cl, v
                )));
            }

            for observation in occasion.observations() {
                let value = Self::concentration(subject, cl, v, observation.time());
                predictions.add_prediction(Prediction::new(
                    observation.time(),
                    value,
                    observation.value(),
                    observation.endpoint().map(str::to_string),
                    occasion.index(),
                ));
            }
        }

        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    #[test]
    fn test_bolus_monoexponential_decay() {
        let subject = Subject::builder("pk")
            .bolus(0.0, 100.0, 0)
            .observation(0.0, 0.0, None)
            .observation(2.0, 0.0, None)
            .build();

        let theta = Theta::new(vec![("Cl", 1.0), ("Vc", 10.0)]);
        let effects = IndividualEffects::new(DVector::zeros(2));
        let model = OneCompartmentIV::new();

        let predictions = model
            .evaluate(&theta, &effects, &subject, Interpolation::Locf)
            .unwrap();

        let values = predictions.flat_values();
        assert_relative_eq!(values[0], 10.0, epsilon = 1e-12);
        assert_relative_eq!(values[1], 10.0 * (-0.2_f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_infusion_steady_accumulation() {
        let subject = Subject::builder("pk")
            .infusion(0.0, 100.0, 0, 2.0)
            .observation(1.0, 0.0, None)
            .observation(4.0, 0.0, None)
            .build();

        let theta = Theta::new(vec![("Cl", 1.0), ("Vc", 10.0)]);
        let effects = IndividualEffects::new(DVector::zeros(2));
        let model = OneCompartmentIV::new();

        let predictions = model
            .evaluate(&theta, &effects, &subject, Interpolation::Locf)
            .unwrap();

        let rate = 50.0;
        let ke = 0.1;
        let during = rate / 1.0 * (1.0 - (-ke * 1.0_f64).exp());
        let after = rate / 1.0 * (1.0 - (-ke * 2.0_f64).exp()) * (-ke * 2.0_f64).exp();
        let values = predictions.flat_values();
        assert_relative_eq!(values[0], during, epsilon = 1e-12);
        assert_relative_eq!(values[1], after, epsilon = 1e-12);
    }

    #[test]
    fn test_eta_scales_parameters() {
        let subject = Subject::builder("pk")
            .bolus(0.0, 100.0, 0)
            .observation(0.0, 0.0, None)
            .build();

        let theta = Theta::new(vec![("Cl", 1.0), ("Vc", 10.0)]);
        let effects = IndividualEffects::new(DVector::from_vec(vec![0.0, 0.5]));
        let model = OneCompartmentIV::new();

        let predictions = model
            .evaluate(&theta, &effects, &subject, Interpolation::Locf)
            .unwrap();

        // C(0) = dose / (Vc * exp(0.5))
        assert_relative_eq!(
            predictions.flat_values()[0],
            100.0 / (10.0 * 0.5_f64.exp()),
            epsilon = 1e-12
        );
    }
}
