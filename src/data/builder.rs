use crate::data::covariate::{Covariate, Covariates};
use crate::data::event::{Bolus, Event, Infusion, Observation};
use crate::data::structs::{Occasion, Subject};

/// Fluent builder for [Subject]
///
/// Events are appended to the current occasion; [SubjectBuilder::reset]
/// closes it and starts the next one (a new `OCC`).
///
/// # Examples
///
/// ```
/// use mapbayes::prelude::data::*;
///
/// let subject = Subject::builder("patient_001")
///     .bolus(0.0, 2000.0, 0)
///     .observation(1.0, 25.0, None)
///     .observation(14.0, 5.5, None)
///     .build();
/// ```
pub struct SubjectBuilder {
    id: String,
    occasions: Vec<Occasion>,
    current_occasion: Occasion,
}

impl SubjectBuilder {
    /// Create a builder for a subject with the given ID
    pub fn new(id: impl Into<String>) -> Self {
        SubjectBuilder {
            id: id.into(),
            occasions: Vec::new(),
            current_occasion: Occasion::new(0),
        }
    }

    /// Append an event to the current occasion
    pub fn event(mut self, event: Event) -> Self {
        self.current_occasion.add_event(event);
        self
    }

    /// Append a bolus dose
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the dose
    /// * `amount` - Amount administered (`AMT`)
    /// * `input` - Compartment number (zero-indexed) receiving the dose
    pub fn bolus(self, time: f64, amount: f64, input: usize) -> Self {
        self.event(Event::Bolus(Bolus::new(time, amount, input)))
    }

    /// Append an infusion
    ///
    /// # Arguments
    ///
    /// * `time` - Start time of the infusion
    /// * `amount` - Total amount administered (`AMT`)
    /// * `input` - Compartment number (zero-indexed) receiving the dose
    /// * `duration` - Infusion duration (`DUR`)
    pub fn infusion(self, time: f64, amount: f64, input: usize, duration: f64) -> Self {
        self.event(Event::Infusion(Infusion::new(time, amount, input, duration)))
    }

    /// Append an observation
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the observation
    /// * `value` - Observed value (`DV`)
    /// * `endpoint` - Endpoint label (`DVID`) for multi-endpoint models
    pub fn observation(self, time: f64, value: f64, endpoint: Option<&str>) -> Self {
        self.event(Event::Observation(Observation::new(
            time,
            Some(value),
            endpoint.map(str::to_string),
        )))
    }

    /// Append an observation row without a measured value
    ///
    /// Used for prediction-grid rows where the model should be evaluated but
    /// no measurement exists.
    pub fn missing_observation(self, time: f64, endpoint: Option<&str>) -> Self {
        self.event(Event::Observation(Observation::new(
            time,
            None,
            endpoint.map(str::to_string),
        )))
    }

    /// Attach a constant covariate to the current occasion
    pub fn covariate(mut self, name: impl Into<String>, value: f64) -> Self {
        let name = name.into();
        self.current_occasion
            .covariates
            .add_covariate(name.clone(), Covariate::constant(name, value));
        self
    }

    /// Attach a prebuilt covariate to the current occasion
    pub fn covariate_fn(mut self, name: impl Into<String>, covariate: Covariate) -> Self {
        self.current_occasion
            .covariates
            .add_covariate(name, covariate);
        self
    }

    /// Replace the current occasion's covariates wholesale
    pub fn covariates(mut self, covariates: Covariates) -> Self {
        self.current_occasion.set_covariates(covariates);
        self
    }

    /// Close the current occasion and start the next one
    pub fn reset(mut self) -> Self {
        let next_index = self.current_occasion.index() + 1;
        self.current_occasion.sort();
        self.occasions.push(self.current_occasion);
        self.current_occasion = Occasion::new(next_index);
        self
    }

    /// Finish building the subject
    pub fn build(mut self) -> Subject {
        self = self.reset();
        Subject::new(self.id, self.occasions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_builder() {
        let subject = Subject::builder("test")
            .bolus(0.0, 100.0, 0)
            .observation(1.0, 10.0, None)
            .observation(3.0, 6.0, None)
            .reset()
            .bolus(24.0, 100.0, 0)
            .observation(25.0, 11.0, None)
            .build();

        assert_eq!(subject.id(), "test");
        assert_eq!(subject.n_occasions(), 2);
        assert_eq!(subject.observations().len(), 3);
    }

    #[test]
    fn test_builder_covariates() {
        let subject = Subject::builder("cov")
            .bolus(0.0, 100.0, 0)
            .observation(1.0, 10.0, None)
            .covariate("wt", 70.0)
            .build();

        let occasion = &subject.occasions()[0];
        assert_eq!(occasion.covariates().interpolate("wt", 12.0), Some(70.0));
    }

    #[test]
    fn test_builder_endpoints() {
        let subject = Subject::builder("multi")
            .bolus(0.0, 100.0, 0)
            .observation(1.0, 10.0, Some("conc"))
            .observation(1.0, 3.2, Some("effect"))
            .build();

        assert_eq!(subject.endpoints().len(), 2);
    }
}
