use serde::{Deserialize, Serialize};

/// Represents a pharmacokinetic/pharmacodynamic event
///
/// Events represent key occurrences in an individual's record, following
/// NONMEM conventions:
/// - [Bolus] doses (instantaneous drug input, `EVID=1` without duration)
/// - [Infusion]s (continuous drug input over a duration, `EVID=1` with `DUR`)
/// - [Observation]s (measured values, `EVID=0`)
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Event {
    /// A bolus dose (instantaneous drug input)
    Bolus(Bolus),
    /// An infusion (continuous drug input over a duration)
    Infusion(Infusion),
    /// An observation of drug concentration or another endpoint
    Observation(Observation),
}

impl Event {
    /// Get the time of the event
    pub fn time(&self) -> f64 {
        match self {
            Event::Bolus(bolus) => bolus.time,
            Event::Infusion(infusion) => infusion.time,
            Event::Observation(observation) => observation.time,
        }
    }
}

/// Represents an instantaneous input of drug
///
/// A [Bolus] is a discrete amount of drug added to a specific compartment at a
/// specific time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Bolus {
    time: f64,
    amount: f64,
    input: usize,
}

impl Bolus {
    /// Create a new bolus event
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the bolus dose
    /// * `amount` - Amount of drug administered
    /// * `input` - The compartment number (zero-indexed) receiving the dose
    pub fn new(time: f64, amount: f64, input: usize) -> Self {
        Bolus {
            time,
            amount,
            input,
        }
    }

    /// Get the amount of drug in the bolus
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Get the compartment number (zero-indexed) that receives the bolus
    pub fn input(&self) -> usize {
        self.input
    }

    /// Get the time of the bolus administration
    pub fn time(&self) -> f64 {
        self.time
    }
}

/// Represents a continuous dose of drug over time
///
/// An [Infusion] administers drug at a constant rate over a specified duration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Infusion {
    time: f64,
    amount: f64,
    input: usize,
    duration: f64,
}

impl Infusion {
    /// Create a new infusion event
    ///
    /// # Arguments
    ///
    /// * `time` - Start time of the infusion
    /// * `amount` - Total amount of drug to be administered
    /// * `input` - The compartment number (zero-indexed) receiving the dose
    /// * `duration` - Duration of the infusion in time units
    pub fn new(time: f64, amount: f64, input: usize, duration: f64) -> Self {
        Infusion {
            time,
            amount,
            input,
            duration,
        }
    }

    /// Get the total amount of drug provided over the infusion
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Get the compartment number (zero-indexed) that receives the infusion
    pub fn input(&self) -> usize {
        self.input
    }

    /// Get the duration of the infusion
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Get the start time of the infusion
    ///
    /// The infusion continues from this time until time + duration.
    pub fn time(&self) -> f64 {
        self.time
    }
}

/// Represents an observation of drug concentration or another measured value
///
/// The `value` is `None` for prediction-grid rows where no measurement exists
/// (e.g. rows added by [`crate::data::Subject::expand`]). The `endpoint` names
/// the observed quantity for multi-response models (`DVID`); single-endpoint
/// records leave it unset.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Observation {
    time: f64,
    value: Option<f64>,
    endpoint: Option<String>,
}

impl Observation {
    /// Create a new observation
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the observation
    /// * `value` - Observed value, or `None` for a prediction-only row
    /// * `endpoint` - Endpoint label (`DVID`) for multi-endpoint models
    pub fn new(time: f64, value: Option<f64>, endpoint: Option<String>) -> Self {
        Observation {
            time,
            value,
            endpoint,
        }
    }

    /// Get the time of the observation
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Get the observed value, if any
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Get the endpoint label, if any
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}
