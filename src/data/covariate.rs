use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Method used to interpolate covariate values between observations
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub enum InterpolationMethod {
    /// Linear interpolation between two points with slope and intercept
    Linear { slope: f64, intercept: f64 },
    /// Constant value carried forward
    CarryForward { value: f64 },
}

/// A segment of a piecewise interpolation function for a covariate
///
/// Each segment defines how to interpolate values within its time range.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CovariateSegment {
    from: f64,
    to: f64,
    method: InterpolationMethod,
}

impl CovariateSegment {
    /// Create a new covariate segment
    ///
    /// # Arguments
    ///
    /// * `from` - Start time of the segment
    /// * `to` - End time of the segment
    /// * `method` - Interpolation method to use within this segment
    pub fn new(from: f64, to: f64, method: InterpolationMethod) -> Self {
        CovariateSegment { from, to, method }
    }

    /// Interpolate the covariate value at a specific time within this segment
    ///
    /// Returns None if the time is outside the segment's range.
    #[inline]
    fn interpolate(&self, time: f64) -> Option<f64> {
        if !(self.from <= time && time < self.to) {
            return None;
        }

        match self.method {
            InterpolationMethod::Linear { slope, intercept } => Some(slope * time + intercept),
            InterpolationMethod::CarryForward { value } => Some(value),
        }
    }
}

/// A time-varying covariate as a piecewise interpolation function
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Covariate {
    name: String,
    segments: Vec<CovariateSegment>,
}

impl Covariate {
    /// Create a new covariate with the given name and segments
    pub fn new(name: String, segments: Vec<CovariateSegment>) -> Self {
        Covariate { name, segments }
    }

    /// Create a covariate holding a single constant value
    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        Covariate {
            name: name.into(),
            segments: vec![CovariateSegment::new(
                0.0,
                f64::INFINITY,
                InterpolationMethod::CarryForward { value },
            )],
        }
    }

    /// Add a segment to this covariate
    pub fn add_segment(&mut self, segment: CovariateSegment) {
        self.segments.push(segment);
    }

    /// Get the name of the covariate
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interpolate the covariate value at a specific time
    ///
    /// Times before the first segment carry the first segment's starting value
    /// backward; times past the last segment carry its value forward.
    pub fn interpolate(&self, time: f64) -> Option<f64> {
        self.segments
            .iter()
            .find_map(|segment| segment.interpolate(time))
            .or_else(|| {
                self.segments.last().and_then(|segment| {
                    if time >= segment.to {
                        segment.interpolate(segment.to - f64::EPSILON.max(segment.to * 1e-12))
                    } else {
                        None
                    }
                })
            })
            .or_else(|| {
                self.segments
                    .first()
                    .and_then(|segment| segment.interpolate(segment.from))
            })
    }
}

/// A collection of [Covariate]s, indexed by name
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Covariates {
    covariates: HashMap<String, Covariate>,
}

impl Covariates {
    /// Create an empty covariate collection
    pub fn new() -> Self {
        Covariates {
            covariates: HashMap::new(),
        }
    }

    /// Add a covariate to the collection
    pub fn add_covariate(&mut self, name: impl Into<String>, covariate: Covariate) {
        self.covariates.insert(name.into(), covariate);
    }

    /// Get a covariate by name
    pub fn get_covariate(&self, name: &str) -> Option<&Covariate> {
        self.covariates.get(name)
    }

    /// Interpolate a named covariate at a specific time
    pub fn interpolate(&self, name: &str, time: f64) -> Option<f64> {
        self.covariates
            .get(name)
            .and_then(|covariate| covariate.interpolate(time))
    }

    /// Names of all covariates in the collection
    pub fn names(&self) -> Vec<&str> {
        self.covariates.keys().map(String::as_str).collect()
    }

    /// Number of covariates in the collection
    pub fn len(&self) -> usize {
        self.covariates.len()
    }

    /// Check if the collection is empty
    pub fn is_empty(&self) -> bool {
        self.covariates.is_empty()
    }
}

impl fmt::Display for Covariates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Covariates:")?;
        for name in self.covariates.keys() {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}
