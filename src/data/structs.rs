use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data::covariate::Covariates;
use crate::data::event::{Event, Observation};

/// A subject in a pharmacometric dataset
///
/// A [Subject] represents a single individual with one or more occasions of
/// data, each containing events (doses, observations) and covariates. The
/// estimators in this crate operate on one subject at a time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Subject {
    id: String,
    occasions: Vec<Occasion>,
}

impl Subject {
    /// Create a new subject with the given ID and occasions
    ///
    /// Occasions are sorted by index and their events by time.
    pub fn new(id: String, occasions: Vec<Occasion>) -> Self {
        let mut subject = Subject { id, occasions };
        subject.occasions.sort_by_key(|occasion| occasion.index);
        for occasion in subject.occasions.iter_mut() {
            occasion.sort();
        }
        subject
    }

    /// Create a [SubjectBuilder](crate::data::builder::SubjectBuilder) for
    /// fluent construction
    pub fn builder(id: impl Into<String>) -> crate::data::builder::SubjectBuilder {
        crate::data::builder::SubjectBuilder::new(id)
    }

    /// Get the ID of the subject
    pub fn id(&self) -> &String {
        &self.id
    }

    /// Get a vector of references to all occasions for this subject
    pub fn occasions(&self) -> Vec<&Occasion> {
        self.occasions.iter().collect()
    }

    /// Get the number of distinct occasions for this subject
    pub fn n_occasions(&self) -> usize {
        self.occasions.len()
    }

    /// Get an iterator over all occasions
    pub fn iter(&'_ self) -> std::slice::Iter<'_, Occasion> {
        self.occasions.iter()
    }

    /// All observation rows of the subject, in event order, paired with the
    /// index of the occasion they belong to
    pub fn observations(&self) -> Vec<(usize, &Observation)> {
        self.occasions
            .iter()
            .flat_map(|occasion| {
                occasion.events.iter().filter_map(move |event| match event {
                    Event::Observation(observation) => Some((occasion.index, observation)),
                    _ => None,
                })
            })
            .collect()
    }

    /// Distinct endpoint labels referenced by the subject's observations, in
    /// order of first occurrence
    pub fn endpoints(&self) -> Vec<Option<String>> {
        let mut endpoints: Vec<Option<String>> = Vec::new();
        for (_, observation) in self.observations() {
            let endpoint = observation.endpoint().map(str::to_string);
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        endpoints
    }

    /// The time of the last event (for infusions, start plus duration)
    pub fn last_time(&self) -> f64 {
        self.occasions
            .iter()
            .flat_map(|occasion| &occasion.events)
            .map(|event| match event {
                Event::Infusion(infusion) => infusion.time() + infusion.duration(),
                other => other.time(),
            })
            .fold(0.0, f64::max)
    }

    /// Expand the subject by adding missing-value observations at regular
    /// time intervals
    ///
    /// This creates the dense prediction grid used to resolve a structural
    /// model at an estimate: rows are added every `idelta` time units from
    /// zero to the last event time plus `tad`, for every endpoint the subject
    /// observes. Existing observation rows are kept unchanged.
    pub fn expand(&self, idelta: f64, tad: f64) -> Subject {
        if idelta <= 0.0 {
            return self.clone();
        }

        let last_time = self.last_time() + tad;
        let endpoints = self.endpoints();

        let new_occasions = self
            .occasions
            .iter()
            .map(|occasion| {
                // (time, endpoint) pairs that already exist, keyed in microseconds
                let existing: std::collections::HashSet<(u64, Option<String>)> = occasion
                    .events
                    .iter()
                    .filter_map(|event| match event {
                        Event::Observation(obs) => Some((
                            (obs.time() * 1e6).round() as u64,
                            obs.endpoint().map(str::to_string),
                        )),
                        _ => None,
                    })
                    .collect();

                let mut events = occasion.events.clone();
                let mut time = 0.0;
                while time < last_time {
                    let time_key = (time * 1e6).round() as u64;
                    for endpoint in &endpoints {
                        if !existing.contains(&(time_key, endpoint.clone())) {
                            events.push(Event::Observation(Observation::new(
                                time,
                                None,
                                endpoint.clone(),
                            )));
                        }
                    }
                    time += idelta;
                    time = (time * 1e6).round() / 1e6;
                }

                let mut new_occasion = Occasion::new(occasion.index);
                new_occasion.events = events;
                new_occasion.covariates = occasion.covariates.clone();
                new_occasion.sort();
                new_occasion
            })
            .collect();

        Subject::new(self.id.clone(), new_occasions)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Subject {}", self.id)?;
        for occasion in &self.occasions {
            writeln!(f, "  Occasion {}:", occasion.index)?;
            for event in &occasion.events {
                writeln!(f, "    {:?}", event)?;
            }
        }
        Ok(())
    }
}

/// An occasion within a subject's dataset
///
/// An [Occasion] represents a distinct period of data collection for a
/// subject (`OCC` in the event record), such as a dosing visit. It contains
/// events and time-varying covariates. For IOV models, each occasion beyond
/// the first carries its own inter-occasion random-effect deviation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Occasion {
    pub(crate) events: Vec<Event>,
    pub(crate) covariates: Covariates,
    pub(crate) index: usize,
}

impl Occasion {
    /// Create a new, empty occasion with the given index (0-based)
    pub fn new(index: usize) -> Self {
        Occasion {
            events: Vec::new(),
            covariates: Covariates::new(),
            index,
        }
    }

    /// Get the index of the occasion
    pub fn index(&self) -> usize {
        self.index
    }

    /// Get a vector of references to all events in this occasion
    pub fn events(&self) -> Vec<&Event> {
        self.events.iter().collect()
    }

    /// Add an event to this occasion
    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Get a reference to the covariates for this occasion
    pub fn covariates(&self) -> &Covariates {
        &self.covariates
    }

    /// Set covariates for this occasion
    pub fn set_covariates(&mut self, covariates: Covariates) {
        self.covariates = covariates;
    }

    /// Observation rows of this occasion, in event order
    pub fn observations(&self) -> Vec<&Observation> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Observation(observation) => Some(observation),
                _ => None,
            })
            .collect()
    }

    /// Sort events by time, then by [Event] type so that [Bolus](crate::data::Bolus)
    /// and [Infusion](crate::data::Infusion) come before [Observation]
    pub(crate) fn sort(&mut self) {
        self.events.sort_by(|a, b| {
            #[inline]
            fn event_type_order(event: &Event) -> u8 {
                match event {
                    Event::Bolus(_) => 1,
                    Event::Infusion(_) => 2,
                    Event::Observation(_) => 3,
                }
            }

            match a.time().partial_cmp(&b.time()) {
                Some(std::cmp::Ordering::Equal) => {
                    event_type_order(a).cmp(&event_type_order(b))
                }
                Some(ordering) => ordering,
                None => std::cmp::Ordering::Equal,
            }
        });
    }
}
