//! Row representation of an individual event record, and a reader for
//! NONMEM-style CSV datasets.
//!
//! Expected columns: `ID, TIME, DV, AMT, EVID` and optionally `DUR, OCC,
//! DVID, INPUT`; any remaining column is treated as a covariate. `EVID`
//! follows NONMEM conventions: 0 = observation, 1 = dose, 101 = dose with a
//! simultaneous zero observation.

use std::collections::HashMap;

use thiserror::Error;

use crate::data::covariate::{Covariate, CovariateSegment, Covariates, InterpolationMethod};
use crate::data::event::{Bolus, Event, Infusion, Observation};
use crate::data::structs::{Occasion, Subject};

/// Error type for dataset parsing
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("CSV error: {0}")]
    ReadError(#[from] csv::Error),
    #[error("missing required column '{0}'")]
    MissingColumn(String),
    #[error("unparseable value '{value}' in column '{column}' for ID {id}")]
    BadValue {
        column: String,
        value: String,
        id: String,
    },
    #[error("unknown EVID: {evid} for ID {id} at time {time}")]
    UnknownEvid { evid: i64, id: String, time: f64 },
    #[error("observation DV is missing for {id} at time {time}")]
    MissingObservationValue { id: String, time: f64 },
    #[error("dose amount (AMT) is missing for {id} at time {time}")]
    MissingDoseAmount { id: String, time: f64 },
    #[error("dataset contains no rows for a subject")]
    Empty,
}

/// A format-agnostic representation of a single event-record row
///
/// Consumers construct this from their source data, then call
/// [`into_events()`](EventRow::into_events) to obtain the corresponding
/// [Event]s with EVID interpretation applied.
#[derive(Debug, Clone, Default)]
pub struct EventRow {
    /// Subject identifier (`ID`)
    pub id: String,
    /// Event time (`TIME`)
    pub time: f64,
    /// Event type (`EVID`): 0 = observation, 1 = dose, 101 = dose + zero observation
    pub evid: i64,
    /// Observed value (`DV`), for observation rows
    pub dv: Option<f64>,
    /// Dose amount (`AMT`), for dosing rows
    pub amt: Option<f64>,
    /// Infusion duration (`DUR`); a positive value makes the dose an infusion
    pub dur: Option<f64>,
    /// Occasion label (`OCC`), for IOV models
    pub occ: Option<usize>,
    /// Endpoint label (`DVID`), for multi-endpoint models
    pub dvid: Option<String>,
    /// Input compartment (zero-indexed), defaults to 0
    pub input: Option<usize>,
    /// Covariate values observed on this row
    pub covariates: HashMap<String, f64>,
}

impl EventRow {
    /// Convert this row into events
    ///
    /// # Errors
    ///
    /// Returns a [`DatasetError`] when a required field is missing for the
    /// row's EVID, or when the EVID itself is unknown.
    pub fn into_events(self) -> Result<Vec<Event>, DatasetError> {
        let mut events = Vec::new();
        let input = self.input.unwrap_or(0);

        match self.evid {
            0 => {
                let value = self
                    .dv
                    .ok_or_else(|| DatasetError::MissingObservationValue {
                        id: self.id.clone(),
                        time: self.time,
                    })?;
                events.push(Event::Observation(Observation::new(
                    self.time,
                    Some(value),
                    self.dvid,
                )));
            }
            1 | 101 => {
                let amount = self.amt.ok_or_else(|| DatasetError::MissingDoseAmount {
                    id: self.id.clone(),
                    time: self.time,
                })?;
                let dose = if self.dur.unwrap_or(0.0) > 0.0 {
                    Event::Infusion(Infusion::new(
                        self.time,
                        amount,
                        input,
                        self.dur.unwrap_or(0.0),
                    ))
                } else {
                    Event::Bolus(Bolus::new(self.time, amount, input))
                };
                events.push(dose);

                // EVID 101 couples the dose with a zero observation at the
                // same time (NONMEM combined-event convention).
                if self.evid == 101 {
                    events.push(Event::Observation(Observation::new(
                        self.time,
                        Some(0.0),
                        self.dvid,
                    )));
                }
            }
            evid => {
                return Err(DatasetError::UnknownEvid {
                    evid,
                    id: self.id,
                    time: self.time,
                });
            }
        }

        Ok(events)
    }
}

/// Assemble a [Subject] from an ordered sequence of rows for one individual
///
/// Rows are grouped into occasions by their `OCC` label (rows without `OCC`
/// all land on occasion 0). Covariate observations within an occasion become
/// carry-forward interpolation segments.
pub fn build_subject(rows: Vec<EventRow>) -> Result<Subject, DatasetError> {
    let id = rows.first().ok_or(DatasetError::Empty)?.id.clone();

    // Group rows by occasion label, preserving label order
    let mut occasion_rows: Vec<(usize, Vec<EventRow>)> = Vec::new();
    for row in rows {
        let occ = row.occ.unwrap_or(0);
        match occasion_rows.iter_mut().find(|(index, _)| *index == occ) {
            Some((_, block)) => block.push(row),
            None => occasion_rows.push((occ, vec![row])),
        }
    }
    occasion_rows.sort_by_key(|(index, _)| *index);

    let mut occasions = Vec::with_capacity(occasion_rows.len());
    for (index, block) in occasion_rows {
        let mut occasion = Occasion::new(index);

        let mut observed_covariates: HashMap<String, Vec<(f64, f64)>> = HashMap::new();
        for row in block {
            for (name, value) in &row.covariates {
                observed_covariates
                    .entry(name.clone())
                    .or_default()
                    .push((row.time, *value));
            }
            for event in row.into_events()? {
                occasion.add_event(event);
            }
        }

        let mut covariates = Covariates::new();
        for (name, mut occurrences) in observed_covariates {
            occurrences.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            let mut covariate = Covariate::new(name.clone(), Vec::new());
            for (i, &(time, value)) in occurrences.iter().enumerate() {
                let to_time = occurrences
                    .get(i + 1)
                    .map_or(f64::INFINITY, |&(next_time, _)| next_time);
                covariate.add_segment(CovariateSegment::new(
                    time,
                    to_time,
                    InterpolationMethod::CarryForward { value },
                ));
            }
            covariates.add_covariate(name, covariate);
        }
        occasion.set_covariates(covariates);
        occasion.sort();
        occasions.push(occasion);
    }

    Ok(Subject::new(id, occasions))
}

/// Read a NONMEM-style CSV datafile and convert it into [Subject]s
///
/// Headers are matched case-insensitively. Returns one subject per distinct
/// `ID`, in order of first appearance.
pub fn read_nonmem(path: impl Into<String>) -> Result<Vec<Subject>, DatasetError> {
    let path = path.into();
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .has_headers(true)
        .from_path(&path)?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    const RESERVED: [&str; 9] = ["id", "time", "dv", "amt", "evid", "dur", "occ", "dvid", "input"];
    let column = |name: &str| headers.iter().position(|h| h.as_str() == name);
    let required = |name: &str| column(name).ok_or_else(|| DatasetError::MissingColumn(name.into()));

    let id_col = required("id")?;
    let time_col = required("time")?;
    let evid_col = required("evid")?;

    let parse_f64 = |field: &str, col: &str, id: &str| -> Result<Option<f64>, DatasetError> {
        let field = field.trim();
        if field.is_empty() || field == "." {
            return Ok(None);
        }
        field
            .parse::<f64>()
            .map(Some)
            .map_err(|_| DatasetError::BadValue {
                column: col.to_string(),
                value: field.to_string(),
                id: id.to_string(),
            })
    };

    let mut subject_rows: Vec<(String, Vec<EventRow>)> = Vec::new();
    for record in reader.records() {
        let record = record?;
        let id = record.get(id_col).unwrap_or_default().trim().to_string();
        let get = |name: &str| column(name).and_then(|i| record.get(i)).unwrap_or_default();

        let time = parse_f64(record.get(time_col).unwrap_or_default(), "time", &id)?
            .ok_or_else(|| DatasetError::BadValue {
                column: "time".into(),
                value: String::new(),
                id: id.clone(),
            })?;
        let evid = parse_f64(record.get(evid_col).unwrap_or_default(), "evid", &id)?
            .unwrap_or(0.0) as i64;

        let mut covariates = HashMap::new();
        for (i, header) in headers.iter().enumerate() {
            if RESERVED.contains(&header.as_str()) {
                continue;
            }
            if let Some(value) = parse_f64(record.get(i).unwrap_or_default(), header, &id)? {
                covariates.insert(header.clone(), value);
            }
        }

        let dvid = {
            let raw = get("dvid").trim();
            if raw.is_empty() || raw == "." {
                None
            } else {
                Some(raw.to_string())
            }
        };

        let row = EventRow {
            id: id.clone(),
            time,
            evid,
            dv: parse_f64(get("dv"), "dv", &id)?,
            amt: parse_f64(get("amt"), "amt", &id)?,
            dur: parse_f64(get("dur"), "dur", &id)?,
            occ: parse_f64(get("occ"), "occ", &id)?.map(|v| v as usize),
            dvid,
            input: parse_f64(get("input"), "input", &id)?.map(|v| v as usize),
            covariates,
        };

        match subject_rows.iter_mut().find(|(sid, _)| *sid == id) {
            Some((_, rows)) => rows.push(row),
            None => subject_rows.push((id, vec![row])),
        }
    }

    subject_rows
        .into_iter()
        .map(|(_, rows)| build_subject(rows))
        .collect()
}
