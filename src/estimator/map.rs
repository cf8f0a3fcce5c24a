//! Maximum a posteriori estimation of individual random effects.
//!
//! A bounded quasi-Newton search of the shared objective function, wrapped in
//! an anomaly-detection loop: candidate optima that sit on a search bound,
//! collapse to zero, duplicate magnitudes across effects, diverge, or are
//! unstable across restarts trigger either a bound widening or a fresh random
//! restart. The estimator never hard-fails after a successful evaluation: if
//! the attempt budget runs out, the logged attempt with the lowest objective
//! value is returned with `converged == false`.

use argmin::core::{CostFunction, Error, Executor, Gradient};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::Subject;
use crate::error::EstimationError;
use crate::estimator::{Objective, Workspace};
use crate::model::{
    IndividualEffects, Interpolation, ModelEvaluator, PriorModel, SubjectPredictions,
};

/// Objective values at or above this are treated as divergent.
const DIVERGENCE_THRESHOLD: f64 = 1e10;
/// A candidate worse than the best seen by more than this is anomalous.
const WORSE_THAN_BEST_TOLERANCE: f64 = 1e-7;
/// Best and runner-up objectives further apart than this flag instability.
const INSTABILITY_TOLERANCE: f64 = 1e-5;
/// Tolerance for deciding that a solution component sits on its bound.
const BOUND_TOLERANCE: f64 = 1e-9;

/// Settings for the MAP estimator
#[derive(Debug, Clone)]
pub struct MapSettings {
    /// Maximum number of optimization attempts (budget for the retry loop)
    pub max_attempts: usize,
    /// Maximum iterations per quasi-Newton run
    pub optimizer_iters: u64,
    /// Seed for the restart random stream
    pub seed: u64,
    /// Covariate interpolation mode forwarded to the structural model
    pub interpolation: Interpolation,
    /// Whether to resolve the structural model over a dense prediction grid
    /// at the estimate
    pub resolve_predictions: bool,
    /// Dense-grid resolution (time units between grid rows)
    pub grid_resolution: f64,
}

impl Default for MapSettings {
    fn default() -> Self {
        MapSettings {
            max_attempts: 40,
            optimizer_iters: 200,
            seed: 42,
            interpolation: Interpolation::Locf,
            resolve_predictions: true,
            grid_resolution: 0.1,
        }
    }
}

/// The result of a MAP estimation call
#[derive(Debug, Clone)]
pub struct MapResult {
    effects: IndividualEffects,
    names: Vec<String>,
    ofv: f64,
    converged: bool,
    n_attempts: usize,
    predictions: Option<SubjectPredictions>,
}

impl MapResult {
    /// The estimated random effects, in full omega dimension (zero for
    /// effects excluded from estimation)
    pub fn eta(&self) -> &DVector<f64> {
        self.effects.eta()
    }

    /// The full estimated effects, including any IOV deviations
    pub fn effects(&self) -> &IndividualEffects {
        &self.effects
    }

    /// Effect names, one per entry of [eta](Self::eta)
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The objective function value at the estimate
    pub fn ofv(&self) -> f64 {
        self.ofv
    }

    /// Whether the estimate passed anomaly detection before the attempt
    /// budget ran out
    ///
    /// `false` means the returned estimate is the best-effort fallback: the
    /// lowest-objective attempt logged across the whole budget.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Number of optimization attempts spent
    pub fn n_attempts(&self) -> usize {
        self.n_attempts
    }

    /// Structural-model predictions over the dense grid at the estimate, if
    /// requested
    pub fn predictions(&self) -> Option<&SubjectPredictions> {
        self.predictions.as_ref()
    }
}

/// One logged `(objective, parameter vector)` pair
///
/// The attempt log is an append-only arena scoped to the estimation call; the
/// fallback result is its min-objective entry.
#[derive(Debug, Clone)]
struct Attempt {
    objective: f64,
    reduced: DVector<f64>,
}

/// Anomalies detected on a candidate optimum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anomaly {
    /// A solution component sits on a search bound
    AtBound,
    /// Every component is exactly zero
    AllZero,
    /// Two or more components share the same magnitude
    DuplicateMagnitudes,
    /// The objective value is divergent
    Diverged,
    /// The objective is worse than the best seen so far
    WorseThanBest,
    /// Best and second-best objectives disagree across restarts
    Unstable,
}

/// MAP estimator for one subject under one prior
pub struct MapEstimator<'a, M: ModelEvaluator> {
    prior: &'a PriorModel<M>,
    subject: &'a Subject,
    settings: MapSettings,
}

impl<'a, M: ModelEvaluator> MapEstimator<'a, M> {
    /// Create an estimator with default settings
    pub fn new(prior: &'a PriorModel<M>, subject: &'a Subject) -> Self {
        MapEstimator {
            prior,
            subject,
            settings: MapSettings::default(),
        }
    }

    /// Replace the settings
    pub fn with_settings(mut self, settings: MapSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run the estimation
    pub fn estimate(&self) -> Result<MapResult, EstimationError> {
        // Initializing: reduce omega, merge IOV, derive bounds.
        let workspace = Workspace::prepare(self.prior, self.subject)?;
        let objective = Objective::new(
            self.prior,
            self.subject,
            &workspace,
            self.settings.interpolation,
        );
        let dim = workspace.dim();

        if dim == 0 {
            // Nothing to estimate: every effect has zero prior variance.
            let reduced = DVector::zeros(0);
            let ofv = objective.value(&reduced)?;
            return self.finish(&workspace, reduced, ofv, true, 0);
        }

        let original_bounds = workspace.bounds.clone();
        let mut bounds = original_bounds.clone();
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let mut attempts: Vec<Attempt> = Vec::with_capacity(self.settings.max_attempts);
        let mut start = DVector::zeros(dim);
        let mut runs = 0usize;

        while runs < self.settings.max_attempts {
            runs += 1;

            // Optimizing: one bounded quasi-Newton run from the current start.
            let outcome = self.optimize(&objective, &start, &bounds);
            let (reduced, value) = match outcome {
                Ok(solution) => solution,
                Err(error) => {
                    // Model-evaluation failures are recovered locally: retry
                    // from a new random starting point.
                    tracing::warn!(
                        "MAP attempt {} failed ({}), retrying from a new start",
                        runs,
                        error
                    );
                    start = random_start(&mut rng, &bounds);
                    continue;
                }
            };

            tracing::debug!(
                "MAP attempt {}: objective {:.6}, eta {:?}",
                runs,
                value,
                reduced.as_slice()
            );
            attempts.push(Attempt {
                objective: value,
                reduced: reduced.clone(),
            });

            // Evaluating: anomaly detection on the candidate.
            let anomaly = detect_anomaly(&attempts, &reduced, value, &bounds);
            match anomaly {
                Some(Anomaly::AtBound) => {
                    // Bound-stuck candidates widen the box and continue from
                    // the stuck solution; this is not a fresh restart.
                    bounds.apply(|b| *b += 1.0);
                    start = reduced;
                    tracing::debug!("MAP attempt {} sits on a bound, widening bounds", runs);
                }
                Some(other) => {
                    tracing::debug!("MAP attempt {} flagged as {:?}, restarting", runs, other);
                    bounds = original_bounds.clone();
                    start = random_start(&mut rng, &bounds);
                }
                None if attempts.len() == 1 => {
                    // The first attempt is always re-checked from a new start.
                    bounds = original_bounds.clone();
                    start = random_start(&mut rng, &bounds);
                }
                None => {
                    return self.finish(&workspace, reduced, value, true, runs);
                }
            }
        }

        // Exhausted: fall back to the lowest-objective attempt seen.
        let best = attempts
            .into_iter()
            .min_by(|a, b| a.objective.total_cmp(&b.objective))
            .ok_or_else(|| {
                EstimationError::Optimization(format!(
                    "no attempt out of {} produced a usable optimum",
                    self.settings.max_attempts
                ))
            })?;
        tracing::warn!(
            "MAP attempt budget exhausted, returning best of {} attempts (objective {:.6})",
            runs,
            best.objective
        );
        self.finish(&workspace, best.reduced, best.objective, false, runs)
    }

    /// One bounded local minimization
    fn optimize(
        &self,
        objective: &Objective<'_, M>,
        start: &DVector<f64>,
        bounds: &DVector<f64>,
    ) -> Result<(DVector<f64>, f64), EstimationError> {
        let problem = BoundedObjective {
            objective,
            bounds: bounds.clone(),
        };
        let linesearch = MoreThuenteLineSearch::new();
        let solver = LBFGS::new(linesearch, 7);
        let start_vec: Vec<f64> = start.iter().copied().collect();

        let result = Executor::new(problem, solver)
            .configure(|state| {
                state
                    .param(start_vec)
                    .max_iters(self.settings.optimizer_iters)
            })
            .run()
            .map_err(|e| EstimationError::Optimization(e.to_string()))?;

        let state = result.state();
        let best = state
            .best_param
            .clone()
            .ok_or_else(|| EstimationError::Optimization("no best parameter".to_string()))?;
        let clamped = clamp_to_bounds(&best, bounds);
        let reduced = DVector::from_vec(clamped);
        let value = objective.value(&reduced)?;
        Ok((reduced, value))
    }

    fn finish(
        &self,
        workspace: &Workspace,
        reduced: DVector<f64>,
        ofv: f64,
        converged: bool,
        n_attempts: usize,
    ) -> Result<MapResult, EstimationError> {
        let effects = workspace.scatter(&reduced);

        // Resolved model: predictions over the original sampling span
        // extended by one time unit, at fixed resolution.
        let predictions = if self.settings.resolve_predictions {
            let grid = self.subject.expand(self.settings.grid_resolution, 1.0);
            Some(self.prior.model().evaluate(
                self.prior.theta(),
                &effects,
                &grid,
                self.settings.interpolation,
            )?)
        } else {
            None
        };

        Ok(MapResult {
            effects,
            names: self.prior.omega().names().to_vec(),
            ofv,
            converged,
            n_attempts,
            predictions,
        })
    }
}

/// Box-constrained view of the objective for the quasi-Newton solver
///
/// Parameters are clamped into the box before evaluation, so the minimizer
/// cannot exploit values outside the search region; a minimizer pushed
/// against the box surfaces as a solution component on its bound, which the
/// anomaly detection then handles.
struct BoundedObjective<'a, M: ModelEvaluator> {
    objective: &'a Objective<'a, M>,
    bounds: DVector<f64>,
}

impl<M: ModelEvaluator> BoundedObjective<'_, M> {
    fn eval(&self, param: &[f64]) -> Result<f64, Error> {
        let clamped = clamp_to_bounds(param, &self.bounds);
        self.objective
            .value(&DVector::from_vec(clamped))
            .map_err(|e| Error::msg(e.to_string()))
    }
}

impl<M: ModelEvaluator> CostFunction for BoundedObjective<'_, M> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        self.eval(param)
    }
}

impl<M: ModelEvaluator> Gradient for BoundedObjective<'_, M> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        // Central finite differences of the clamped objective.
        let mut gradient = vec![0.0; param.len()];
        for i in 0..param.len() {
            let h = 1e-6 * (1.0 + param[i].abs());
            let mut forward = param.clone();
            let mut backward = param.clone();
            forward[i] += h;
            backward[i] -= h;
            gradient[i] = (self.eval(&forward)? - self.eval(&backward)?) / (2.0 * h);
        }
        Ok(gradient)
    }
}

fn clamp_to_bounds(param: &[f64], bounds: &DVector<f64>) -> Vec<f64> {
    param
        .iter()
        .enumerate()
        .map(|(i, &value)| value.clamp(-bounds[i], bounds[i]))
        .collect()
}

fn random_start(rng: &mut StdRng, bounds: &DVector<f64>) -> DVector<f64> {
    DVector::from_fn(bounds.len(), |i, _| {
        rng.random_range(-bounds[i]..bounds[i])
    })
}

/// Apply the anomaly checks of the Evaluating state, in priority order
fn detect_anomaly(
    attempts: &[Attempt],
    reduced: &DVector<f64>,
    value: f64,
    bounds: &DVector<f64>,
) -> Option<Anomaly> {
    // (a) a component on its bound takes priority: it only widens the box.
    if reduced
        .iter()
        .enumerate()
        .any(|(i, &eta)| eta.abs() >= bounds[i] - BOUND_TOLERANCE)
    {
        return Some(Anomaly::AtBound);
    }

    // (b) all effects exactly zero
    if reduced.iter().all(|&eta| eta == 0.0) {
        return Some(Anomaly::AllZero);
    }

    // (c) two or more effect magnitudes numerically identical
    for i in 0..reduced.len() {
        for j in (i + 1)..reduced.len() {
            if reduced[i].abs() == reduced[j].abs() {
                return Some(Anomaly::DuplicateMagnitudes);
            }
        }
    }

    // (d) divergent objective
    if value >= DIVERGENCE_THRESHOLD {
        return Some(Anomaly::Diverged);
    }

    // (e) worse than the best seen so far
    let best = attempts
        .iter()
        .map(|attempt| attempt.objective)
        .fold(f64::INFINITY, f64::min);
    if value > best + WORSE_THAN_BEST_TOLERANCE {
        return Some(Anomaly::WorseThanBest);
    }

    // (f) best and second-best disagree across restarts
    if attempts.len() >= 2 {
        let mut objectives: Vec<f64> = attempts.iter().map(|a| a.objective).collect();
        objectives.sort_by(f64::total_cmp);
        if (objectives[1] - objectives[0]).abs() > INSTABILITY_TOLERANCE {
            return Some(Anomaly::Unstable);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::error_model::ErrorModel;
    use crate::model::{Omega, Sigma, Theta};

    fn attempts(objectives: &[f64]) -> Vec<Attempt> {
        objectives
            .iter()
            .map(|&objective| Attempt {
                objective,
                reduced: DVector::from_vec(vec![0.1, 0.2]),
            })
            .collect()
    }

    #[test]
    fn test_at_bound_has_priority() {
        let bounds = DVector::from_vec(vec![0.5, 0.5]);
        let reduced = DVector::from_vec(vec![0.5, 0.0]);
        // Also all-zero-adjacent and duplicate-free; AtBound must win.
        let anomaly = detect_anomaly(&attempts(&[1.0]), &reduced, 1.0, &bounds);
        assert_eq!(anomaly, Some(Anomaly::AtBound));
    }

    #[test]
    fn test_all_zero_detected() {
        let bounds = DVector::from_vec(vec![0.5, 0.5]);
        let reduced = DVector::zeros(2);
        let anomaly = detect_anomaly(&attempts(&[1.0]), &reduced, 1.0, &bounds);
        assert_eq!(anomaly, Some(Anomaly::AllZero));
    }

    #[test]
    fn test_duplicate_magnitudes_detected() {
        let bounds = DVector::from_vec(vec![0.5, 0.5]);
        let reduced = DVector::from_vec(vec![0.2, -0.2]);
        let anomaly = detect_anomaly(&attempts(&[1.0]), &reduced, 1.0, &bounds);
        assert_eq!(anomaly, Some(Anomaly::DuplicateMagnitudes));
    }

    #[test]
    fn test_divergent_objective_detected() {
        let bounds = DVector::from_vec(vec![0.5, 0.5]);
        let reduced = DVector::from_vec(vec![0.1, 0.2]);
        let anomaly = detect_anomaly(&attempts(&[1e12]), &reduced, 1e12, &bounds);
        assert_eq!(anomaly, Some(Anomaly::Diverged));
    }

    #[test]
    fn test_worse_than_best_detected() {
        let bounds = DVector::from_vec(vec![0.5, 0.5]);
        let reduced = DVector::from_vec(vec![0.1, 0.2]);
        let log = attempts(&[1.0, 1.5]);
        let anomaly = detect_anomaly(&log, &reduced, 1.5, &bounds);
        assert_eq!(anomaly, Some(Anomaly::WorseThanBest));
    }

    #[test]
    fn test_instability_across_restarts_detected() {
        let bounds = DVector::from_vec(vec![0.5, 0.5]);
        let reduced = DVector::from_vec(vec![0.1, 0.2]);
        // Both attempts match the best closely enough for (e) but differ
        // from each other beyond the instability tolerance.
        let log = attempts(&[1.00000000, 1.00000005]);
        let anomaly = detect_anomaly(&log, &reduced, 1.0, &bounds);
        assert_eq!(anomaly, Some(Anomaly::Unstable));
    }

    #[test]
    fn test_clean_candidate_passes() {
        let bounds = DVector::from_vec(vec![0.5, 0.5]);
        let reduced = DVector::from_vec(vec![0.1, 0.2]);
        let log = attempts(&[1.0, 1.0]);
        assert_eq!(detect_anomaly(&log, &reduced, 1.0, &bounds), None);
    }

    #[test]
    fn test_map_settings_defaults() {
        let settings = MapSettings::default();
        assert_eq!(settings.max_attempts, 40);
        assert!(settings.resolve_predictions);
    }

    #[test]
    fn test_zero_dimensional_prior_returns_zero_eta() {
        let prior = PriorModel::new(
            Theta::new(vec![("Cl", 1.0), ("Vc", 10.0)]),
            Omega::diagonal(vec![("Cl", 0.0), ("Vc", 0.0)]),
            Sigma::Single(vec![0.5]),
            None,
            vec![],
            ErrorModel::additive(),
            crate::model::OneCompartmentIV::new(),
        )
        .unwrap();

        let subject = Subject::builder("zero")
            .bolus(0.0, 100.0, 0)
            .observation(1.0, 9.0, None)
            .build();

        let result = MapEstimator::new(&prior, &subject).estimate().unwrap();
        assert!(result.converged());
        assert!(result.eta().iter().all(|&v| v == 0.0));
    }
}
