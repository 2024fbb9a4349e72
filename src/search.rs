//! Hyperparameter search on top of the `optimizer` crate.
//!
//! [`HyperparameterSearch`] owns a minimizing study with a seeded TPE sampler
//! and a median pruner. Each [`SearchTrial`] hands out hyperparameters through
//! [`ParamProvider`] and forwards the per-epoch validation metric to the study
//! through [`SearchTrial::report`]. Outcomes are also kept in a local ledger so
//! failed trials and the sampled parameter names end up in `study.json`.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use optimizer::prelude::{
    CategoricalParam, Direction, Error as StudyError, FloatParam, IntParam, MedianPruner, Parameter, Study,
    TpeSampler, TrialPruned,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::PrunerConfig,
    error::{AeError, Result},
    hparams::{ParamProvider, ParamSet, ParameterValue},
    training::{CallbackAction, EpochCallback, EpochLogs},
};

fn search_error(e: impl std::fmt::Display) -> AeError {
    AeError::Search(e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialOutcome {
    Complete,
    Pruned,
    Failed,
}

/// A finished trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub number: usize,
    pub outcome: TrialOutcome,
    /// Objective value, or the last reported value for pruned trials.
    pub value: Option<f64>,
    pub params: ParamSet,
    pub intermediate_values: BTreeMap<usize, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parameter definitions shared by every trial, keyed by name, so the sampler
/// sees one distribution per hyperparameter across the whole study.
#[derive(Default)]
struct SearchSpace {
    ints: HashMap<String, ([i64; 2], IntParam)>,
    log_floats: HashMap<String, ([f64; 2], FloatParam)>,
    floats: HashMap<String, ([f64; 2], FloatParam)>,
    categoricals: HashMap<String, (usize, CategoricalParam<usize>)>,
}

fn check_range(name: &str, low: f64, high: f64) -> Result<()> {
    if !(low <= high) {
        return Err(AeError::invalid(name, format!("empty range [{low}, {high}]")));
    }
    Ok(())
}

fn check_bounds<T: PartialEq + std::fmt::Debug>(name: &str, known: &T, requested: &T) -> Result<()> {
    if known != requested {
        return Err(AeError::invalid(
            name,
            format!("bounds {requested:?} differ from earlier trials {known:?}"),
        ));
    }
    Ok(())
}

/// One sampled configuration under evaluation.
pub struct SearchTrial<'t> {
    number: usize,
    trial: &'t mut optimizer::Trial,
    space: &'t Mutex<SearchSpace>,
    params: ParamSet,
    intermediate_values: BTreeMap<usize, f64>,
}

impl<'t> SearchTrial<'t> {
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    /// Records the metric value at `step`; later reports for a step are ignored.
    pub fn report(&mut self, step: usize, value: f64) {
        if self.intermediate_values.contains_key(&step) {
            return;
        }
        self.intermediate_values.insert(step, value);
        self.trial.report(step as u64, value);
    }

    pub fn should_prune(&mut self) -> bool {
        self.trial.should_prune()
    }

    fn remembered(&self, name: &str) -> Option<&ParameterValue> {
        self.params.get(name)
    }
}

impl ParamProvider for SearchTrial<'_> {
    fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64> {
        if let Some(v) = self.remembered(name).and_then(ParameterValue::as_int) {
            return Ok(v);
        }
        check_range(name, low as f64, high as f64)?;
        let mut space = lock(self.space);
        let (bounds, param) = space
            .ints
            .entry(name.to_string())
            .or_insert_with(|| ([low, high], IntParam::new(low, high).name(name)));
        check_bounds(name, bounds, &[low, high])?;
        let v: i64 = param.suggest(&mut *self.trial).map_err(search_error)?;
        self.params.insert(name.to_string(), ParameterValue::Int(v));
        Ok(v)
    }

    fn suggest_categorical(&mut self, name: &str, choices: &[ParameterValue]) -> Result<ParameterValue> {
        if let Some(v) = self.remembered(name) {
            return Ok(v.clone());
        }
        if choices.is_empty() {
            return Err(AeError::invalid(name, "no choices"));
        }
        let mut space = lock(self.space);
        let (count, param) = space.categoricals.entry(name.to_string()).or_insert_with(|| {
            let indices: Vec<usize> = (0..choices.len()).collect();
            (choices.len(), CategoricalParam::new(indices).name(name))
        });
        check_bounds(name, count, &choices.len())?;
        let index: usize = param.suggest(&mut *self.trial).map_err(search_error)?;
        let v = choices
            .get(index)
            .cloned()
            .ok_or_else(|| AeError::invalid(name, format!("choice {index} out of range")))?;
        self.params.insert(name.to_string(), v.clone());
        Ok(v)
    }

    fn suggest_loguniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64> {
        if let Some(v) = self.remembered(name).and_then(ParameterValue::as_float) {
            return Ok(v);
        }
        check_range(name, low, high)?;
        if low <= 0.0 {
            return Err(AeError::invalid(name, "log-uniform range needs low > 0"));
        }
        let mut space = lock(self.space);
        let (bounds, param) = space
            .log_floats
            .entry(name.to_string())
            .or_insert_with(|| ([low, high], FloatParam::new(low, high).log_scale().name(name)));
        check_bounds(name, bounds, &[low, high])?;
        let v: f64 = param.suggest(&mut *self.trial).map_err(search_error)?;
        self.params.insert(name.to_string(), ParameterValue::Float(v));
        Ok(v)
    }

    fn suggest_uniform(&mut self, name: &str, low: f64, high: f64) -> Result<f64> {
        if let Some(v) = self.remembered(name).and_then(ParameterValue::as_float) {
            return Ok(v);
        }
        check_range(name, low, high)?;
        let mut space = lock(self.space);
        let (bounds, param) = space
            .floats
            .entry(name.to_string())
            .or_insert_with(|| ([low, high], FloatParam::new(low, high).name(name)));
        check_bounds(name, bounds, &[low, high])?;
        let v: f64 = param.suggest(&mut *self.trial).map_err(search_error)?;
        self.params.insert(name.to_string(), ParameterValue::Float(v));
        Ok(v)
    }
}

/// Reports a history metric to a trial after every epoch and stops the run
/// once the pruner gives up on it.
pub struct PruningCallback<'a, 't> {
    trial: &'a mut SearchTrial<'t>,
    monitor: String,
}

impl<'a, 't> PruningCallback<'a, 't> {
    pub fn new(trial: &'a mut SearchTrial<'t>, monitor: &str) -> Self {
        Self {
            trial,
            monitor: monitor.to_string(),
        }
    }
}

impl EpochCallback for PruningCallback<'_, '_> {
    fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs) -> CallbackAction {
        let Some(value) = logs.get(&self.monitor) else {
            warn!(metric = %self.monitor, "monitored metric missing from epoch logs");
            return CallbackAction::Continue;
        };
        self.trial.report(epoch, value);
        if self.trial.should_prune() {
            info!(
                trial = self.trial.number(),
                epoch,
                value,
                "✂️  Trial pruned"
            );
            CallbackAction::Stop
        } else {
            CallbackAction::Continue
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySummary {
    pub n_complete: usize,
    pub n_pruned: usize,
    pub n_failed: usize,
    pub best: Option<TrialRecord>,
    pub trials: Vec<TrialRecord>,
}

impl StudySummary {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Minimizing study with a seeded TPE sampler and a median pruner.
pub struct HyperparameterSearch {
    study: Study<f64>,
    space: Mutex<SearchSpace>,
    records: Mutex<Vec<TrialRecord>>,
}

impl HyperparameterSearch {
    pub fn new(seed: u64, pruner: &PrunerConfig) -> Result<Self> {
        let sampler = TpeSampler::builder().seed(seed).build().map_err(search_error)?;
        let mut study: Study<f64> = Study::with_sampler(Direction::Minimize, sampler);
        study.set_pruner(
            MedianPruner::new(Direction::Minimize)
                .n_warmup_steps(pruner.n_warmup_steps as _)
                .n_min_trials(pruner.n_startup_trials as _),
        );
        Ok(Self {
            study,
            space: Mutex::new(SearchSpace::default()),
            records: Mutex::new(Vec::new()),
        })
    }

    /// Runs `n_trials` evaluations of `objective` in sequence.
    ///
    /// A trial that returns [`AeError::Pruned`] is recorded as pruned; any other
    /// error, or a NaN objective value, marks it failed without stopping the
    /// study. The study itself sees failed trials as pruned.
    pub fn optimize<F>(&self, n_trials: usize, objective: F) -> Result<()>
    where
        F: Fn(&mut SearchTrial<'_>) -> Result<f64> + Sync,
    {
        let counter = AtomicUsize::new(0);
        self.study
            .optimize(n_trials, |trial: &mut optimizer::Trial| {
                let number = counter.fetch_add(1, Ordering::SeqCst);
                let mut search_trial = SearchTrial {
                    number,
                    trial,
                    space: &self.space,
                    params: ParamSet::new(),
                    intermediate_values: BTreeMap::new(),
                };
                let outcome = objective(&mut search_trial);
                let SearchTrial {
                    params,
                    intermediate_values,
                    ..
                } = search_trial;
                let last_value = intermediate_values.values().next_back().copied();

                let (record_outcome, value, error, result): (_, _, _, std::result::Result<f64, StudyError>) =
                    match outcome {
                        Ok(v) if !v.is_nan() => (TrialOutcome::Complete, Some(v), None, Ok(v)),
                        Ok(_) => {
                            warn!(trial = number, "objective returned NaN");
                            let reason = Some("objective returned NaN".to_string());
                            (TrialOutcome::Failed, None, reason, Err(TrialPruned.into()))
                        }
                        Err(AeError::Pruned { .. }) => {
                            (TrialOutcome::Pruned, last_value, None, Err(TrialPruned.into()))
                        }
                        Err(e) => {
                            warn!(trial = number, error = %e, "trial failed");
                            (TrialOutcome::Failed, None, Some(e.to_string()), Err(TrialPruned.into()))
                        }
                    };
                info!(trial = number, outcome = ?record_outcome, value = ?value, "🏁 Trial finished");

                lock(&self.records).push(TrialRecord {
                    number,
                    outcome: record_outcome,
                    value,
                    params,
                    intermediate_values,
                    error,
                });
                result
            })
            .map_err(search_error)
    }

    pub fn trials(&self) -> Vec<TrialRecord> {
        lock(&self.records).clone()
    }

    /// Completed trial with the lowest objective value.
    pub fn best_trial(&self) -> Option<TrialRecord> {
        best_of(&lock(&self.records)).cloned()
    }

    pub fn summary(&self) -> StudySummary {
        let trials = self.trials();
        let count = |outcome| trials.iter().filter(|t| t.outcome == outcome).count();
        StudySummary {
            n_complete: count(TrialOutcome::Complete),
            n_pruned: count(TrialOutcome::Pruned),
            n_failed: count(TrialOutcome::Failed),
            best: best_of(&trials).cloned(),
            trials,
        }
    }
}

fn best_of(trials: &[TrialRecord]) -> Option<&TrialRecord> {
    trials
        .iter()
        .filter(|t| t.outcome == TrialOutcome::Complete)
        .filter_map(|t| t.value.map(|v| (t, v)))
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(t, _)| t)
}
