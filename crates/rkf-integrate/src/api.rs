#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use rkf_runtime::RuntimeMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rk::AdaptiveIntegrator;
use crate::solver::{IntegratorError, IntegratorState, OdeSolver};
use crate::validation::DEFAULT_MAX_RETRIES;

/// Boxed right-hand side `f(t, y)` for configurations chosen at runtime.
pub type DerivativeFn = dyn Fn(f64, f64) -> f64 + Send + Sync;

/// Diagnostic events kept per run when the caller does not choose a capacity.
pub const DEFAULT_LEDGER_CAPACITY: usize = 256;

/// Per-run integrator configuration: the dynamics plus stepping controls.
///
/// `f` must be a pure function of `(t, y)`. A configuration is never mutated
/// by a run and may be shared by concurrent runs when `F: Sync`.
#[derive(Clone)]
pub struct IntegratorConfig<F> {
    pub f: F,
    /// Nominal output grid spacing; the actual spacing is the largest uniform
    /// spacing not exceeding it that divides the horizon.
    pub base_step: f64,
    /// Rejected trials tolerated per micro-step before giving up.
    pub max_retries: usize,
    /// Optional cap on trial steps over the whole run.
    pub max_trials: Option<usize>,
    /// Optional wall-clock budget for the whole run.
    pub deadline: Option<Duration>,
    pub mode: RuntimeMode,
    pub ledger_capacity: usize,
}

impl<F> IntegratorConfig<F>
where
    F: Fn(f64, f64) -> f64,
{
    #[must_use]
    pub fn new(f: F, base_step: f64) -> Self {
        Self {
            f,
            base_step,
            max_retries: DEFAULT_MAX_RETRIES,
            max_trials: None,
            deadline: None,
            mode: RuntimeMode::default(),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_max_trials(mut self, max_trials: usize) -> Self {
        self.max_trials = Some(max_trials);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RuntimeMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = capacity;
        self
    }

    /// Run one simulation with this configuration. See [`run`].
    pub fn run(&self, request: &SimulationRequest) -> Result<SimulationResult, RunFailure> {
        run(self, request)
    }
}

impl<F> fmt::Debug for IntegratorConfig<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegratorConfig")
            .field("base_step", &self.base_step)
            .field("max_retries", &self.max_retries)
            .field("max_trials", &self.max_trials)
            .field("deadline", &self.deadline)
            .field("mode", &self.mode)
            .field("ledger_capacity", &self.ledger_capacity)
            .finish_non_exhaustive()
    }
}

/// Initial condition, horizon and error tolerance of one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub t0: f64,
    pub y0: f64,
    pub t_end: f64,
    /// Maximum accepted absolute local error estimate per micro-step.
    pub tolerance: f64,
}

impl SimulationRequest {
    #[must_use]
    pub const fn new(t0: f64, y0: f64, t_end: f64, tolerance: f64) -> Self {
        Self {
            t0,
            y0,
            t_end,
            tolerance,
        }
    }
}

/// Work counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Right-hand side evaluations.
    pub nfev: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    /// Steps accepted because the error estimate stopped changing, not because it met the tolerance.
    pub stall_accepts: usize,
}

/// Sampled trajectory of one run.
///
/// `times` and `values` have one entry per grid point reached, starting with
/// `(t0, y0)`. `step_factors` starts with `1.0` and gains one entry per
/// rejected trial (the shrunk factor) and one per grid point reached (the
/// factor in effect there).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
    pub step_factors: Vec<f64>,
    pub stats: RunStats,
}

impl SimulationResult {
    pub(crate) fn with_capacity(points: usize) -> Self {
        Self {
            times: Vec::with_capacity(points),
            values: Vec::with_capacity(points),
            step_factors: Vec::with_capacity(points),
            stats: RunStats::default(),
        }
    }

    pub(crate) fn push_sample(&mut self, t: f64, y: f64, factor: f64) {
        self.times.push(t);
        self.values.push(y);
        self.step_factors.push(factor);
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.times.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    #[must_use]
    pub fn final_time(&self) -> Option<f64> {
        self.times.last().copied()
    }

    #[must_use]
    pub fn final_value(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// `(t, y)` pairs in grid order.
    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.times.iter().copied().zip(self.values.iter().copied())
    }
}

/// A failed run together with the samples produced before the failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("run failed after {} samples: {error}", .partial.len())]
pub struct RunFailure {
    #[source]
    pub error: IntegratorError,
    pub partial: SimulationResult,
}

impl From<IntegratorError> for RunFailure {
    fn from(error: IntegratorError) -> Self {
        Self {
            error,
            partial: SimulationResult::default(),
        }
    }
}

/// Integrate `dy/dt = f(t, y)` from `request.t0` to `request.t_end`.
///
/// Samples land on the uniform grid derived from `config.base_step`, the last
/// one exactly at `t_end`. Invalid input fails before `f` is evaluated, with
/// an empty partial result. Any later failure returns every sample reached so
/// far.
pub fn run<F>(
    config: &IntegratorConfig<F>,
    request: &SimulationRequest,
) -> Result<SimulationResult, RunFailure>
where
    F: Fn(f64, f64) -> f64,
{
    let mut integrator = AdaptiveIntegrator::new(config, request)?;
    while integrator.state() == IntegratorState::Running {
        if let Err(error) = integrator.step() {
            return Err(RunFailure {
                error,
                partial: integrator.into_result(),
            });
        }
    }
    Ok(integrator.into_result())
}
