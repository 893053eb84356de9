#![forbid(unsafe_code)]

//! Adaptive Runge-Kutta-Fehlberg 4(5) integration of scalar ODEs `dy/dt = f(t, y)`,
//! sampled on a fixed, uniform output grid.

pub mod api;
pub mod rk;
pub mod solver;
pub mod step_size;
pub mod validation;

pub use api::{
    DEFAULT_LEDGER_CAPACITY, DerivativeFn, IntegratorConfig, RunFailure, RunStats,
    SimulationRequest, SimulationResult, run,
};
pub use rk::{AdaptiveIntegrator, ButcherTableau, RKF45_TABLEAU, TrialStep, rk_trial};
pub use solver::{
    ErrorHistory, IntegratorError, IntegratorState, OdeSolver, StepEvent, StepOutcome, StepState,
};
pub use step_size::{rescale, shrink_factor};
pub use validation::{
    DEFAULT_MAX_RETRIES, GRID_RATIO_SNAP, InputError, MAX_GRID_POINTS, grid_intervals,
    validate_base_step, validate_horizon, validate_max_retries, validate_max_trials,
    validate_request, validate_tolerance,
};
