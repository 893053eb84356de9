#![forbid(unsafe_code)]

use rkf_runtime::RuntimeMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::InputError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegratorState {
    Running,
    Finished,
    Failed,
}

/// Grid point reached by one call to [`OdeSolver::step`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub grid_index: usize,
    pub t: f64,
    pub y: f64,
    pub state: IntegratorState,
}

/// Working state threaded from one accepted micro-step to the next.
///
/// Only `scale` survives a grid point boundary as a tuning input; `t` and `y`
/// are the accepted solution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepState {
    pub t: f64,
    pub y: f64,
    /// Multiplier on the nominal grid spacing used for the next trial. Always > 0.
    pub scale: f64,
}

impl StepState {
    #[must_use]
    pub const fn initial(t0: f64, y0: f64) -> Self {
        Self {
            t: t0,
            y: y0,
            scale: 1.0,
        }
    }
}

/// The two most recent error estimates of one retry loop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorHistory {
    previous: Option<f64>,
    current: Option<f64>,
}

impl ErrorHistory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            previous: None,
            current: None,
        }
    }

    /// Shift `current` into `previous` and record `err`.
    #[must_use]
    pub const fn push(self, err: f64) -> Self {
        Self {
            previous: self.current,
            current: Some(err),
        }
    }

    #[must_use]
    pub const fn previous(&self) -> Option<f64> {
        self.previous
    }

    #[must_use]
    pub const fn current(&self) -> Option<f64> {
        self.current
    }

    /// `|previous - current| / current`, when both exist and `current > 0`.
    #[must_use]
    pub fn relative_change(&self) -> Option<f64> {
        match (self.previous, self.current) {
            (Some(prev), Some(cur)) if cur > 0.0 => Some((prev - cur).abs() / cur),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegratorError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InputError),
    #[error("derivative produced non-finite value {value} at t={t}, y={y}")]
    NonFiniteState { t: f64, y: f64, value: f64 },
    #[error(
        "no acceptable step after grid point {grid_index} (t={t}) from t={step_t} after {retries} retries (last error estimate {last_err})"
    )]
    Convergence {
        grid_index: usize,
        /// Time of the last grid point reached.
        t: f64,
        /// Start of the micro-step that could not be accepted.
        step_t: f64,
        last_err: f64,
        retries: usize,
    },
    #[error("step span {span} no longer advances t={t}")]
    StepSizeTooSmall { t: f64, span: f64 },
    #[error("trial budget of {max_trials} exhausted at t={t}")]
    TrialBudgetExhausted { t: f64, max_trials: usize },
    #[error("deadline exceeded after {elapsed_ms} ms at t={t}")]
    DeadlineExceeded { t: f64, elapsed_ms: u64 },
    #[error("attempt to step a finished or failed integrator")]
    NotRunning,
}

/// Diagnostic record of one noteworthy event inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepEvent {
    Rejected {
        grid_index: usize,
        t: f64,
        span: f64,
        err: f64,
        next_factor: f64,
    },
    StallAccepted {
        grid_index: usize,
        t: f64,
        span: f64,
        err: f64,
        relative_change: f64,
    },
    GridPoint {
        grid_index: usize,
        t: f64,
        y: f64,
        factor: f64,
        micro_steps: usize,
    },
}

pub trait OdeSolver {
    fn mode(&self) -> RuntimeMode;

    fn state(&self) -> IntegratorState;

    /// Advance to the next nominal grid point.
    fn step(&mut self) -> Result<StepOutcome, IntegratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_history_starts_empty() {
        let history = ErrorHistory::new();
        assert_eq!(history.previous(), None);
        assert_eq!(history.current(), None);
        assert_eq!(history.relative_change(), None);
    }

    #[test]
    fn error_history_single_estimate_has_no_change() {
        let history = ErrorHistory::new().push(0.5);
        assert_eq!(history.current(), Some(0.5));
        assert_eq!(history.relative_change(), None);
    }

    #[test]
    fn error_history_keeps_two_slots() {
        let history = ErrorHistory::new().push(4.0).push(2.0).push(1.0);
        assert_eq!(history.previous(), Some(2.0));
        assert_eq!(history.current(), Some(1.0));
        assert_eq!(history.relative_change(), Some(1.0));
    }

    #[test]
    fn error_history_zero_current_has_no_change() {
        let history = ErrorHistory::new().push(1e-3).push(0.0);
        assert_eq!(history.relative_change(), None);
    }

    #[test]
    fn step_state_initial_scale_is_one() {
        let state = StepState::initial(2.0, -1.0);
        assert_eq!(state.scale, 1.0);
        assert_eq!((state.t, state.y), (2.0, -1.0));
    }

    #[test]
    fn input_error_converts_into_integrator_error() {
        let err: IntegratorError = InputError::MaxRetriesMustBePositive.into();
        assert!(matches!(err, IntegratorError::InvalidInput(_)));
        assert!(err.to_string().starts_with("invalid input:"));
    }

    #[test]
    fn step_event_serializes_with_tag() {
        let event = StepEvent::Rejected {
            grid_index: 3,
            t: 0.3,
            span: 0.1,
            err: 2e-5,
            next_factor: 0.5,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
        assert_eq!(parsed["event"], "rejected");
        assert_eq!(parsed["grid_index"], 3);
    }
}
