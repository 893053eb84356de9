#![forbid(unsafe_code)]

//! Runge-Kutta-Fehlberg 4(5) stepping on a fixed output grid.
//!
//! Each nominal grid interval is covered by one or more adaptive micro-steps.
//! A micro-step spans `scale * spacing` (clamped to the end of the interval),
//! is accepted when the embedded error estimate meets the tolerance, and is
//! otherwise retried with a rescaled span. The scale carries over from one
//! interval to the next.

use std::time::{Duration, Instant};

use rkf_runtime::{EventLedger, RuntimeMode};

use crate::api::{IntegratorConfig, SimulationRequest, SimulationResult};
use crate::solver::{
    ErrorHistory, IntegratorError, IntegratorState, OdeSolver, StepEvent, StepOutcome, StepState,
};
use crate::step_size::{rescale, shrink_factor};
use crate::validation::{
    grid_intervals, validate_base_step, validate_max_retries, validate_max_trials,
    validate_request,
};

/// Stage capacity of the trial step's scratch storage.
const MAX_STAGES: usize = 6;

/// A micro-step reaching within this fraction of the spacing lands on the grid point.
const LANDING_SNAP: f64 = 1e-10;

/// Butcher tableau for an explicit embedded Runge-Kutta pair.
pub struct ButcherTableau {
    /// A coefficients (lower-triangular, row `i` holds `i` entries).
    pub a: &'static [&'static [f64]],
    /// Weights of the propagated solution.
    pub b: &'static [f64],
    /// Weights of the embedded solution used only for error estimation.
    pub b_hat: &'static [f64],
    /// C coefficients (stage time fractions).
    pub c: &'static [f64],
    /// E coefficients, `b_hat - b`.
    pub e: &'static [f64],
    /// Number of stages.
    pub n_stages: usize,
    /// Order of the propagated solution.
    pub order: usize,
    /// Order of the embedded solution.
    pub embedded_order: usize,
}

// ═══════════════════════════════════════════════════════════════
// RKF45: Runge-Kutta-Fehlberg 4(5) Butcher tableau
// ═══════════════════════════════════════════════════════════════

static RKF45_C: &[f64] = &[0.0, 1.0 / 4.0, 3.0 / 8.0, 12.0 / 13.0, 1.0, 1.0 / 2.0];

static RKF45_A0: &[f64] = &[];
static RKF45_A1: &[f64] = &[1.0 / 4.0];
static RKF45_A2: &[f64] = &[3.0 / 32.0, 9.0 / 32.0];
static RKF45_A3: &[f64] = &[1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0];
static RKF45_A4: &[f64] = &[439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0];
static RKF45_A5: &[f64] = &[
    -8.0 / 27.0,
    2.0,
    -3544.0 / 2565.0,
    1859.0 / 4104.0,
    -11.0 / 40.0,
];

static RKF45_A: &[&[f64]] = &[RKF45_A0, RKF45_A1, RKF45_A2, RKF45_A3, RKF45_A4, RKF45_A5];

static RKF45_B: &[f64] = &[
    25.0 / 216.0,
    0.0,
    1408.0 / 2565.0,
    2197.0 / 4104.0,
    -1.0 / 5.0,
    0.0,
];

static RKF45_B_HAT: &[f64] = &[
    16.0 / 135.0,
    0.0,
    6656.0 / 12825.0,
    28561.0 / 56430.0,
    -9.0 / 50.0,
    2.0 / 55.0,
];

static RKF45_E: &[f64] = &[
    1.0 / 360.0,
    0.0,
    -128.0 / 4275.0,
    -2197.0 / 75240.0,
    1.0 / 50.0,
    2.0 / 55.0,
];

pub static RKF45_TABLEAU: ButcherTableau = ButcherTableau {
    a: RKF45_A,
    b: RKF45_B,
    b_hat: RKF45_B_HAT,
    c: RKF45_C,
    e: RKF45_E,
    n_stages: 6,
    order: 4,
    embedded_order: 5,
};

// ═══════════════════════════════════════════════════════════════
// Core trial step
// ═══════════════════════════════════════════════════════════════

/// Both estimates of one trial step and their difference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialStep {
    /// Propagated (4th-order) estimate.
    pub y_low: f64,
    /// Embedded (5th-order) estimate.
    pub y_high: f64,
    /// `|y_high - y_low|`.
    pub err: f64,
}

/// Evaluate one embedded Runge-Kutta trial of length `span` from `(t, y)`.
///
/// Stage `i` is `k_i = span * f(t + c_i * span, y + sum_j a_ij * k_j)`. The
/// error is summed from the `e` weights directly so it does not cancel
/// against `y`.
pub fn rk_trial<F>(
    fun: &F,
    t: f64,
    y: f64,
    span: f64,
    tableau: &ButcherTableau,
) -> Result<TrialStep, IntegratorError>
where
    F: Fn(f64, f64) -> f64 + ?Sized,
{
    debug_assert!(tableau.n_stages <= MAX_STAGES);
    let mut k = [0.0_f64; MAX_STAGES];

    for s in 0..tableau.n_stages {
        let dy: f64 = tableau.a[s].iter().zip(k.iter()).map(|(a, kj)| a * kj).sum();
        let t_stage = t + tableau.c[s] * span;
        let y_stage = y + dy;
        let slope = fun(t_stage, y_stage);
        if !slope.is_finite() {
            return Err(IntegratorError::NonFiniteState {
                t: t_stage,
                y: y_stage,
                value: slope,
            });
        }
        k[s] = span * slope;
    }

    let weighted = |w: &[f64]| -> f64 { w.iter().zip(k.iter()).map(|(w, ks)| w * ks).sum() };
    let y_low = y + weighted(tableau.b);
    let delta = weighted(tableau.e);
    if !y_low.is_finite() || !delta.is_finite() {
        return Err(IntegratorError::NonFiniteState {
            t: t + span,
            y,
            value: if y_low.is_finite() { delta } else { y_low },
        });
    }

    Ok(TrialStep {
        y_low,
        y_high: y_low + delta,
        err: delta.abs(),
    })
}

// ═══════════════════════════════════════════════════════════════
// Grid integrator state machine
// ═══════════════════════════════════════════════════════════════

/// Adaptive RKF45 integrator that reports one sample per nominal grid point.
///
/// Construct it with [`AdaptiveIntegrator::new`] and call [`OdeSolver::step`]
/// until the state leaves `Running`, or use [`crate::run`]. The result
/// accumulated so far stays readable after a failure.
pub struct AdaptiveIntegrator<'a, F> {
    fun: &'a F,
    tableau: &'static ButcherTableau,
    mode: RuntimeMode,
    state: IntegratorState,
    // Grid
    t0: f64,
    t_end: f64,
    intervals: usize,
    spacing: f64,
    grid_index: usize,
    // Controls
    tolerance: f64,
    max_retries: usize,
    max_trials: Option<usize>,
    deadline: Option<Duration>,
    started: Instant,
    // Working state
    step: StepState,
    trials: usize,
    result: SimulationResult,
    ledger: EventLedger<StepEvent>,
}

impl<'a, F> AdaptiveIntegrator<'a, F>
where
    F: Fn(f64, f64) -> f64,
{
    /// Validate the configuration and request and emit the initial sample `(t0, y0)`.
    pub fn new(
        config: &'a IntegratorConfig<F>,
        request: &SimulationRequest,
    ) -> Result<Self, IntegratorError> {
        let base_step = validate_base_step(config.base_step)?;
        let max_retries = validate_max_retries(config.max_retries)?;
        let max_trials = validate_max_trials(config.max_trials)?;
        validate_request(request)?;

        let intervals = grid_intervals(request.t0, request.t_end, base_step)?;
        let spacing = if intervals == 0 {
            0.0
        } else {
            (request.t_end - request.t0) / intervals as f64
        };

        let mut result = SimulationResult::with_capacity(intervals + 1);
        let step = StepState::initial(request.t0, request.y0);
        result.push_sample(request.t0, request.y0, step.scale);

        let state = if intervals == 0 {
            IntegratorState::Finished
        } else {
            IntegratorState::Running
        };

        Ok(Self {
            fun: &config.f,
            tableau: &RKF45_TABLEAU,
            mode: config.mode,
            state,
            t0: request.t0,
            t_end: request.t_end,
            intervals,
            spacing,
            grid_index: 0,
            tolerance: request.tolerance,
            max_retries,
            max_trials,
            deadline: config.deadline,
            started: Instant::now(),
            step,
            trials: 0,
            result,
            ledger: EventLedger::new(config.ledger_capacity),
        })
    }

    /// Time of grid point `index`; the last point is exactly `t_end`.
    #[must_use]
    pub fn grid_time(&self, index: usize) -> f64 {
        if index >= self.intervals {
            self.t_end
        } else {
            self.t0 + index as f64 * self.spacing
        }
    }

    /// Number of grid points, endpoints included.
    #[must_use]
    pub const fn grid_len(&self) -> usize {
        self.intervals + 1
    }

    /// Uniform spacing of the output grid (`0` for a degenerate horizon).
    #[must_use]
    pub const fn spacing(&self) -> f64 {
        self.spacing
    }

    /// Index of the last grid point reached.
    #[must_use]
    pub const fn grid_index(&self) -> usize {
        self.grid_index
    }

    #[must_use]
    pub const fn step_state(&self) -> StepState {
        self.step
    }

    /// Trial steps attempted so far, accepted or not.
    #[must_use]
    pub const fn trials(&self) -> usize {
        self.trials
    }

    #[must_use]
    pub const fn result(&self) -> &SimulationResult {
        &self.result
    }

    #[must_use]
    pub const fn ledger(&self) -> &EventLedger<StepEvent> {
        &self.ledger
    }

    #[must_use]
    pub fn into_result(self) -> SimulationResult {
        self.result
    }

    fn check_budget(&self) -> Result<(), IntegratorError> {
        if let Some(max_trials) = self.max_trials
            && self.trials >= max_trials
        {
            return Err(IntegratorError::TrialBudgetExhausted {
                t: self.step.t,
                max_trials,
            });
        }
        if let Some(deadline) = self.deadline {
            let elapsed = self.started.elapsed();
            if elapsed >= deadline {
                return Err(IntegratorError::DeadlineExceeded {
                    t: self.step.t,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Take one accepted micro-step toward `t_next`, retrying rejected trials.
    fn advance_micro_step(&mut self, t_next: f64) -> Result<(), IntegratorError> {
        let StepState { t, y, .. } = self.step;
        let mut history = ErrorHistory::new();
        let mut retries = 0;

        loop {
            self.check_budget()?;

            let remaining = t_next - t;
            let nominal = self.step.scale * self.spacing;
            let lands = nominal >= remaining - LANDING_SNAP * self.spacing;
            let span = if lands { remaining } else { nominal };
            if !lands && t + span <= t {
                return Err(IntegratorError::StepSizeTooSmall { t, span });
            }

            self.trials += 1;
            let trial = rk_trial(self.fun, t, y, span, self.tableau)?;
            self.result.stats.nfev += self.tableau.n_stages;
            history = history.push(trial.err);

            let accepted = if trial.err <= self.tolerance {
                true
            } else if let Some(change) = history.relative_change()
                && self.mode.allows_stall_fallback()
                && change <= self.tolerance
            {
                self.result.stats.stall_accepts += 1;
                self.ledger.record(StepEvent::StallAccepted {
                    grid_index: self.grid_index,
                    t,
                    span,
                    err: trial.err,
                    relative_change: change,
                });
                true
            } else {
                false
            };

            if accepted {
                self.step.t = if lands { t_next } else { t + span };
                self.step.y = trial.y_low;
                self.result.stats.accepted_steps += 1;
                return Ok(());
            }

            if retries == self.max_retries {
                return Err(IntegratorError::Convergence {
                    grid_index: self.grid_index,
                    t: self.grid_time(self.grid_index),
                    step_t: t,
                    last_err: trial.err,
                    retries,
                });
            }
            retries += 1;

            // Hardened compounds onto the tried span; a landing span can be shorter than nominal.
            self.step.scale = if self.mode.compounds_rescale() {
                rescale(span / self.spacing, self.tolerance, trial.err)
            } else {
                shrink_factor(self.tolerance, trial.err)
            };
            self.result.step_factors.push(self.step.scale);
            self.result.stats.rejected_steps += 1;
            self.ledger.record(StepEvent::Rejected {
                grid_index: self.grid_index,
                t,
                span,
                err: trial.err,
                next_factor: self.step.scale,
            });
        }
    }

    fn advance_interval(&mut self) -> Result<StepOutcome, IntegratorError> {
        let target = self.grid_index + 1;
        let t_next = self.grid_time(target);

        let mut micro_steps = 0;
        while self.step.t < t_next {
            self.advance_micro_step(t_next)?;
            micro_steps += 1;
        }

        self.grid_index = target;
        self.result.push_sample(t_next, self.step.y, self.step.scale);
        self.ledger.record(StepEvent::GridPoint {
            grid_index: target,
            t: t_next,
            y: self.step.y,
            factor: self.step.scale,
            micro_steps,
        });
        if target == self.intervals {
            self.state = IntegratorState::Finished;
        }

        Ok(StepOutcome {
            grid_index: target,
            t: t_next,
            y: self.step.y,
            state: self.state,
        })
    }
}

impl<F> OdeSolver for AdaptiveIntegrator<'_, F>
where
    F: Fn(f64, f64) -> f64,
{
    fn mode(&self) -> RuntimeMode {
        self.mode
    }

    fn state(&self) -> IntegratorState {
        self.state
    }

    fn step(&mut self) -> Result<StepOutcome, IntegratorError> {
        if self.state != IntegratorState::Running {
            return Err(IntegratorError::NotRunning);
        }
        self.advance_interval().inspect_err(|_| {
            self.state = IntegratorState::Failed;
        })
    }
}

#[cfg(test)]
mod tests {
    use rkf_runtime::assert_close_slice;

    use super::*;

    fn decay(_t: f64, y: f64) -> f64 {
        -y
    }

    fn decay_config(base_step: f64) -> IntegratorConfig<fn(f64, f64) -> f64> {
        IntegratorConfig::new(decay as fn(f64, f64) -> f64, base_step)
    }

    #[test]
    fn tableau_rows_are_consistent() {
        let tab = &RKF45_TABLEAU;
        assert_eq!(tab.a.len(), tab.n_stages);
        for (i, row) in tab.a.iter().enumerate() {
            assert_eq!(row.len(), i, "row {i} length");
            let row_sum: f64 = row.iter().sum();
            assert!((row_sum - tab.c[i]).abs() < 1e-14, "row {i} sums to c");
        }
        let b_sum: f64 = tab.b.iter().sum();
        let b_hat_sum: f64 = tab.b_hat.iter().sum();
        assert!((b_sum - 1.0).abs() < 1e-14);
        assert!((b_hat_sum - 1.0).abs() < 1e-14);
    }

    #[test]
    fn tableau_error_weights_are_difference() {
        let tab = &RKF45_TABLEAU;
        for i in 0..tab.n_stages {
            assert!(
                (tab.e[i] - (tab.b_hat[i] - tab.b[i])).abs() < 1e-15,
                "e[{i}] mismatch"
            );
        }
    }

    #[test]
    fn rk_trial_exponential_decay_accuracy() {
        let trial = rk_trial(&|_t: f64, y: f64| -0.5 * y, 0.0, 2.0, 0.1, &RKF45_TABLEAU)
            .expect("finite trial");
        let exact = 2.0 * (-0.05_f64).exp();
        assert!((trial.y_low - exact).abs() < 1e-8, "y4 = {}", trial.y_low);
        assert!((trial.y_high - exact).abs() < 1e-9, "y5 = {}", trial.y_high);
        assert!(trial.err < 1e-8);
    }

    #[test]
    fn rk_trial_constant_slope_has_no_error() {
        let trial =
            rk_trial(&|_t: f64, _y: f64| 0.0, 1.0, 3.0, 0.5, &RKF45_TABLEAU).expect("finite");
        assert_eq!(trial.err, 0.0);
        assert_eq!(trial.y_low, 3.0);
    }

    #[test]
    fn rk_trial_stage_times_scale_with_span() {
        let recorder = std::cell::RefCell::new(Vec::new());
        rk_trial(
            &|t: f64, _y: f64| {
                recorder.borrow_mut().push(t);
                1.0
            },
            1.0,
            0.0,
            0.5,
            &RKF45_TABLEAU,
        )
        .expect("finite");
        let expected: Vec<f64> = RKF45_C.iter().map(|c| 1.0 + c * 0.5).collect();
        assert_eq!(recorder.into_inner(), expected);
    }

    #[test]
    fn rk_trial_reports_non_finite_slope() {
        let err = rk_trial(&|_t: f64, y: f64| 1.0 / y, 0.0, 0.0, 0.1, &RKF45_TABLEAU)
            .expect_err("singular at y = 0");
        match err {
            IntegratorError::NonFiniteState { t, y, value } => {
                assert_eq!(t, 0.0);
                assert_eq!(y, 0.0);
                assert!(value.is_infinite());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn integrator_emits_initial_sample() {
        let config = decay_config(0.25);
        let integrator =
            AdaptiveIntegrator::new(&config, &SimulationRequest::new(0.0, 1.0, 1.0, 1e-8))
                .expect("valid");
        assert_eq!(integrator.state(), IntegratorState::Running);
        assert_eq!(integrator.result().times, vec![0.0]);
        assert_eq!(integrator.result().values, vec![1.0]);
        assert_eq!(integrator.result().step_factors, vec![1.0]);
        assert_eq!(integrator.grid_len(), 5);
        assert_eq!(integrator.spacing(), 0.25);
    }

    #[test]
    fn integrator_degenerate_horizon_is_finished() {
        let config = decay_config(0.1);
        let mut integrator =
            AdaptiveIntegrator::new(&config, &SimulationRequest::new(2.0, 3.0, 2.0, 1e-6))
                .expect("valid");
        assert_eq!(integrator.state(), IntegratorState::Finished);
        assert_eq!(integrator.step(), Err(IntegratorError::NotRunning));
    }

    #[test]
    fn integrator_steps_one_grid_point_at_a_time() {
        let config = decay_config(0.5);
        let mut integrator =
            AdaptiveIntegrator::new(&config, &SimulationRequest::new(0.0, 1.0, 1.0, 1e-10))
                .expect("valid");
        let first = integrator.step().expect("first interval");
        assert_eq!(first.grid_index, 1);
        assert_eq!(first.t, 0.5);
        assert_eq!(first.state, IntegratorState::Running);
        let second = integrator.step().expect("second interval");
        assert_eq!(second.t, 1.0);
        assert_eq!(second.state, IntegratorState::Finished);
        assert!((second.y - (-1.0_f64).exp()).abs() < 1e-8);
        assert_eq!(integrator.step(), Err(IntegratorError::NotRunning));
    }

    #[test]
    fn integrator_last_grid_time_is_exact() {
        let config = decay_config(0.3);
        let integrator =
            AdaptiveIntegrator::new(&config, &SimulationRequest::new(0.1, 1.0, 1.3, 1e-6))
                .expect("valid");
        assert_eq!(integrator.grid_len(), 5);
        assert_eq!(integrator.grid_time(4), 1.3);
        assert!((integrator.spacing() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn integrator_failure_marks_failed_and_keeps_partial() {
        let config = IntegratorConfig::new(
            |t: f64, y: f64| if t > 0.35 { f64::NAN } else { -y },
            0.1,
        );
        let mut integrator =
            AdaptiveIntegrator::new(&config, &SimulationRequest::new(0.0, 1.0, 1.0, 1e-8))
                .expect("valid");
        let err = loop {
            match integrator.step() {
                Ok(_) => {}
                Err(err) => break err,
            }
        };
        assert!(matches!(err, IntegratorError::NonFiniteState { .. }));
        assert_eq!(integrator.state(), IntegratorState::Failed);
        assert_eq!(integrator.result().times.len(), 4);
        assert!(integrator.result().values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn integrator_rejection_shrinks_scale_and_records_event() {
        let config = decay_config(0.5);
        let mut integrator =
            AdaptiveIntegrator::new(&config, &SimulationRequest::new(0.0, 1.0, 0.5, 1e-7))
                .expect("valid");
        integrator.step().expect("interval");
        let scale = integrator.step_state().scale;
        assert!(scale < 0.84, "scale {scale}");
        assert!(integrator.result().stats.rejected_steps >= 1);
        assert!(
            integrator
                .ledger()
                .iter()
                .any(|e| matches!(e, StepEvent::Rejected { .. }))
        );
        assert!(matches!(
            integrator.ledger().latest(),
            Some(StepEvent::GridPoint { grid_index: 1, .. })
        ));
    }

    fn growth(_t: f64, y: f64) -> f64 {
        y
    }

    /// Run `y' = y` over five unit intervals and return the result, the
    /// rejection events, and the grid spacing.
    fn growth_run(mode: RuntimeMode) -> (SimulationResult, Vec<StepEvent>, f64) {
        let config = IntegratorConfig::new(growth as fn(f64, f64) -> f64, 1.0).with_mode(mode);
        let mut integrator =
            AdaptiveIntegrator::new(&config, &SimulationRequest::new(0.0, 1.0, 5.0, 1e-6))
                .expect("valid");
        while integrator.state() == IntegratorState::Running {
            integrator.step().expect("growth run");
        }
        let rejected = integrator
            .ledger()
            .iter()
            .filter(|e| matches!(e, StepEvent::Rejected { .. }))
            .copied()
            .collect();
        let spacing = integrator.spacing();
        (integrator.into_result(), rejected, spacing)
    }

    #[test]
    fn strict_rejection_rescales_nominal_step() {
        let (result, rejected, _) = growth_run(RuntimeMode::Strict);
        for event in rejected {
            let StepEvent::Rejected { err, next_factor, .. } = event else {
                unreachable!()
            };
            assert_eq!(next_factor, shrink_factor(1e-6, err));
        }

        // Later rejections restart from the nominal step: the factor grows, is rejected, then shrinks.
        assert_eq!(result.stats.rejected_steps, 5);
        assert_close_slice(
            &result.step_factors,
            &[
                1.0,
                0.157_882_113_835_366_57,
                0.157_882_113_835_366_57,
                0.157_882_113_835_366_57,
                0.835_071_984_079_028_9,
                0.112_627_303_202_049_65,
                0.112_627_303_202_049_65,
                0.112_627_303_202_049_65,
                0.800_090_251_263_806_1,
                0.074_613_139_639_421_37,
                0.074_613_139_639_421_37,
            ],
            0.0,
            1e-10,
        );
        assert_close_slice(
            &result.values,
            &(0_i32..=5).map(|k| f64::from(k).exp()).collect::<Vec<_>>(),
            0.0,
            1e-5,
        );
    }

    #[test]
    fn hardened_rejection_compounds_tried_span() {
        let (result, rejected, spacing) = growth_run(RuntimeMode::Hardened);
        for event in rejected {
            let StepEvent::Rejected { span, err, next_factor, .. } = event else {
                unreachable!()
            };
            assert_eq!(next_factor, rescale(span / spacing, 1e-6, err));
        }

        assert_eq!(result.stats.rejected_steps, 4);
        assert!(result.step_factors.windows(2).all(|w| w[1] <= w[0]));
        assert_close_slice(
            &result.step_factors[..5],
            &[
                1.0,
                0.157_882_113_835_366_57,
                0.157_882_113_835_366_57,
                0.157_882_113_835_366_57,
                0.131_842_930_051_090_66,
            ],
            0.0,
            1e-10,
        );
    }
}
