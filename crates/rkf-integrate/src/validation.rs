#![forbid(unsafe_code)]

use thiserror::Error;

use crate::api::SimulationRequest;

/// Retry cap applied when the caller does not choose one.
pub const DEFAULT_MAX_RETRIES: usize = 100;

/// Largest output grid a single run will allocate.
pub const MAX_GRID_POINTS: usize = 50_000_000;

/// A horizon/step ratio this close (relative) to an integer counts as that integer.
pub const GRID_RATIO_SNAP: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum InputError {
    #[error("`base_step` must be positive and finite (got {base_step}).")]
    BaseStepMustBePositive { base_step: f64 },
    #[error("`tolerance` must be positive and finite (got {tolerance}).")]
    ToleranceMustBePositive { tolerance: f64 },
    #[error("`{field}` must be finite (got {value}).")]
    NonFiniteInput { field: &'static str, value: f64 },
    #[error("`t_end` ({t_end}) precedes `t0` ({t0}).")]
    HorizonReversed { t0: f64, t_end: f64 },
    #[error("`max_retries` must be at least 1.")]
    MaxRetriesMustBePositive,
    #[error("`max_trials` must be at least 1 when set.")]
    MaxTrialsMustBePositive,
    #[error("output grid of {points} points exceeds the limit of {max}.", max = MAX_GRID_POINTS)]
    GridTooLarge { points: f64 },
}

pub fn validate_base_step(base_step: f64) -> Result<f64, InputError> {
    if !(base_step > 0.0 && base_step.is_finite()) {
        return Err(InputError::BaseStepMustBePositive { base_step });
    }
    Ok(base_step)
}

pub fn validate_tolerance(tolerance: f64) -> Result<f64, InputError> {
    if !(tolerance > 0.0 && tolerance.is_finite()) {
        return Err(InputError::ToleranceMustBePositive { tolerance });
    }
    Ok(tolerance)
}

fn require_finite(field: &'static str, value: f64) -> Result<f64, InputError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(InputError::NonFiniteInput { field, value })
    }
}

/// Check `t0 <= t_end`, both finite.
pub fn validate_horizon(t0: f64, t_end: f64) -> Result<(f64, f64), InputError> {
    require_finite("t0", t0)?;
    require_finite("t_end", t_end)?;
    if t_end < t0 {
        return Err(InputError::HorizonReversed { t0, t_end });
    }
    Ok((t0, t_end))
}

pub fn validate_max_retries(max_retries: usize) -> Result<usize, InputError> {
    if max_retries == 0 {
        return Err(InputError::MaxRetriesMustBePositive);
    }
    Ok(max_retries)
}

pub fn validate_max_trials(max_trials: Option<usize>) -> Result<Option<usize>, InputError> {
    if max_trials == Some(0) {
        return Err(InputError::MaxTrialsMustBePositive);
    }
    Ok(max_trials)
}

/// Validate every field of a request.
pub fn validate_request(request: &SimulationRequest) -> Result<(), InputError> {
    validate_horizon(request.t0, request.t_end)?;
    require_finite("y0", request.y0)?;
    validate_tolerance(request.tolerance)?;
    Ok(())
}

/// Number of uniform intervals covering `[t0, t_end]` with spacing at most `base_step`.
///
/// This is `ceil((t_end - t0) / base_step)`, except that a ratio within
/// [`GRID_RATIO_SNAP`] of an integer rounds to it, so `5.0 / 0.001` yields
/// 5000 intervals rather than 5001. A non-empty horizon always has at least
/// one interval.
pub fn grid_intervals(t0: f64, t_end: f64, base_step: f64) -> Result<usize, InputError> {
    let ratio = (t_end - t0) / base_step;
    if !ratio.is_finite() {
        return Err(InputError::GridTooLarge { points: ratio });
    }
    let nearest = ratio.round();
    let mut intervals = if (ratio - nearest).abs() <= GRID_RATIO_SNAP * nearest.max(1.0) {
        nearest
    } else {
        ratio.ceil()
    };
    if intervals == 0.0 && t_end > t0 {
        intervals = 1.0;
    }
    let points = intervals + 1.0;
    if points > MAX_GRID_POINTS as f64 {
        return Err(InputError::GridTooLarge { points });
    }
    Ok(intervals as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_step_positive_passthrough() {
        assert_eq!(validate_base_step(0.25), Ok(0.25));
    }

    #[test]
    fn base_step_zero_negative_nan_inf_rejected() {
        for bad in [0.0, -0.1, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(
                    validate_base_step(bad),
                    Err(InputError::BaseStepMustBePositive { .. })
                ),
                "base_step {bad} should be rejected"
            );
        }
    }

    #[test]
    fn tolerance_must_be_positive() {
        assert_eq!(validate_tolerance(1e-12), Ok(1e-12));
        assert!(validate_tolerance(0.0).is_err());
        assert!(validate_tolerance(-1e-6).is_err());
        assert!(validate_tolerance(f64::NAN).is_err());
    }

    #[test]
    fn horizon_reversed_rejected() {
        assert_eq!(
            validate_horizon(2.0, 1.0),
            Err(InputError::HorizonReversed { t0: 2.0, t_end: 1.0 })
        );
        assert_eq!(validate_horizon(1.0, 1.0), Ok((1.0, 1.0)));
    }

    #[test]
    fn horizon_non_finite_names_field() {
        let err = validate_horizon(0.0, f64::INFINITY).expect_err("infinite t_end");
        assert!(matches!(
            err,
            InputError::NonFiniteInput { field: "t_end", .. }
        ));
    }

    #[test]
    fn request_rejects_nan_initial_value() {
        let request = SimulationRequest {
            t0: 0.0,
            y0: f64::NAN,
            t_end: 1.0,
            tolerance: 1e-6,
        };
        let err = validate_request(&request).expect_err("NaN y0");
        assert!(matches!(err, InputError::NonFiniteInput { field: "y0", .. }));
    }

    #[test]
    fn retry_and_trial_caps() {
        assert_eq!(validate_max_retries(1), Ok(1));
        assert_eq!(
            validate_max_retries(0),
            Err(InputError::MaxRetriesMustBePositive)
        );
        assert_eq!(validate_max_trials(None), Ok(None));
        assert_eq!(validate_max_trials(Some(3)), Ok(Some(3)));
        assert_eq!(
            validate_max_trials(Some(0)),
            Err(InputError::MaxTrialsMustBePositive)
        );
    }

    #[test]
    fn grid_intervals_exact_ratio() {
        assert_eq!(grid_intervals(0.0, 1.0, 0.25), Ok(4));
        assert_eq!(grid_intervals(0.0, 5.0, 0.001), Ok(5000));
        assert_eq!(grid_intervals(0.0, 20.0, 0.01), Ok(2000));
        assert_eq!(grid_intervals(0.0, 1.0, 0.1), Ok(10));
    }

    #[test]
    fn grid_intervals_ceil_for_partial_step() {
        assert_eq!(grid_intervals(0.0, 1.0, 0.3), Ok(4));
        assert_eq!(grid_intervals(0.0, 1.0, 2.0), Ok(1));
    }

    #[test]
    fn grid_intervals_degenerate_horizon() {
        assert_eq!(grid_intervals(3.0, 3.0, 0.1), Ok(0));
    }

    #[test]
    fn grid_intervals_tiny_horizon_keeps_endpoint() {
        assert_eq!(grid_intervals(0.0, 1e-15, 1.0), Ok(1));
    }

    #[test]
    fn grid_intervals_too_many_points() {
        assert!(matches!(
            grid_intervals(0.0, 1.0, 1e-12),
            Err(InputError::GridTooLarge { .. })
        ));
    }

    #[test]
    fn error_messages_name_the_field() {
        let msg = InputError::ToleranceMustBePositive { tolerance: -1.0 }.to_string();
        assert!(msg.contains("`tolerance`"), "{msg}");
        let msg = InputError::HorizonReversed { t0: 2.0, t_end: 1.0 }.to_string();
        assert!(msg.contains("precedes"), "{msg}");
    }
}
