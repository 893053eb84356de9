#![forbid(unsafe_code)]

//! Step-scaling heuristic applied after a rejected trial.

/// Safety factor of the classic RKF45 step-scaling rule.
pub const SAFETY: f64 = 0.84;

/// Exponent `1 / (p + 1)` for the 4th-order propagated solution.
pub const ERROR_EXPONENT: f64 = 0.25;

/// `0.84 * (tolerance / err)^0.25`, the factor on the nominal step after a rejection.
///
/// Callers only rescale after a rejection, so `err > tolerance > 0` and the
/// result is below [`SAFETY`]. The value is floored at `f64::MIN_POSITIVE` to
/// keep the scaling factor strictly positive when `tolerance / err` underflows.
#[must_use]
pub fn shrink_factor(tolerance: f64, err: f64) -> f64 {
    (SAFETY * (tolerance / err).powf(ERROR_EXPONENT)).max(f64::MIN_POSITIVE)
}

/// [`shrink_factor`] compounded onto the `scale` of the rejected trial.
#[must_use]
pub fn rescale(scale: f64, tolerance: f64, err: f64) -> f64 {
    (scale * shrink_factor(tolerance, err)).max(f64::MIN_POSITIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrink_matches_classic_formula() {
        let factor = shrink_factor(1e-6, 1.6e-5);
        assert!((factor - 0.42).abs() < 1e-12, "got {factor}");
    }

    #[test]
    fn shrink_always_below_safety_for_rejections() {
        for err in [1.000_001e-6, 1e-5, 1.0, 1e10] {
            let factor = shrink_factor(1e-6, err);
            assert!(factor > 0.0 && factor < SAFETY, "err={err} factor={factor}");
        }
    }

    #[test]
    fn rescale_is_multiplicative() {
        let once = rescale(1.0, 1e-6, 1.6e-5);
        let twice = rescale(once, 1e-6, 1.6e-5);
        assert!((twice - once * once).abs() < 1e-15);
    }

    #[test]
    fn rescale_stays_positive_on_underflow() {
        let scale = rescale(1e-300, 1e-300, 1e300);
        assert!(scale > 0.0);
    }
}
