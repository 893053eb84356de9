#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rkf_integrate::{IntegratorConfig, SimulationRequest, run};
use rkf_runtime::RuntimeMode;

#[derive(Debug, Arbitrary)]
struct RunInput {
    hardened: bool,
    /// Coefficients of `f(t, y) = a + b*y + c*t + d*y^2`.
    coefficients: [f64; 4],
    y0: f64,
    horizon: f64,
    base_step: f64,
    tolerance: f64,
    max_retries: u8,
}

fuzz_target!(|input: RunInput| {
    let mode = if input.hardened {
        RuntimeMode::Hardened
    } else {
        RuntimeMode::Strict
    };
    let [a, b, c, d] = input.coefficients;
    let f = move |t: f64, y: f64| a + b * y + c * t + d * y * y;

    // Keep the grid small so each input runs quickly.
    let base_step = input.base_step.abs().clamp(1e-3, 1.0);
    let horizon = if input.horizon.is_finite() {
        input.horizon.abs().min(10.0)
    } else {
        1.0
    };
    let config = IntegratorConfig::new(f, base_step)
        .with_mode(mode)
        .with_max_retries(usize::from(input.max_retries).max(1))
        .with_max_trials(20_000);
    let request = SimulationRequest::new(0.0, input.y0, horizon, input.tolerance);

    match run(&config, &request) {
        Ok(result) => {
            assert_eq!(result.times.len(), result.values.len());
            assert!(result.values.iter().all(|v| v.is_finite()));
            assert_eq!(result.final_time(), Some(horizon));
        }
        Err(failure) => {
            assert_eq!(failure.partial.times.len(), failure.partial.values.len());
            assert!(failure.partial.values.iter().all(|v| v.is_finite()));
        }
    }
});
