#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rkf_integrate::{
    SimulationRequest, grid_intervals, validate_base_step, validate_max_retries,
    validate_max_trials, validate_request,
};

#[derive(Debug, Arbitrary)]
struct RequestInput {
    t0: f64,
    y0: f64,
    t_end: f64,
    tolerance: f64,
    base_step: f64,
    max_retries: u16,
    max_trials: Option<u16>,
}

fuzz_target!(|input: RequestInput| {
    let request = SimulationRequest::new(input.t0, input.y0, input.t_end, input.tolerance);
    let _ = validate_max_retries(usize::from(input.max_retries));
    let _ = validate_max_trials(input.max_trials.map(usize::from));
    if validate_request(&request).is_ok()
        && let Ok(base_step) = validate_base_step(input.base_step)
        && let Ok(intervals) = grid_intervals(input.t0, input.t_end, base_step)
    {
        assert!(input.t_end > input.t0 || intervals == 0);
        assert!(input.t_end == input.t0 || intervals >= 1);
    }
});
