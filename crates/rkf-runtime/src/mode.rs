#![forbid(unsafe_code)]

//! Runtime mode definitions for Strict (documented-behaviour) and Hardened operation.

use serde::{Deserialize, Serialize};

/// Operational mode governing compatibility/safety trade-offs.
///
/// - **Strict**: Follow the documented integrator behaviour exactly. A
///   rejected trial resets the scaling factor to `0.84 * (tol / err)^0.25`
///   of the nominal step, and the stall fallback accepts a step once
///   successive error estimates stop changing.
/// - **Hardened**: Never accept a step whose error estimate exceeds the
///   tolerance, and compound each rejection onto the span actually tried so
///   the factor only shrinks. An estimate stuck above tolerance surfaces as a
///   convergence failure instead of a silently degraded sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeMode {
    #[default]
    Strict,
    Hardened,
}

impl RuntimeMode {
    /// Whether the stall fallback may accept an above-tolerance step.
    #[must_use]
    pub const fn allows_stall_fallback(self) -> bool {
        matches!(self, Self::Strict)
    }

    /// Whether a rejection rescales relative to the tried span rather than the nominal step.
    #[must_use]
    pub const fn compounds_rescale(self) -> bool {
        matches!(self, Self::Hardened)
    }
}
