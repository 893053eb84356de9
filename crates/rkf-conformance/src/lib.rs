#![forbid(unsafe_code)]

//! Scenario packet harness for the RKF45 integrator.
//!
//! A packet is a JSON fixture holding cases that each pair a reference
//! equation and request with the outcome the integrator must produce. The
//! harness runs every case through [`rkf_integrate::run`], builds a
//! [`PacketReport`], and can persist it with a blake3 digest and a JSONL log.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use blake3::hash;
use rkf_integrate::{
    IntegratorConfig, IntegratorError, RunFailure, RunStats, SimulationRequest, SimulationResult,
    run,
};
use rkf_runtime::{RuntimeMode, TestLogEntry, TestResult, now_unix_ms, within_tolerance};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REPORT_FILE: &str = "scenario_report.json";
const DIGEST_FILE: &str = "scenario_report.blake3.json";
const LOG_FILE: &str = "scenario_report.log.jsonl";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub artifact_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let fixture_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures");
        Self {
            artifact_root: fixture_root.join("artifacts"),
            fixture_root,
        }
    }

    #[must_use]
    pub fn artifact_dir_for(&self, packet_id: &str) -> PathBuf {
        self.artifact_root.join(packet_id)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("fixture load failed for {path}: {source}")]
    FixtureIo { path: PathBuf, source: io::Error },
    #[error("fixture parse failed for {path}: {source}")]
    FixtureParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("artifact write failed for {path}: {source}")]
    ArtifactIo { path: PathBuf, source: io::Error },
    #[error("artifact encoding failed: {0}")]
    ArtifactEncode(#[from] serde_json::Error),
}

// ═══════════════════════════════════════════════════════════════════
// Reference equations
// ═══════════════════════════════════════════════════════════════════

/// Right-hand sides a fixture may name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Equation {
    /// `y' = slope`
    Constant { slope: f64 },
    /// `y' = 0`
    Zero,
    /// `y' = -rate * y`
    ExponentialDecay { rate: f64 },
    /// `y' = rate * y * (1 - y / capacity)`
    Logistic { rate: f64, capacity: f64 },
    /// `y' = 1 - 2 / y^2`, singular at `y = 0`.
    InverseSquare,
    /// `y' = 1 / t`, with `y'(0) = 0`.
    Reciprocal,
}

impl Equation {
    #[must_use]
    pub fn eval(self, t: f64, y: f64) -> f64 {
        match self {
            Self::Constant { slope } => slope,
            Self::Zero => 0.0,
            Self::ExponentialDecay { rate } => -rate * y,
            Self::Logistic { rate, capacity } => rate * y * (1.0 - y / capacity),
            Self::InverseSquare => 1.0 - 2.0 / (y * y),
            Self::Reciprocal => {
                if t == 0.0 {
                    0.0
                } else {
                    1.0 / t
                }
            }
        }
    }

    /// Closed-form solution through `(t0, y0)`, where one exists.
    #[must_use]
    pub fn analytic(self, t0: f64, y0: f64, t: f64) -> Option<f64> {
        let dt = t - t0;
        match self {
            Self::Constant { slope } => Some(y0 + slope * dt),
            Self::Zero => Some(y0),
            Self::ExponentialDecay { rate } => Some(y0 * (-rate * dt).exp()),
            Self::Logistic { rate, capacity } => {
                Some(capacity * y0 / (y0 + (capacity - y0) * (-rate * dt).exp()))
            }
            Self::InverseSquare => None,
            Self::Reciprocal => (t0 > 0.0 && t > 0.0).then(|| y0 + (t / t0).ln()),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Constant { .. } => "constant",
            Self::Zero => "zero",
            Self::ExponentialDecay { .. } => "exponential_decay",
            Self::Logistic { .. } => "logistic",
            Self::InverseSquare => "inverse_square",
            Self::Reciprocal => "reciprocal",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Fixture schema
// ═══════════════════════════════════════════════════════════════════

/// Failure category, independent of the error's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NonFiniteState,
    Convergence,
    StepSizeTooSmall,
    TrialBudgetExhausted,
    DeadlineExceeded,
    NotRunning,
}

impl From<&IntegratorError> for ErrorKind {
    fn from(error: &IntegratorError) -> Self {
        match error {
            IntegratorError::InvalidInput(_) => Self::InvalidInput,
            IntegratorError::NonFiniteState { .. } => Self::NonFiniteState,
            IntegratorError::Convergence { .. } => Self::Convergence,
            IntegratorError::StepSizeTooSmall { .. } => Self::StepSizeTooSmall,
            IntegratorError::TrialBudgetExhausted { .. } => Self::TrialBudgetExhausted,
            IntegratorError::DeadlineExceeded { .. } => Self::DeadlineExceeded,
            IntegratorError::NotRunning => Self::NotRunning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpectedOutcome {
    Ok {
        samples: usize,
        #[serde(default)]
        final_value: Option<f64>,
        /// Absolute tolerance on `final_value`.
        #[serde(default)]
        atol: f64,
        /// When set, every sample must match the closed form within this tolerance.
        #[serde(default)]
        analytic_atol: Option<f64>,
        #[serde(default)]
        non_decreasing: bool,
    },
    Error {
        error: ErrorKind,
        #[serde(default)]
        partial_samples: Option<usize>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioCase {
    pub case_id: String,
    pub equation: Equation,
    #[serde(default)]
    pub mode: RuntimeMode,
    pub base_step: f64,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub max_trials: Option<usize>,
    pub request: SimulationRequest,
    pub expected: ExpectedOutcome,
}

impl ScenarioCase {
    /// Integrator configuration described by this case.
    #[must_use]
    pub fn config(&self) -> IntegratorConfig<impl Fn(f64, f64) -> f64 + Copy + use<>> {
        let equation = self.equation;
        let rhs = move |t: f64, y: f64| equation.eval(t, y);
        let mut config = IntegratorConfig::new(rhs, self.base_step).with_mode(self.mode);
        if let Some(max_retries) = self.max_retries {
            config = config.with_max_retries(max_retries);
        }
        config.max_trials = self.max_trials;
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketFixture {
    pub packet_id: String,
    pub family: String,
    pub cases: Vec<ScenarioCase>,
}

// ═══════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseResult {
    pub case_id: String,
    pub mode: RuntimeMode,
    pub passed: bool,
    pub message: String,
    /// Work counters of the run, including the partial run of a failure.
    pub stats: RunStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketReport {
    pub packet_id: String,
    pub family: String,
    pub case_results: Vec<CaseResult>,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub generated_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacketSummary {
    pub packet_id: String,
    pub family: String,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub total_cases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportDigest {
    pub ts_unix_ms: u64,
    pub algorithm: String,
    pub digest: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactBundle {
    pub report_path: PathBuf,
    pub digest_path: PathBuf,
    pub log_path: PathBuf,
}

// ═══════════════════════════════════════════════════════════════════
// Harness entry points
// ═══════════════════════════════════════════════════════════════════

/// JSON fixture file names under the fixture root, sorted.
pub fn list_packet_fixtures(config: &HarnessConfig) -> Result<Vec<String>, HarnessError> {
    let entries =
        fs::read_dir(&config.fixture_root).map_err(|source| HarnessError::FixtureIo {
            path: config.fixture_root.clone(),
            source,
        })?;
    let mut names = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| HarnessError::FixtureIo {
                path: config.fixture_root.clone(),
                source,
            })?
            .path();
        if path.is_file()
            && path.extension().is_some_and(|ext| ext == "json")
            && let Some(name) = path.file_name().and_then(|name| name.to_str())
        {
            names.push(name.to_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    HarnessReport {
        suite: "smoke",
        fixture_count: list_packet_fixtures(config).map_or(0, |names| names.len()),
    }
}

pub fn load_packet_fixture(
    config: &HarnessConfig,
    fixture_name: &str,
) -> Result<PacketFixture, HarnessError> {
    let fixture_path = config.fixture_root.join(fixture_name);
    let raw = fs::read_to_string(&fixture_path).map_err(|source| HarnessError::FixtureIo {
        path: fixture_path.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| HarnessError::FixtureParse {
        path: fixture_path,
        source,
    })
}

pub fn run_scenario_packet(
    config: &HarnessConfig,
    fixture_name: &str,
) -> Result<PacketReport, HarnessError> {
    let fixture = load_packet_fixture(config, fixture_name)?;
    Ok(evaluate_packet(&fixture))
}

#[must_use]
pub fn evaluate_packet(fixture: &PacketFixture) -> PacketReport {
    let case_results = fixture.cases.iter().map(run_scenario_case).collect();
    build_packet_report(
        fixture.packet_id.clone(),
        fixture.family.clone(),
        case_results,
    )
}

/// Run one case and compare the outcome with its expectation.
#[must_use]
pub fn run_scenario_case(case: &ScenarioCase) -> CaseResult {
    let outcome = run(&case.config(), &case.request);
    let stats = match &outcome {
        Ok(result) => result.stats,
        Err(failure) => failure.partial.stats,
    };
    let (passed, message) = compare_outcome(case, &outcome);
    CaseResult {
        case_id: case.case_id.clone(),
        mode: case.mode,
        passed,
        message,
        stats,
    }
}

fn compare_outcome(
    case: &ScenarioCase,
    outcome: &Result<SimulationResult, RunFailure>,
) -> (bool, String) {
    match (&case.expected, outcome) {
        (
            ExpectedOutcome::Ok {
                samples,
                final_value,
                atol,
                analytic_atol,
                non_decreasing,
            },
            Ok(result),
        ) => {
            let check = check_trajectory(
                case,
                result,
                *samples,
                final_value.map(|v| (v, *atol)),
                *analytic_atol,
                *non_decreasing,
            );
            match check {
                Ok(()) => (true, "trajectory matched expected contract".to_owned()),
                Err(msg) => (false, msg),
            }
        }
        (
            ExpectedOutcome::Error {
                error,
                partial_samples,
            },
            Err(failure),
        ) => {
            let actual = ErrorKind::from(&failure.error);
            let partial_ok = partial_samples.is_none_or(|n| n == failure.partial.len());
            if actual == *error && partial_ok {
                (true, "error matched expected contract".to_owned())
            } else {
                (
                    false,
                    format!(
                        "mismatch: expected {error:?} with {partial_samples:?} partial samples, got {actual:?} with {} (`{}`)",
                        failure.partial.len(),
                        failure.error
                    ),
                )
            }
        }
        (expected, Ok(result)) => (
            false,
            format!(
                "shape mismatch: expected {expected:?}, run succeeded with {} samples",
                result.len()
            ),
        ),
        (expected, Err(failure)) => (
            false,
            format!("shape mismatch: expected {expected:?}, run failed: {failure}"),
        ),
    }
}

fn check_trajectory(
    case: &ScenarioCase,
    result: &SimulationResult,
    samples: usize,
    final_value: Option<(f64, f64)>,
    analytic_atol: Option<f64>,
    non_decreasing: bool,
) -> Result<(), String> {
    if result.len() != samples {
        return Err(format!(
            "expected {samples} samples, got {}",
            result.len()
        ));
    }
    if let Some((expected, atol)) = final_value {
        let actual = result.final_value().unwrap_or(f64::NAN);
        if !within_tolerance(actual, expected, atol, 0.0) {
            return Err(format!(
                "final value {actual} differs from {expected} by more than {atol}"
            ));
        }
    }
    if let Some(atol) = analytic_atol {
        let SimulationRequest { t0, y0, .. } = case.request;
        for (t, y) in result.samples() {
            let Some(exact) = case.equation.analytic(t0, y0, t) else {
                return Err(format!(
                    "{} has no closed form at t={t}",
                    case.equation.name()
                ));
            };
            if !within_tolerance(y, exact, atol, 0.0) {
                return Err(format!(
                    "y({t}) = {y} differs from closed form {exact} by more than {atol}"
                ));
            }
        }
    }
    if non_decreasing && !result.values.windows(2).all(|w| w[1] >= w[0]) {
        return Err("trajectory decreases".to_owned());
    }
    Ok(())
}

#[must_use]
pub fn packet_summary(report: &PacketReport) -> PacketSummary {
    PacketSummary {
        packet_id: report.packet_id.clone(),
        family: report.family.clone(),
        passed_cases: report.passed_cases,
        failed_cases: report.failed_cases,
        total_cases: report.case_results.len(),
    }
}

/// One structured log line per case.
#[must_use]
pub fn report_log_lines(report: &PacketReport) -> Vec<String> {
    report
        .case_results
        .iter()
        .map(|case| {
            let result = if case.passed {
                TestResult::Pass
            } else {
                TestResult::Fail
            };
            TestLogEntry::new(case.case_id.as_str(), "rkf_conformance", case.message.as_str())
                .with_fixture(report.packet_id.as_str())
                .with_mode(case.mode)
                .with_result(result)
                .to_json_line()
        })
        .collect()
}

/// Write the report, its blake3 digest, and its JSONL case log under the packet's artifact dir.
pub fn write_report_artifacts(
    config: &HarnessConfig,
    report: &PacketReport,
) -> Result<ArtifactBundle, HarnessError> {
    let output_dir = config.artifact_dir_for(&report.packet_id);
    fs::create_dir_all(&output_dir).map_err(|source| HarnessError::ArtifactIo {
        path: output_dir.clone(),
        source,
    })?;

    let report_path = output_dir.join(REPORT_FILE);
    let report_bytes = serde_json::to_vec_pretty(report)?;
    write_artifact(&report_path, &report_bytes)?;

    let digest = ReportDigest {
        ts_unix_ms: now_unix_ms(),
        algorithm: "blake3".to_owned(),
        digest: hash(&report_bytes).to_hex().to_string(),
        bytes: report_bytes.len(),
    };
    let digest_path = output_dir.join(DIGEST_FILE);
    write_artifact(&digest_path, &serde_json::to_vec_pretty(&digest)?)?;

    let log_path = output_dir.join(LOG_FILE);
    let mut log = report_log_lines(report).join("\n");
    log.push('\n');
    write_artifact(&log_path, log.as_bytes())?;

    Ok(ArtifactBundle {
        report_path,
        digest_path,
        log_path,
    })
}

/// Whether the stored report still hashes to its recorded digest.
pub fn verify_report_artifacts(bundle: &ArtifactBundle) -> Result<bool, HarnessError> {
    let report_bytes = read_artifact(&bundle.report_path)?;
    let digest_bytes = read_artifact(&bundle.digest_path)?;
    let digest: ReportDigest =
        serde_json::from_slice(&digest_bytes).map_err(|source| HarnessError::FixtureParse {
            path: bundle.digest_path.clone(),
            source,
        })?;
    Ok(digest.bytes == report_bytes.len()
        && digest.digest == hash(&report_bytes).to_hex().as_str())
}

/// Reports previously written under the artifact root, sorted by packet id.
pub fn load_packet_reports(config: &HarnessConfig) -> Result<Vec<PacketReport>, HarnessError> {
    let artifact_root = &config.artifact_root;
    if !artifact_root.exists() {
        return Ok(Vec::new());
    }

    let mut reports = Vec::new();
    for packet_dir in fs::read_dir(artifact_root).map_err(|source| HarnessError::ArtifactIo {
        path: artifact_root.clone(),
        source,
    })? {
        let packet_dir = packet_dir
            .map_err(|source| HarnessError::ArtifactIo {
                path: artifact_root.clone(),
                source,
            })?
            .path();
        let report_path = packet_dir.join(REPORT_FILE);
        if !packet_dir.is_dir() || !report_path.exists() {
            continue;
        }
        let raw = read_artifact(&report_path)?;
        let report: PacketReport =
            serde_json::from_slice(&raw).map_err(|source| HarnessError::FixtureParse {
                path: report_path,
                source,
            })?;
        reports.push(report);
    }

    reports.sort_by(|a, b| a.packet_id.cmp(&b.packet_id));
    Ok(reports)
}

fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), HarnessError> {
    fs::write(path, bytes).map_err(|source| HarnessError::ArtifactIo {
        path: path.to_path_buf(),
        source,
    })
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, HarnessError> {
    fs::read(path).map_err(|source| HarnessError::ArtifactIo {
        path: path.to_path_buf(),
        source,
    })
}

fn build_packet_report(
    packet_id: String,
    family: String,
    case_results: Vec<CaseResult>,
) -> PacketReport {
    let passed_cases = case_results.iter().filter(|r| r.passed).count();
    let failed_cases = case_results.len().saturating_sub(passed_cases);
    PacketReport {
        packet_id,
        family,
        case_results,
        passed_cases,
        failed_cases,
        generated_unix_ms: now_unix_ms(),
    }
}
