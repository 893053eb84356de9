#![forbid(unsafe_code)]

use rkf_conformance::{
    HarnessConfig, list_packet_fixtures, packet_summary, run_scenario_packet,
    write_report_artifacts,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Clone)]
struct CliArgs {
    fixture_root: PathBuf,
    artifact_root: PathBuf,
    packet_filter: Option<String>,
    write_artifacts: bool,
}

#[derive(Debug, Clone)]
enum CliParseError {
    Help,
    Message(String),
}

fn parse_cli_args(args: &[String]) -> Result<CliArgs, CliParseError> {
    let defaults = HarnessConfig::default();
    let mut fixture_root = defaults.fixture_root;
    let mut artifact_root = defaults.artifact_root;
    let mut packet_filter = None;
    let mut write_artifacts = true;

    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => return Err(CliParseError::Help),
            "--fixture-root" => {
                let Some(value) = args.get(index + 1) else {
                    return Err(CliParseError::Message(String::from(
                        "missing value for --fixture-root",
                    )));
                };
                fixture_root = PathBuf::from(value);
                index += 2;
            }
            "--artifact-root" => {
                let Some(value) = args.get(index + 1) else {
                    return Err(CliParseError::Message(String::from(
                        "missing value for --artifact-root",
                    )));
                };
                artifact_root = PathBuf::from(value);
                index += 2;
            }
            "--packet" => {
                let Some(value) = args.get(index + 1) else {
                    return Err(CliParseError::Message(String::from(
                        "missing value for --packet",
                    )));
                };
                packet_filter = Some(value.clone());
                index += 2;
            }
            "--no-artifacts" => {
                write_artifacts = false;
                index += 1;
            }
            unknown => {
                return Err(CliParseError::Message(format!(
                    "unknown argument `{unknown}`"
                )));
            }
        }
    }

    Ok(CliArgs {
        fixture_root,
        artifact_root,
        packet_filter,
        write_artifacts,
    })
}

fn print_usage() {
    eprintln!(
        "usage: run_packets [--fixture-root DIR] [--artifact-root DIR] [--packet SUBSTRING] [--no-artifacts]"
    );
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_cli_args(&args) {
        Ok(cli) => cli,
        Err(CliParseError::Help) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Err(CliParseError::Message(message)) => {
            eprintln!("error: {message}");
            print_usage();
            return ExitCode::from(2);
        }
    };

    let config = HarnessConfig {
        fixture_root: cli.fixture_root,
        artifact_root: cli.artifact_root,
    };
    let fixtures = match list_packet_fixtures(&config) {
        Ok(names) => names,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };

    let mut any_failed = false;
    for name in fixtures
        .iter()
        .filter(|name| cli.packet_filter.as_ref().is_none_or(|f| name.contains(f.as_str())))
    {
        let report = match run_scenario_packet(&config, name) {
            Ok(report) => report,
            Err(error) => {
                eprintln!("error: {error}");
                any_failed = true;
                continue;
            }
        };
        if cli.write_artifacts
            && let Err(error) = write_report_artifacts(&config, &report)
        {
            eprintln!("error: {error}");
            any_failed = true;
        }
        let summary = packet_summary(&report);
        any_failed |= summary.failed_cases > 0;
        match serde_json::to_string(&summary) {
            Ok(line) => println!("{line}"),
            Err(error) => eprintln!("error: {error}"),
        }
    }

    if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
