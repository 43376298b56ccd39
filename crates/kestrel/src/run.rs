use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use kestrel_runner::{build_and_check, preflight, Preflight, RunOutcome};

use crate::opts::{parse_env_pair, BuildOpts};

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Package to build and run.
    #[arg(long, value_name = "PKG")]
    pub package: PathBuf,

    /// Named build target.
    #[arg(long, value_name = "NAME")]
    pub target: Option<String>,

    #[command(flatten)]
    pub build: BuildOpts,

    /// Golden output file the normalized output is compared against.
    #[arg(long, value_name = "PATH")]
    pub golden: PathBuf,

    /// Argument passed to the artifact (repeatable).
    #[arg(long = "arg", value_name = "ARG")]
    pub args: Vec<String>,

    /// Environment variable merged over the inherited environment
    /// (repeatable).
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Wall-clock execution timeout.
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    pub timeout_seconds: u64,

    /// Replace `(D.DDs)` elapsed durations with a fixed placeholder before
    /// comparing.
    #[arg(long)]
    pub mask_durations: bool,
}

pub fn cmd_run(args: RunArgs) -> Result<std::process::ExitCode> {
    let options = args.build.to_options(args.target.as_deref())?;
    let spec = options.resolve_target().context("resolve target")?;

    if let Preflight::Skipped { tool } = preflight(&spec) {
        eprintln!(
            "kestrel run: skipping {}: emulator not installed: {tool}",
            spec.name
        );
        return Ok(std::process::ExitCode::SUCCESS);
    }

    let expected = std::fs::read(&args.golden)
        .with_context(|| format!("read golden file: {}", args.golden.display()))?;

    let mut env: Vec<(String, String)> = Vec::with_capacity(args.env.len());
    for raw in &args.env {
        env.push(parse_env_pair(raw)?);
    }

    let builder = args.build.builder();
    let outcome = build_and_check(
        &builder,
        &options,
        &spec,
        &args.package,
        &args.args,
        &env,
        Duration::from_secs(args.timeout_seconds),
        &expected,
        args.mask_durations,
    );

    let code: u8 = match outcome {
        RunOutcome::Matched => {
            println!("ok\t{}", args.package.display());
            0
        }
        RunOutcome::Mismatched { expected, actual } => {
            eprintln!(
                "output did not match (expected {} bytes, got {} bytes):",
                expected.len(),
                actual.len()
            );
            print_lines(&actual);
            10
        }
        RunOutcome::BuildFailed(err) => {
            eprintln!("{err}");
            11
        }
        RunOutcome::RunFailed { error, output } => {
            print_lines(&output);
            eprintln!("failed to run: {error}");
            12
        }
    };

    Ok(std::process::ExitCode::from(code))
}

fn print_lines(output: &[u8]) {
    for line in output.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        eprintln!("stdout: {}", String::from_utf8_lossy(line));
    }
}
