use anyhow::Result;
use clap::Parser;

mod opts;
mod pkgpattern;
mod run;
mod util;

#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(about = "Kestrel toolchain build and test orchestrator.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Build and run package test binaries across a target matrix.
    Test(test::TestArgs),
    /// Build a package, run it, and compare its output against a golden file.
    Run(Box<run::RunArgs>),
    /// List builtin targets.
    Targets,
}

fn main() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Command::Test(args) => test::cmd_test(args),
        Command::Run(args) => run::cmd_run(*args),
        Command::Targets => cmd_targets(),
    }
}

fn cmd_targets() -> Result<std::process::ExitCode> {
    let specs: Vec<_> = kestrel_targets::BUILTIN_TARGET_NAMES
        .iter()
        .filter_map(|name| kestrel_targets::builtin_target(name))
        .collect();
    println!("{}", serde_json::to_string_pretty(&specs)?);
    Ok(std::process::ExitCode::SUCCESS)
}
