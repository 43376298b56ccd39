use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use kestrel_runner::{KestrelcBuilder, Options};
use kestrel_targets::{OptLevel, Scheduler};

/// Build configuration shared by the `test` and `run` subcommands. The
/// target selection itself lives on each subcommand (single target vs.
/// matrix).
#[derive(Debug, Clone, Args)]
pub struct BuildOpts {
    /// Build for an explicit OS/architecture pair instead of a named target.
    #[arg(long, value_name = "OS", requires = "arch")]
    pub os: Option<String>,

    #[arg(long, value_name = "ARCH", requires = "os")]
    pub arch: Option<String>,

    /// ARM architecture variant (5, 6, or 7).
    #[arg(long, value_name = "N", requires = "arch")]
    pub arch_variant: Option<String>,

    /// Optimization level (0, 1, or z).
    #[arg(long, value_name = "LEVEL", default_value = "z", value_parser = parse_opt_level)]
    pub opt: OptLevel,

    /// Emit debug info.
    #[arg(long)]
    pub debug_info: bool,

    /// Verify IR after lowering.
    #[arg(long)]
    pub verify_ir: bool,

    /// Override the target's default scheduler strategy.
    #[arg(long, value_enum)]
    pub scheduler: Option<Scheduler>,

    /// Maximum concurrent compiler invocations (defaults to the host's
    /// available parallelism).
    #[arg(long, value_name = "N")]
    pub build_permits: Option<usize>,

    /// Compile-time interpretation timeout.
    #[arg(long, value_name = "SECONDS", default_value_t = 180)]
    pub interp_timeout_seconds: u64,

    /// Link-time global value injection (repeatable).
    #[arg(long, value_name = "PKG.SYM=VALUE")]
    pub global_value: Vec<String>,

    /// Directory with additional target spec JSON files.
    #[arg(long, value_name = "DIR")]
    pub target_spec_dir: Option<PathBuf>,

    #[arg(long, value_name = "PATH", hide = true)]
    pub compiler: Option<PathBuf>,

    /// Directory build artifacts are written under.
    #[arg(long, value_name = "DIR", default_value = "target/kestrel-build")]
    pub artifact_dir: PathBuf,
}

impl BuildOpts {
    pub fn to_options(&self, target: Option<&str>) -> Result<Options> {
        let mut builder = Options::builder()
            .opt(self.opt)
            .debug(self.debug_info)
            .verify_ir(self.verify_ir)
            .interp_timeout(Duration::from_secs(self.interp_timeout_seconds));

        if let Some(target) = target {
            builder = builder.target(target);
        }
        if let Some(os) = &self.os {
            builder = builder.os(os);
        }
        if let Some(arch) = &self.arch {
            builder = builder.arch(arch);
        }
        if let Some(variant) = &self.arch_variant {
            builder = builder.arch_variant(variant);
        }
        if let Some(scheduler) = self.scheduler {
            builder = builder.scheduler(scheduler);
        }
        if let Some(permits) = self.build_permits {
            builder = builder.permits(permits);
        }
        if let Some(dir) = &self.target_spec_dir {
            builder = builder.target_spec_dir(dir);
        }
        for raw in &self.global_value {
            let (package, symbol, value) = parse_global_value(raw)?;
            builder = builder.global_value(package, symbol, value);
        }

        Ok(builder.build()?)
    }

    pub fn builder(&self) -> KestrelcBuilder {
        let mut builder = KestrelcBuilder::new().with_artifact_dir(&self.artifact_dir);
        if let Some(compiler) = &self.compiler {
            builder = builder.with_compiler(compiler);
        }
        builder
    }
}

fn parse_opt_level(raw: &str) -> Result<OptLevel, String> {
    OptLevel::parse(raw).ok_or_else(|| format!("expected one of \"0\", \"1\", or \"z\", got {raw:?}"))
}

fn parse_global_value(raw: &str) -> Result<(String, String, String)> {
    let (lhs, value) = raw
        .split_once('=')
        .with_context(|| format!("expected PKG.SYM=VALUE, got {raw:?}"))?;
    let (package, symbol) = lhs
        .rsplit_once('.')
        .with_context(|| format!("expected PKG.SYM=VALUE, got {raw:?}"))?;
    if package.is_empty() || symbol.is_empty() {
        anyhow::bail!("expected PKG.SYM=VALUE, got {raw:?}");
    }
    Ok((package.to_string(), symbol.to_string(), value.to_string()))
}

pub fn parse_env_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.is_empty() {
        anyhow::bail!("expected KEY=VALUE, got {raw:?}");
    }
    Ok((key.to_string(), value.to_string()))
}
