use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kestrel_targets::{OptLevel, ResolveError, Scheduler, TargetQuery, TargetSpec};

use crate::sema::Semaphore;

const DEFAULT_INTERP_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A named target and an explicit OS/arch pair were both set.
    ConflictingTarget {
        target: String,
        os: Option<String>,
        arch: Option<String>,
    },
    /// Exactly one of OS and arch was set; a cross profile needs both.
    IncompletePlatform,
    /// An arch variant was set without an arch.
    VariantWithoutArch(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ConflictingTarget { target, os, arch } => write!(
                f,
                "target {target:?} conflicts with explicit platform {}/{}",
                os.as_deref().unwrap_or("-"),
                arch.as_deref().unwrap_or("-"),
            ),
            ConfigError::IncompletePlatform => {
                write!(f, "set both --os and --arch (or neither)")
            }
            ConfigError::VariantWithoutArch(v) => {
                write!(f, "arch variant {v:?} requires an arch")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Immutable build configuration for one logical run.
///
/// Constructed once via [`OptionsBuilder`] and shallow-copied with the
/// `with_*` helpers for sub-scenarios. Cloning shares the permit pool:
/// the semaphore is a shared resource, never copied state.
#[derive(Clone, Debug)]
pub struct Options {
    target: Option<String>,
    os: Option<String>,
    arch: Option<String>,
    arch_variant: Option<String>,
    opt: OptLevel,
    debug: bool,
    verify_ir: bool,
    scheduler: Option<Scheduler>,
    interp_timeout: Duration,
    global_values: BTreeMap<String, BTreeMap<String, String>>,
    target_spec_dir: Option<PathBuf>,
    semaphore: Arc<Semaphore>,
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn opt(&self) -> OptLevel {
        self.opt
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn verify_ir(&self) -> bool {
        self.verify_ir
    }

    pub fn interp_timeout(&self) -> Duration {
        self.interp_timeout
    }

    pub fn global_values(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.global_values
    }

    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// The scheduler strategy for this build: an explicit choice wins,
    /// otherwise the target's default applies.
    pub fn effective_scheduler(&self, spec: &TargetSpec) -> Scheduler {
        self.scheduler.unwrap_or(spec.default_scheduler)
    }

    pub fn target_query(&self) -> TargetQuery<'_> {
        TargetQuery {
            target: self.target.as_deref(),
            os: self.os.as_deref(),
            arch: self.arch.as_deref(),
            arch_variant: self.arch_variant.as_deref(),
            spec_dir: self.target_spec_dir.as_deref(),
        }
    }

    pub fn resolve_target(&self) -> Result<TargetSpec, ResolveError> {
        kestrel_targets::resolve(&self.target_query())
    }

    /// Shallow copy aimed at a different named target (the permit pool is
    /// shared with `self`).
    pub fn with_target(&self, target: &str) -> Options {
        let mut out = self.clone();
        out.target = Some(target.to_string());
        out.os = None;
        out.arch = None;
        out.arch_variant = None;
        out
    }

    pub fn with_opt(&self, opt: OptLevel) -> Options {
        let mut out = self.clone();
        out.opt = opt;
        out
    }

    pub fn with_scheduler(&self, scheduler: Scheduler) -> Options {
        let mut out = self.clone();
        out.scheduler = Some(scheduler);
        out
    }

    pub fn with_global_values(
        &self,
        global_values: BTreeMap<String, BTreeMap<String, String>>,
    ) -> Options {
        let mut out = self.clone();
        out.global_values = global_values;
        out
    }
}

#[derive(Debug, Default)]
pub struct OptionsBuilder {
    target: Option<String>,
    os: Option<String>,
    arch: Option<String>,
    arch_variant: Option<String>,
    opt: OptLevel,
    debug: bool,
    verify_ir: bool,
    scheduler: Option<Scheduler>,
    interp_timeout: Option<Duration>,
    global_values: BTreeMap<String, BTreeMap<String, String>>,
    target_spec_dir: Option<PathBuf>,
    semaphore: Option<Arc<Semaphore>>,
    permits: Option<usize>,
}

impl OptionsBuilder {
    pub fn new() -> Self {
        OptionsBuilder::default()
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn arch_variant(mut self, variant: impl Into<String>) -> Self {
        self.arch_variant = Some(variant.into());
        self
    }

    pub fn opt(mut self, opt: OptLevel) -> Self {
        self.opt = opt;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn verify_ir(mut self, verify_ir: bool) -> Self {
        self.verify_ir = verify_ir;
        self
    }

    pub fn scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn interp_timeout(mut self, timeout: Duration) -> Self {
        self.interp_timeout = Some(timeout);
        self
    }

    pub fn global_value(
        mut self,
        package: impl Into<String>,
        symbol: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.global_values
            .entry(package.into())
            .or_default()
            .insert(symbol.into(), value.into());
        self
    }

    pub fn target_spec_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_spec_dir = Some(dir.into());
        self
    }

    /// Inject an existing permit pool (one pool per run, shared across all
    /// Options derived for that run).
    pub fn semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.semaphore = Some(semaphore);
        self
    }

    /// Capacity for a freshly created pool; ignored when a pool is
    /// injected via [`OptionsBuilder::semaphore`].
    pub fn permits(mut self, permits: usize) -> Self {
        self.permits = Some(permits);
        self
    }

    pub fn build(self) -> Result<Options, ConfigError> {
        if let Some(target) = &self.target {
            if self.os.is_some() || self.arch.is_some() {
                return Err(ConfigError::ConflictingTarget {
                    target: target.clone(),
                    os: self.os.clone(),
                    arch: self.arch.clone(),
                });
            }
        }
        if self.os.is_some() != self.arch.is_some() {
            return Err(ConfigError::IncompletePlatform);
        }
        if let Some(variant) = &self.arch_variant {
            if self.arch.is_none() {
                return Err(ConfigError::VariantWithoutArch(variant.clone()));
            }
        }

        let semaphore = match self.semaphore {
            Some(s) => s,
            None => {
                let permits = self.permits.unwrap_or_else(default_permits);
                Arc::new(Semaphore::new(permits))
            }
        };

        Ok(Options {
            target: self.target,
            os: self.os,
            arch: self.arch,
            arch_variant: self.arch_variant,
            opt: self.opt,
            debug: self.debug,
            verify_ir: self.verify_ir,
            scheduler: self.scheduler,
            interp_timeout: self.interp_timeout.unwrap_or(DEFAULT_INTERP_TIMEOUT),
            global_values: self.global_values,
            target_spec_dir: self.target_spec_dir,
            semaphore,
        })
    }
}

fn default_permits() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
