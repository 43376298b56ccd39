//! Shared target registry helpers.
//!
//! This crate exists so both:
//! - the build/execution orchestrator (Rust)
//! - toolchain front-end code (Rust)
//!
//! can share an authoritative description of build targets: triple, emulator
//! invocation, capability flags, and the default scheduler strategy.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// How the compiled artifact's runtime realizes concurrent tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(feature = "clap", clap(rename_all = "kebab_case"))]
pub enum Scheduler {
    None,
    #[default]
    Cooperative,
    Threaded,
}

impl Scheduler {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheduler::None => "none",
            Scheduler::Cooperative => "cooperative",
            Scheduler::Threaded => "threaded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "none" => Some(Scheduler::None),
            "cooperative" => Some(Scheduler::Cooperative),
            "threaded" => Some(Scheduler::Threaded),
            _ => None,
        }
    }
}

/// Optimization level passed to the compiler collaborator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptLevel {
    #[serde(rename = "0")]
    O0,
    #[serde(rename = "1")]
    O1,
    #[default]
    #[serde(rename = "z")]
    Oz,
}

impl OptLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            OptLevel::O0 => "0",
            OptLevel::O1 => "1",
            OptLevel::Oz => "z",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "0" => Some(OptLevel::O0),
            "1" => Some(OptLevel::O1),
            "z" => Some(OptLevel::Oz),
            _ => None,
        }
    }
}

/// Log formatting emitted by the target's emulator, consulted by output
/// normalization. Kept on the spec so callers never match on target names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmulatorLog {
    #[default]
    Plain,
    /// The AVR simulator wraps output in color escapes and emits
    /// per-instruction trace dot-lines.
    AvrColored,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetFeatures {
    pub reflection: bool,
    pub native_threads: bool,
    /// Whether the execution environment forwards CLI arguments and
    /// environment variables to the artifact.
    pub subprocess_env: bool,
    pub filesystem: bool,
}

impl TargetFeatures {
    fn hosted() -> Self {
        TargetFeatures {
            reflection: true,
            native_threads: true,
            subprocess_env: true,
            filesystem: true,
        }
    }

    fn bare_metal() -> Self {
        TargetFeatures {
            reflection: true,
            native_threads: false,
            subprocess_env: false,
            filesystem: false,
        }
    }
}

/// Resolved, read-only description of a build/execution target.
///
/// Derived fresh on each resolution call and never mutated afterwards; safe
/// to share by reference across concurrently running tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub name: String,
    pub triple: String,
    /// Emulator invocation template. Empty means "run natively". A `{}`
    /// token is substituted with the artifact path; if no token is present
    /// the artifact path is appended.
    #[serde(default)]
    pub emulator: Vec<String>,
    #[serde(default)]
    pub features: TargetFeatures,
    #[serde(default)]
    pub emulator_log: EmulatorLog,
    #[serde(default)]
    pub default_scheduler: Scheduler,
}

impl TargetSpec {
    pub fn is_emulated(&self) -> bool {
        !self.emulator.is_empty()
    }

    /// First token of the emulator template, i.e. the executable that must
    /// be present on the host.
    pub fn emulator_command(&self) -> Option<&str> {
        self.emulator.first().map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveError {
    UnknownTarget(String),
    UnsupportedPlatform {
        os: String,
        arch: String,
        variant: Option<String>,
    },
    SpecFile {
        name: String,
        message: String,
    },
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::UnknownTarget(name) => write!(f, "unknown target: {name:?}"),
            ResolveError::UnsupportedPlatform { os, arch, variant } => match variant {
                Some(v) => write!(f, "unsupported platform: {os}/{arch}/{v}"),
                None => write!(f, "unsupported platform: {os}/{arch}"),
            },
            ResolveError::SpecFile { name, message } => {
                write!(f, "target spec file for {name:?}: {message}")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// Inputs for a resolution call, derived from the orchestrator's Options.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetQuery<'a> {
    /// Named target; takes precedence over the os/arch pair.
    pub target: Option<&'a str>,
    pub os: Option<&'a str>,
    pub arch: Option<&'a str>,
    pub arch_variant: Option<&'a str>,
    /// Optional directory with `<name>.json` spec files for targets not in
    /// the builtin table.
    pub spec_dir: Option<&'a Path>,
}

pub const BUILTIN_TARGET_NAMES: &[&str] =
    &["host", "cortex-m-qemu", "riscv-qemu", "simavr", "wasip1"];

/// Maps a target identifier or OS/architecture pair to a concrete spec.
///
/// Fails fast: no partial spec is ever returned. Side-effect-free aside
/// from the optional spec-file read for non-builtin named targets.
pub fn resolve(query: &TargetQuery) -> Result<TargetSpec, ResolveError> {
    if let Some(name) = query.target {
        let name = name.trim();
        if let Some(spec) = builtin_target(name) {
            return Ok(spec);
        }
        if let Some(dir) = query.spec_dir {
            return load_spec_file(dir, name);
        }
        return Err(ResolveError::UnknownTarget(name.to_string()));
    }

    let os = query.os.unwrap_or(host_os());
    let arch = query.arch.unwrap_or(host_arch());
    platform_target(os, arch, query.arch_variant)
}

pub fn builtin_target(name: &str) -> Option<TargetSpec> {
    match name {
        "" | "host" => {
            platform_target(host_os(), host_arch(), None).ok()
        }
        "cortex-m-qemu" => Some(TargetSpec {
            name: "cortex-m-qemu".to_string(),
            triple: "thumbv7m-none-eabi".to_string(),
            emulator: to_strings(&[
                "qemu-system-arm",
                "-machine",
                "lm3s6965evb",
                "-nographic",
                "-semihosting",
                "-kernel",
                "{}",
            ]),
            features: TargetFeatures::bare_metal(),
            emulator_log: EmulatorLog::Plain,
            default_scheduler: Scheduler::Cooperative,
        }),
        "riscv-qemu" => Some(TargetSpec {
            name: "riscv-qemu".to_string(),
            triple: "riscv32imac-unknown-none-elf".to_string(),
            emulator: to_strings(&[
                "qemu-system-riscv32",
                "-machine",
                "virt",
                "-nographic",
                "-bios",
                "none",
                "-kernel",
                "{}",
            ]),
            features: TargetFeatures::bare_metal(),
            emulator_log: EmulatorLog::Plain,
            default_scheduler: Scheduler::Cooperative,
        }),
        "simavr" => Some(TargetSpec {
            name: "simavr".to_string(),
            triple: "avr-unknown-unknown".to_string(),
            emulator: to_strings(&["simavr", "-m", "atmega1284p", "{}"]),
            features: TargetFeatures {
                reflection: false,
                native_threads: false,
                subprocess_env: false,
                filesystem: false,
            },
            emulator_log: EmulatorLog::AvrColored,
            default_scheduler: Scheduler::None,
        }),
        "wasip1" => Some(TargetSpec {
            name: "wasip1".to_string(),
            triple: "wasm32-wasip1".to_string(),
            emulator: to_strings(&["wasmtime", "run", "{}"]),
            features: TargetFeatures {
                reflection: true,
                native_threads: false,
                subprocess_env: true,
                filesystem: true,
            },
            emulator_log: EmulatorLog::Plain,
            default_scheduler: Scheduler::Cooperative,
        }),
        _ => None,
    }
}

fn platform_target(
    os: &str,
    arch: &str,
    variant: Option<&str>,
) -> Result<TargetSpec, ResolveError> {
    if variant.is_some() && arch != "arm" {
        return Err(ResolveError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
            variant: variant.map(str::to_string),
        });
    }

    let triple = match (os, arch) {
        ("linux", "amd64") => "x86_64-unknown-linux-gnu",
        ("linux", "386") => "i686-unknown-linux-gnu",
        ("linux", "arm64") => "aarch64-unknown-linux-gnu",
        ("linux", "arm") => match variant.unwrap_or("6") {
            "5" => "armv5te-unknown-linux-gnueabi",
            "6" => "arm-unknown-linux-gnueabihf",
            "7" => "armv7-unknown-linux-gnueabihf",
            _ => {
                return Err(ResolveError::UnsupportedPlatform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                    variant: variant.map(str::to_string),
                })
            }
        },
        ("darwin", "amd64") => "x86_64-apple-darwin",
        ("darwin", "arm64") => "aarch64-apple-darwin",
        _ => {
            return Err(ResolveError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
                variant: variant.map(str::to_string),
            })
        }
    };

    let name = if os == host_os() && arch == host_arch() && variant.is_none() {
        "host".to_string()
    } else {
        match variant {
            Some(v) => format!("{os}/{arch}/{v}"),
            None => format!("{os}/{arch}"),
        }
    };

    Ok(TargetSpec {
        name,
        triple: triple.to_string(),
        emulator: Vec::new(),
        features: TargetFeatures::hosted(),
        emulator_log: EmulatorLog::Plain,
        default_scheduler: Scheduler::Threaded,
    })
}

fn load_spec_file(dir: &Path, name: &str) -> Result<TargetSpec, ResolveError> {
    let path = dir.join(format!("{name}.json"));
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ResolveError::UnknownTarget(name.to_string()))
        }
        Err(err) => {
            return Err(ResolveError::SpecFile {
                name: name.to_string(),
                message: format!("read {}: {err}", path.display()),
            })
        }
    };
    let mut spec: TargetSpec = serde_json::from_slice(&bytes).map_err(|err| {
        ResolveError::SpecFile {
            name: name.to_string(),
            message: format!("parse {}: {err}", path.display()),
        }
    })?;
    if spec.name.is_empty() {
        spec.name = name.to_string();
    }
    if spec.triple.is_empty() {
        return Err(ResolveError::SpecFile {
            name: name.to_string(),
            message: "spec file is missing a triple".to_string(),
        });
    }
    Ok(spec)
}

pub fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        other => other,
    }
}

fn to_strings(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}
