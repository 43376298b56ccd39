use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use kestrel_targets::TargetSpec;

use crate::options::Options;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    Executable,
    TestBinary,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Executable => "executable",
            BuildMode::TestBinary => "test-binary",
        }
    }
}

/// Output of a successful build, owned by the caller that requested it.
#[derive(Clone, Debug)]
pub struct BuildResult {
    pub artifact: PathBuf,
    pub spec: TargetSpec,
    pub mode: BuildMode,
    pub artifact_sha256: String,
}

/// Terminal failure of one build invocation. Non-fatal for a batch.
#[derive(Clone, Debug)]
pub struct BuildError {
    pub package: String,
    pub target: String,
    pub diagnostic: String,
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "build {} for {}: {}",
            self.package, self.target, self.diagnostic
        )
    }
}

impl std::error::Error for BuildError {}

/// The compiler/linker collaborator. Implemented outside this core; the
/// production implementation shells out to `kestrelc`.
pub trait Builder: Sync {
    fn build_package(
        &self,
        options: &Options,
        spec: &TargetSpec,
        package: &Path,
        mode: BuildMode,
    ) -> Result<PathBuf>;
}

/// Bounded-concurrency gate around build invocations.
///
/// One permit is acquired from the run's shared pool before the
/// collaborator is invoked and released on every path (the permit is a
/// scoped guard). Failures are wrapped with the offending package and
/// target; nothing is retried.
pub struct BuildScheduler<'a> {
    builder: &'a dyn Builder,
}

impl<'a> BuildScheduler<'a> {
    pub fn new(builder: &'a dyn Builder) -> Self {
        BuildScheduler { builder }
    }

    pub fn build(
        &self,
        options: &Options,
        spec: &TargetSpec,
        package: &Path,
        mode: BuildMode,
    ) -> Result<BuildResult, BuildError> {
        let _permit = options.semaphore().acquire();

        let wrap = |diagnostic: String| BuildError {
            package: package.display().to_string(),
            target: spec.name.clone(),
            diagnostic,
        };

        let artifact = self
            .builder
            .build_package(options, spec, package, mode)
            .map_err(|err| wrap(format!("{err:#}")))?;

        let bytes = std::fs::read(&artifact)
            .map_err(|err| wrap(format!("read artifact {}: {err}", artifact.display())))?;
        let artifact_sha256 = sha256_hex(&bytes);

        Ok(BuildResult {
            artifact,
            spec: spec.clone(),
            mode,
            artifact_sha256,
        })
    }
}

static BUILD_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn create_build_dir(base: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(base)
        .with_context(|| format!("create build dir base: {}", base.display()))?;

    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = BUILD_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("kestrel_build_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return Ok(path);
        }
    }

    anyhow::bail!("failed to create build dir under {}", base.display());
}

/// Production collaborator: invokes the sibling `kestrelc` executable.
pub struct KestrelcBuilder {
    compiler: PathBuf,
    artifact_dir: PathBuf,
}

impl KestrelcBuilder {
    pub fn new() -> Self {
        KestrelcBuilder {
            compiler: resolve_sibling_or_path("kestrelc"),
            artifact_dir: PathBuf::from("target/kestrel-build"),
        }
    }

    pub fn with_compiler(mut self, compiler: impl Into<PathBuf>) -> Self {
        self.compiler = compiler.into();
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = dir.into();
        self
    }
}

impl Default for KestrelcBuilder {
    fn default() -> Self {
        KestrelcBuilder::new()
    }
}

impl Builder for KestrelcBuilder {
    fn build_package(
        &self,
        options: &Options,
        spec: &TargetSpec,
        package: &Path,
        mode: BuildMode,
    ) -> Result<PathBuf> {
        let out_dir = create_build_dir(&self.artifact_dir)?;
        let artifact = out_dir.join(artifact_file_name(package, mode));

        let mut cmd = Command::new(&self.compiler);
        cmd.arg("--triple").arg(&spec.triple);
        cmd.arg("--opt").arg(options.opt().as_str());
        cmd.arg("--scheduler")
            .arg(options.effective_scheduler(spec).as_str());
        cmd.arg("--interp-timeout-ms")
            .arg(options.interp_timeout().as_millis().to_string());
        if options.debug() {
            cmd.arg("--debug-info");
        }
        if options.verify_ir() {
            cmd.arg("--verify-ir");
        }
        for (pkg, symbols) in options.global_values() {
            for (symbol, value) in symbols {
                cmd.arg("--global-value").arg(format!("{pkg}.{symbol}={value}"));
            }
        }
        if mode == BuildMode::TestBinary {
            cmd.arg("--test-binary");
        }
        cmd.arg("-o").arg(&artifact);
        cmd.arg(package);
        cmd.stdin(Stdio::null());

        let output = cmd
            .output()
            .with_context(|| format!("exec {}", self.compiler.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "kestrelc exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        if !artifact.is_file() {
            anyhow::bail!(
                "kestrelc reported success but produced no artifact at {}",
                artifact.display()
            );
        }

        Ok(artifact)
    }
}

fn artifact_file_name(package: &Path, mode: BuildMode) -> String {
    let base = package
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("package");
    match mode {
        BuildMode::Executable => base.to_string(),
        BuildMode::TestBinary => format!("{base}.test"),
    }
}

pub fn resolve_sibling_or_path(name: &str) -> PathBuf {
    let Ok(exe) = std::env::current_exe() else {
        return PathBuf::from(name);
    };
    let Some(dir) = exe.parent() else {
        return PathBuf::from(name);
    };

    let mut candidates = Vec::new();
    candidates.push(dir.join(name));
    if dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == "deps")
    {
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(name));
        }
    }

    for cand in candidates {
        if cand.is_file() {
            return cand;
        }
    }

    PathBuf::from(name)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(nybble_to_hex((b >> 4) & 0x0f));
        out.push(nybble_to_hex(b & 0x0f));
    }
    out
}

fn nybble_to_hex(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '0',
    }
}
