use std::path::Path;
use std::time::Duration;

use kestrel_targets::TargetSpec;

use crate::build::{BuildError, BuildMode, BuildScheduler, Builder};
use crate::exec::{self, ExecError};
use crate::normalize::{normalize, NormalizeProfile};
use crate::options::Options;

/// Result of building, executing, and comparing one package against its
/// golden output. Callers must branch; no variant coerces into another.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Matched,
    /// Both sides are normalized; lengths are reported to the user so a
    /// diff is tractable without re-running.
    Mismatched { expected: Vec<u8>, actual: Vec<u8> },
    RunFailed { error: ExecError, output: Vec<u8> },
    BuildFailed(BuildError),
}

impl RunOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, RunOutcome::Matched)
    }
}

/// Builds `package`, runs the artifact under its target, and compares the
/// normalized output to `expected`.
///
/// Build strictly precedes execution strictly precedes classification; the
/// build permit is released before execution starts. The emulator
/// preflight is the caller's responsibility (`exec::preflight`), so a
/// missing host tool surfaces as `Skipped` there instead of a failure
/// here.
#[allow(clippy::too_many_arguments)]
pub fn build_and_check(
    builder: &dyn Builder,
    options: &Options,
    spec: &TargetSpec,
    package: &Path,
    args: &[String],
    env: &[(String, String)],
    timeout: Duration,
    expected: &[u8],
    mask_durations: bool,
) -> RunOutcome {
    let scheduler = BuildScheduler::new(builder);
    let build = match scheduler.build(options, spec, package, BuildMode::Executable) {
        Ok(build) => build,
        Err(err) => return RunOutcome::BuildFailed(err),
    };

    let (output, result) = exec::run(&build, args, env, timeout);
    if let Err(error) = result {
        return RunOutcome::RunFailed { error, output };
    }

    let actual = normalize(
        &output,
        &NormalizeProfile::for_target(spec).mask_durations(mask_durations),
    );
    let expected = normalize(expected, &NormalizeProfile::plain());
    if expected == actual {
        RunOutcome::Matched
    } else {
        RunOutcome::Mismatched { expected, actual }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use kestrel_targets::builtin_target;

    use crate::sema::Semaphore;

    /// Collaborator that "compiles" a package into a shell script printing
    /// the package's scripted output.
    struct ScriptBuilder {
        dir: PathBuf,
        body: String,
        fail: bool,
    }

    impl ScriptBuilder {
        fn printing(body: &str) -> Self {
            let dir = crate::build::create_build_dir(Path::new("target/kestrel-test"))
                .expect("temp dir");
            ScriptBuilder {
                dir,
                body: body.to_string(),
                fail: false,
            }
        }

        fn failing() -> Self {
            let mut b = ScriptBuilder::printing("");
            b.fail = true;
            b
        }
    }

    impl Drop for ScriptBuilder {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    impl Builder for ScriptBuilder {
        fn build_package(
            &self,
            _options: &Options,
            _spec: &TargetSpec,
            package: &Path,
            _mode: BuildMode,
        ) -> Result<PathBuf> {
            use std::os::unix::fs::PermissionsExt as _;

            if self.fail {
                anyhow::bail!("undefined symbol in {}", package.display());
            }
            let path = self
                .dir
                .join(package.display().to_string().replace('/', "_"));
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", self.body)).expect("write script");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod script");
            Ok(path)
        }
    }

    fn test_options() -> Options {
        Options::builder()
            .semaphore(std::sync::Arc::new(Semaphore::new(2)))
            .build()
            .expect("options")
    }

    fn check(builder: &dyn Builder, expected: &[u8]) -> RunOutcome {
        build_and_check(
            builder,
            &test_options(),
            &builtin_target("host").expect("host"),
            Path::new("demo/app"),
            &[],
            &[],
            Duration::from_secs(10),
            expected,
            false,
        )
    }

    #[test]
    fn matching_output_yields_matched() {
        let builder = ScriptBuilder::printing("printf 'hello\\nworld\\n'");
        assert!(check(&builder, b"hello\nworld\n").is_matched());
    }

    #[test]
    fn crlf_golden_still_matches() {
        let builder = ScriptBuilder::printing("printf 'hello\\n'");
        assert!(check(&builder, b"hello\r\n").is_matched());
    }

    #[test]
    fn one_byte_difference_reports_both_lengths() {
        let builder = ScriptBuilder::printing("printf 'hello\\n'");
        match check(&builder, b"hullo\n") {
            RunOutcome::Mismatched { expected, actual } => {
                assert_eq!(expected.len(), 6);
                assert_eq!(actual.len(), 6);
                assert_eq!(expected, b"hullo\n");
                assert_eq!(actual, b"hello\n");
            }
            other => panic!("expected Mismatched, got {other:?}"),
        }
    }

    #[test]
    fn compile_failure_yields_build_failed() {
        let builder = ScriptBuilder::failing();
        match check(&builder, b"") {
            RunOutcome::BuildFailed(err) => {
                assert_eq!(err.package, "demo/app");
                assert!(err.diagnostic.contains("undefined symbol"));
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }

    #[test]
    fn crashing_artifact_yields_run_failed_with_its_logs() {
        let builder = ScriptBuilder::printing("echo partial\nexit 9");
        match check(&builder, b"partial\n") {
            RunOutcome::RunFailed { error, output } => {
                assert_eq!(error, ExecError::Exit { code: 9 });
                assert_eq!(output, b"partial\n");
            }
            other => panic!("expected RunFailed, got {other:?}"),
        }
    }

    #[test]
    fn classification_is_deterministic_across_runs() {
        let builder = ScriptBuilder::printing("printf 'stable\\n'");
        for _ in 0..2 {
            assert!(check(&builder, b"stable\n").is_matched());
        }
    }
}
