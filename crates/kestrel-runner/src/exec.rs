use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use kestrel_targets::TargetSpec;

use crate::build::BuildResult;

const DRAIN_POLL: Duration = Duration::from_millis(20);
const CHANNEL_DEPTH: usize = 64;

/// How long readers may keep draining after the subprocess itself has
/// exited (a straggler in the process group can hold the pipe open).
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecError {
    Spawn { command: String, message: String },
    /// Wall-clock limit exceeded; the subprocess was forcibly killed.
    /// Reported distinctly from a crash so callers can tell "hung" from
    /// "exited wrong".
    Timeout { limit: Duration },
    Exit { code: i32 },
    Signal { signal: Option<i32> },
    Wait { message: String },
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Spawn { command, message } => {
                write!(f, "failed to start {command}: {message}")
            }
            ExecError::Timeout { limit } => {
                write!(f, "execution timed out after {}ms", limit.as_millis())
            }
            ExecError::Exit { code } => write!(f, "exited with code {code}"),
            ExecError::Signal { signal } => match signal {
                Some(s) => write!(f, "terminated by signal {s}"),
                None => write!(f, "terminated by signal"),
            },
            ExecError::Wait { message } => write!(f, "wait for subprocess: {message}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Host-side availability of the target's emulator, checked before any
/// build so "environment missing a tool" never reads as "artifact behaves
/// wrong".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    Skipped { tool: String },
}

pub fn preflight(spec: &TargetSpec) -> Preflight {
    let Some(tool) = spec.emulator_command() else {
        return Preflight::Ready;
    };
    if find_in_path(tool).is_some() {
        Preflight::Ready
    } else {
        Preflight::Skipped {
            tool: tool.to_string(),
        }
    }
}

fn find_in_path(tool: &str) -> Option<PathBuf> {
    let as_path = Path::new(tool);
    if as_path.components().count() > 1 {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let cand = dir.join(tool);
        if cand.is_file() {
            return Some(cand);
        }
    }
    None
}

/// Full command line for an artifact under its target: either the artifact
/// itself, or the emulator template with the artifact substituted for the
/// `{}` token (appended when the template has no token).
pub(crate) fn command_line(spec: &TargetSpec, artifact: &Path, args: &[String]) -> Vec<String> {
    let mut argv: Vec<String> = Vec::new();
    if spec.emulator.is_empty() {
        argv.push(artifact.display().to_string());
    } else {
        let mut substituted = false;
        for token in &spec.emulator {
            if token == "{}" {
                argv.push(artifact.display().to_string());
                substituted = true;
            } else {
                argv.push(token.clone());
            }
        }
        if !substituted {
            argv.push(artifact.display().to_string());
        }
    }
    argv.extend(args.iter().cloned());
    argv
}

/// Runs a built artifact with combined stdout/stderr capture and a hard
/// wall-clock timeout. Captured output is returned on every path so logs
/// are never lost to the caller.
pub fn run(
    build: &BuildResult,
    args: &[String],
    env: &[(String, String)],
    timeout: Duration,
) -> (Vec<u8>, Result<(), ExecError>) {
    let argv = command_line(&build.spec, &build.artifact, args);
    run_command(argv, env, timeout, None)
}

/// Like [`run`], additionally forwarding complete output lines to `sink`
/// as they arrive. The call does not conclude until both the subprocess
/// has exited and the output readers have drained, so trailing lines are
/// never dropped.
pub fn run_streaming(
    build: &BuildResult,
    args: &[String],
    env: &[(String, String)],
    timeout: Duration,
    sink: &mut dyn Write,
) -> (Vec<u8>, Result<(), ExecError>) {
    let argv = command_line(&build.spec, &build.artifact, args);
    run_command(argv, env, timeout, Some(sink))
}

fn run_command(
    argv: Vec<String>,
    env: &[(String, String)],
    timeout: Duration,
    mut sink: Option<&mut dyn Write>,
) -> (Vec<u8>, Result<(), ExecError>) {
    let display = argv.join(" ");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        // Own process group, so a timeout kill also reaps emulator children.
        cmd.process_group(0);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return (
                Vec::new(),
                Err(ExecError::Spawn {
                    command: display,
                    message: err.to_string(),
                }),
            )
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(CHANNEL_DEPTH);
    let tx_err = tx.clone();
    let reader_out = std::thread::spawn(move || pump(stdout, tx));
    let reader_err = std::thread::spawn(move || pump(stderr, tx_err));

    let deadline = Instant::now() + timeout;
    let mut output: Vec<u8> = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut readers_done = false;
    let mut timed_out = false;
    let mut status: Option<ExitStatus> = None;
    let mut wait_error: Option<String> = None;
    let mut drain_deadline: Option<Instant> = None;
    let mut abandoned_readers = false;

    loop {
        if !readers_done {
            match rx.recv_timeout(DRAIN_POLL) {
                Ok(chunk) => consume(&chunk, &mut output, &mut pending, sink.as_deref_mut()),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => readers_done = true,
            }
        }

        if status.is_none() && wait_error.is_none() {
            match child.try_wait() {
                Ok(Some(st)) => status = Some(st),
                Ok(None) => {}
                Err(err) => {
                    wait_error = Some(err.to_string());
                    kill_hard(&mut child);
                    let _ = child.wait();
                }
            }
        }

        if readers_done && (status.is_some() || wait_error.is_some()) {
            break;
        }

        if status.is_none() && wait_error.is_none() && !timed_out && Instant::now() >= deadline {
            // Not a cooperative shutdown: emulators may ignore those.
            kill_hard(&mut child);
            timed_out = true;
        }

        if !readers_done && (status.is_some() || wait_error.is_some()) {
            match drain_deadline {
                None => drain_deadline = Some(Instant::now() + DRAIN_GRACE),
                Some(dd) if Instant::now() >= dd => {
                    abandoned_readers = true;
                    break;
                }
                Some(_) => {}
            }
        }

        if readers_done && status.is_none() && wait_error.is_none() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    if !abandoned_readers {
        let _ = reader_out.join();
        let _ = reader_err.join();
    }

    if let Some(sink) = sink.as_deref_mut() {
        if !pending.is_empty() {
            let _ = sink.write_all(&pending);
        }
        let _ = sink.flush();
    }

    let result = if let Some(message) = wait_error {
        Err(ExecError::Wait { message })
    } else if timed_out {
        Err(ExecError::Timeout { limit: timeout })
    } else {
        match status {
            Some(st) if st.success() => Ok(()),
            Some(st) => match st.code() {
                Some(code) => Err(ExecError::Exit { code }),
                None => Err(ExecError::Signal {
                    signal: signal_of(&st),
                }),
            },
            None => Err(ExecError::Wait {
                message: "subprocess never reported an exit status".to_string(),
            }),
        }
    };

    (output, result)
}

fn consume(
    chunk: &[u8],
    output: &mut Vec<u8>,
    pending: &mut Vec<u8>,
    sink: Option<&mut (dyn Write + '_)>,
) {
    output.extend_from_slice(chunk);
    let Some(sink) = sink else {
        return;
    };
    pending.extend_from_slice(chunk);
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        let _ = sink.write_all(&line);
    }
}

fn pump<R: Read>(reader: Option<R>, tx: mpsc::SyncSender<Vec<u8>>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(unix)]
fn kill_hard(child: &mut Child) {
    let pid = child.id() as i32;
    unsafe {
        let _ = libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_hard(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt as _;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_targets::{builtin_target, EmulatorLog, Scheduler, TargetFeatures};

    use crate::build::{BuildMode, BuildResult};

    fn fake_spec(emulator: &[&str]) -> TargetSpec {
        TargetSpec {
            name: "fake".to_string(),
            triple: "fake-unknown-none".to_string(),
            emulator: emulator.iter().map(|t| t.to_string()).collect(),
            features: TargetFeatures::default(),
            emulator_log: EmulatorLog::Plain,
            default_scheduler: Scheduler::None,
        }
    }

    #[test]
    fn native_command_line_is_the_artifact() {
        let spec = fake_spec(&[]);
        let argv = command_line(&spec, Path::new("/tmp/app"), &["x".to_string()]);
        assert_eq!(argv, vec!["/tmp/app".to_string(), "x".to_string()]);
    }

    #[test]
    fn emulator_placeholder_is_substituted() {
        let spec = fake_spec(&["emu", "-kernel", "{}", "-nographic"]);
        let argv = command_line(&spec, Path::new("/tmp/app"), &[]);
        assert_eq!(
            argv,
            vec![
                "emu".to_string(),
                "-kernel".to_string(),
                "/tmp/app".to_string(),
                "-nographic".to_string(),
            ]
        );
    }

    #[test]
    fn emulator_without_placeholder_appends_the_artifact() {
        let spec = fake_spec(&["emu", "-q"]);
        let argv = command_line(&spec, Path::new("/tmp/app"), &["a1".to_string()]);
        assert_eq!(
            argv,
            vec![
                "emu".to_string(),
                "-q".to_string(),
                "/tmp/app".to_string(),
                "a1".to_string(),
            ]
        );
    }

    #[test]
    fn preflight_skips_when_the_emulator_is_missing() {
        let spec = fake_spec(&["kestrel-no-such-emulator-7f3a"]);
        assert_eq!(
            preflight(&spec),
            Preflight::Skipped {
                tool: "kestrel-no-such-emulator-7f3a".to_string()
            }
        );
        assert_eq!(preflight(&fake_spec(&[])), Preflight::Ready);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::path::PathBuf;

        fn write_script(name: &str, body: &str) -> BuildResult {
            use std::os::unix::fs::PermissionsExt as _;

            let dir = crate::build::create_build_dir(Path::new("target/kestrel-test"))
                .expect("temp dir");
            let path = dir.join(name);
            let script = format!("#!/bin/sh\n{body}\n");
            std::fs::write(&path, script).expect("write script");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod script");

            BuildResult {
                artifact: path,
                spec: builtin_target("host").expect("host spec"),
                mode: BuildMode::Executable,
                artifact_sha256: String::new(),
            }
        }

        fn cleanup(build: &BuildResult) {
            if let Some(dir) = build.artifact.parent() {
                let _ = std::fs::remove_dir_all(dir);
            }
        }

        #[test]
        fn captures_combined_stdout_and_stderr() {
            let build = write_script("both", "echo out\necho err >&2");
            let (output, result) = run(&build, &[], &[], Duration::from_secs(10));
            assert_eq!(result, Ok(()));
            let text = String::from_utf8_lossy(&output);
            assert!(text.contains("out"), "missing stdout in {text:?}");
            assert!(text.contains("err"), "missing stderr in {text:?}");
            cleanup(&build);
        }

        #[test]
        fn arguments_and_environment_reach_the_artifact() {
            let build = write_script("argenv", "echo \"$1:$KESTREL_PROBE\"");
            let (output, result) = run(
                &build,
                &["first".to_string()],
                &[("KESTREL_PROBE".to_string(), "VALUE1".to_string())],
                Duration::from_secs(10),
            );
            assert_eq!(result, Ok(()));
            assert_eq!(output, b"first:VALUE1\n");
            cleanup(&build);
        }

        #[test]
        fn nonzero_exit_is_reported_with_its_code() {
            let build = write_script("fail3", "echo boom\nexit 3");
            let (output, result) = run(&build, &[], &[], Duration::from_secs(10));
            assert_eq!(result, Err(ExecError::Exit { code: 3 }));
            assert_eq!(output, b"boom\n");
            cleanup(&build);
        }

        #[test]
        fn hung_artifact_is_killed_within_the_timeout_slack() {
            let build = write_script("hang", "echo before\nsleep 30\necho after");
            let started = Instant::now();
            let (output, result) = run(&build, &[], &[], Duration::from_millis(300));
            let elapsed = started.elapsed();

            assert_eq!(
                result,
                Err(ExecError::Timeout {
                    limit: Duration::from_millis(300)
                })
            );
            assert!(
                elapsed < Duration::from_secs(5),
                "kill took too long: {elapsed:?}"
            );
            let text = String::from_utf8_lossy(&output);
            assert!(text.contains("before"));
            assert!(!text.contains("after"));
            cleanup(&build);
        }

        #[test]
        fn streaming_forwards_every_line_before_concluding() {
            let build = write_script("lines", "echo one\necho two\nprintf tail");
            let mut sink: Vec<u8> = Vec::new();
            let (output, result) =
                run_streaming(&build, &[], &[], Duration::from_secs(10), &mut sink);
            assert_eq!(result, Ok(()));
            assert_eq!(output, b"one\ntwo\ntail");
            assert_eq!(sink, b"one\ntwo\ntail");
            cleanup(&build);
        }

        #[test]
        fn spawn_failure_is_typed() {
            let mut build = write_script("gone", "exit 0");
            let dir = build.artifact.parent().map(PathBuf::from);
            build.artifact = build.artifact.with_file_name("missing-binary");
            let (output, result) = run(&build, &[], &[], Duration::from_secs(1));
            assert!(output.is_empty());
            assert!(matches!(result, Err(ExecError::Spawn { .. })));
            if let Some(dir) = dir {
                let _ = std::fs::remove_dir_all(dir);
            }
        }
    }
}
