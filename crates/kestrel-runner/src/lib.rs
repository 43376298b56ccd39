//! Target-aware build and execution orchestration.
//!
//! This crate coordinates the external compiler/linker and the target
//! emulators: it resolves build configuration into a target spec, gates
//! concurrent builds behind a shared permit pool, executes artifacts
//! (natively or emulator-wrapped) under a hard wall-clock timeout, and
//! normalizes captured output for byte-exact golden comparison.

pub mod build;
pub mod check;
pub mod exec;
pub mod normalize;
pub mod options;
pub mod sema;

pub use build::{BuildError, BuildMode, BuildResult, BuildScheduler, Builder, KestrelcBuilder};
pub use check::{build_and_check, RunOutcome};
pub use exec::{preflight, run, run_streaming, ExecError, Preflight};
pub use normalize::{normalize, NormalizeProfile};
pub use options::{ConfigError, Options, OptionsBuilder};
pub use sema::{Permit, Semaphore};
