use std::sync::OnceLock;

use kestrel_targets::{EmulatorLog, TargetSpec};

/// Which normalization steps apply to a captured stream.
///
/// Derived from the target's capabilities plus the test identity, so call
/// sites never switch on target names. Each step is an independent toggle;
/// the step order inside [`normalize`] is fixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NormalizeProfile {
    strip_avr_log: bool,
    mask_durations: bool,
}

impl NormalizeProfile {
    /// Line-ending canonicalization only. This is the profile applied to
    /// golden expectation files.
    pub fn plain() -> Self {
        NormalizeProfile::default()
    }

    pub fn for_target(spec: &TargetSpec) -> Self {
        NormalizeProfile {
            strip_avr_log: spec.emulator_log == EmulatorLog::AvrColored,
            mask_durations: false,
        }
    }

    /// Enable the `(D.DDs)` elapsed-duration mask for tests that print
    /// wall-clock timings.
    pub fn mask_durations(mut self, on: bool) -> Self {
        self.mask_durations = on;
        self
    }
}

/// Deterministic post-processing of captured output.
///
/// Pure: same bytes and same profile always yield the same result. Step
/// order is fixed: line endings first, then emulator log stripping, then
/// the duration mask.
pub fn normalize(raw: &[u8], profile: &NormalizeProfile) -> Vec<u8> {
    let mut out = replace_all(raw, b"\r\n", b"\n");

    if profile.strip_avr_log {
        // simavr wraps program output in color escapes and emits
        // per-instruction trace dots.
        out = replace_all(&out, b"\x1b[32m", b"");
        out = replace_all(&out, b"\x1b[0m", b"");
        out = replace_all(&out, b"..\n", b"\n");
        out = replace_all(&out, b"\n.\n", b"\n\n");
    }

    if profile.mask_durations {
        out = duration_re()
            .replace_all(&out, &b"(0.00s)"[..])
            .into_owned();
    }

    out
}

fn duration_re() -> &'static regex::bytes::Regex {
    static RE: OnceLock<regex::bytes::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::bytes::Regex::new(r"\([0-9]\.[0-9][0-9]s\)").expect("duration pattern")
    })
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = find(rest, needle) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replacement);
        rest = &rest[pos + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
