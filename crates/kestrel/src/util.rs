use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn create_temp_dir(base: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(base)
        .with_context(|| format!("create temp dir base: {}", base.display()))?;

    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("kestrel_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return Ok(path);
        }
    }

    anyhow::bail!("failed to create temp dir under {}", base.display());
}

pub fn display_path<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().display().to_string()
}
