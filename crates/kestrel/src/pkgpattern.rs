use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// A pattern ending in this marker selects the named package plus every
/// importable sub-package beneath it.
pub const RECURSIVE_SUFFIX: &str = "...";

const SOURCE_EXTENSION: &str = ".kes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The directory holds no directly buildable package but does hold
    /// sub-packages; the caller must use the recursive form to mean
    /// "everything under here".
    AmbiguousPackage(String),
    NoSuchPackage(String),
    EmptyResolution,
    Walk { pattern: String, message: String },
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternError::AmbiguousPackage(pattern) => write!(
                f,
                "{pattern}: directory contains only sub-packages (use {pattern}/{RECURSIVE_SUFFIX})"
            ),
            PatternError::NoSuchPackage(pattern) => write!(f, "no such package: {pattern}"),
            PatternError::EmptyResolution => write!(f, "patterns matched no packages"),
            PatternError::Walk { pattern, message } => write!(f, "walk {pattern}: {message}"),
        }
    }
}

impl std::error::Error for PatternError {}

/// Expands package patterns into a concrete, de-duplicated, order-stable
/// list of package identifiers (paths relative to `root`, `/`-separated).
///
/// Recursive expansions are sorted by path; across patterns the first
/// occurrence wins. Resolution is deterministic for identical filesystem
/// state. An empty result is an error, never a vacuous pass.
pub fn resolve_patterns(patterns: &[String], root: &Path) -> Result<Vec<String>, PatternError> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for pattern in patterns {
        for id in resolve_one(pattern, root)? {
            if seen.insert(id.clone()) {
                out.push(id);
            }
        }
    }

    if out.is_empty() {
        return Err(PatternError::EmptyResolution);
    }
    Ok(out)
}

fn resolve_one(pattern: &str, root: &Path) -> Result<Vec<String>, PatternError> {
    let cleaned = clean_pattern(pattern);

    if let Some(base) = strip_recursive(&cleaned) {
        let base_dir = if base.is_empty() {
            root.to_path_buf()
        } else {
            root.join(base)
        };
        if !base_dir.is_dir() {
            return Err(PatternError::NoSuchPackage(pattern.to_string()));
        }
        let mut ids = collect_buildable(&base_dir, root, pattern)?;
        ids.sort();
        return Ok(ids);
    }

    let dir = if cleaned.is_empty() {
        root.to_path_buf()
    } else {
        root.join(&cleaned)
    };
    if !dir.is_dir() {
        return Err(PatternError::NoSuchPackage(pattern.to_string()));
    }
    if is_buildable(&dir) {
        return Ok(vec![id_for(&dir, root)]);
    }

    // Not directly buildable: distinguish "only sub-packages" (the caller
    // must say so explicitly) from "nothing buildable at all".
    let descendants = collect_buildable(&dir, root, pattern)?;
    if descendants.is_empty() {
        Err(PatternError::NoSuchPackage(pattern.to_string()))
    } else {
        Err(PatternError::AmbiguousPackage(cleaned))
    }
}

fn clean_pattern(pattern: &str) -> String {
    let mut rest = pattern.trim();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.trim_end_matches('/').to_string()
}

fn strip_recursive(cleaned: &str) -> Option<&str> {
    if cleaned == RECURSIVE_SUFFIX {
        return Some("");
    }
    cleaned
        .strip_suffix(RECURSIVE_SUFFIX)
        .and_then(|base| base.strip_suffix('/'))
}

fn collect_buildable(
    base_dir: &Path,
    root: &Path,
    pattern: &str,
) -> Result<Vec<String>, PatternError> {
    let mut ids = Vec::new();
    for entry in WalkDir::new(base_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(should_walk_dir_entry)
    {
        let entry = entry.map_err(|err| PatternError::Walk {
            pattern: pattern.to_string(),
            message: err.to_string(),
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if is_buildable(entry.path()) {
            ids.push(id_for(entry.path(), root));
        }
    }
    Ok(ids)
}

fn should_walk_dir_entry(entry: &walkdir::DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    if !entry.file_type().is_dir() {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    !(name.starts_with('.') || name.starts_with('_') || name == "target" || name == "testdata")
}

/// A directory is a buildable package when it directly contains at least
/// one source file.
fn is_buildable(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || name.starts_with('_') {
            continue;
        }
        if name.ends_with(SOURCE_EXTENSION) {
            return true;
        }
    }
    false
}

fn id_for(dir: &Path, root: &Path) -> String {
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    let parts: Vec<String> = rel
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_tree() -> PathBuf {
        let dir = crate::util::create_temp_dir(Path::new("target/kestrel-test"))
            .expect("temp dir");
        let mk = |rel: &str| {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("mkdir");
            }
            std::fs::write(&path, b"{}\n").expect("write source");
        };
        mk("recurse/a.kes");
        mk("recurse/subdir/b.kes");
        mk("recurse/_private/c.kes");
        mk("recurse/.hidden/d.kes");
        mk("pass/x.kes");
        mk("container/sub1/s1.kes");
        mk("container/sub2/s2.kes");
        std::fs::create_dir_all(dir.join("empty")).expect("mkdir empty");
        dir
    }

    fn resolve(patterns: &[&str], root: &Path) -> Result<Vec<String>, PatternError> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        resolve_patterns(&patterns, root)
    }

    #[test]
    fn recursive_pattern_expands_sorted_with_the_base_first() {
        let root = fixture_tree();
        let ids = resolve(&["recurse/..."], &root).expect("resolve");
        assert_eq!(ids, vec!["recurse".to_string(), "recurse/subdir".to_string()]);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn plain_pattern_resolves_to_exactly_one_package() {
        let root = fixture_tree();
        let ids = resolve(&["pass"], &root).expect("resolve");
        assert_eq!(ids, vec!["pass".to_string()]);
        let ids = resolve(&["./recurse/subdir/"], &root).expect("resolve");
        assert_eq!(ids, vec!["recurse/subdir".to_string()]);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn container_of_only_subpackages_is_ambiguous() {
        let root = fixture_tree();
        match resolve(&["container"], &root) {
            Err(PatternError::AmbiguousPackage(p)) => assert_eq!(p, "container"),
            other => panic!("expected AmbiguousPackage, got {other:?}"),
        }
        // The recursive form is the explicit way to say "everything under".
        let ids = resolve(&["container/..."], &root).expect("resolve");
        assert_eq!(
            ids,
            vec!["container/sub1".to_string(), "container/sub2".to_string()]
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_and_empty_directories_are_not_packages() {
        let root = fixture_tree();
        assert_eq!(
            resolve(&["nope"], &root),
            Err(PatternError::NoSuchPackage("nope".to_string()))
        );
        assert_eq!(
            resolve(&["empty"], &root),
            Err(PatternError::NoSuchPackage("empty".to_string()))
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn duplicates_across_patterns_keep_the_first_occurrence() {
        let root = fixture_tree();
        let ids = resolve(&["recurse/...", "recurse", "pass"], &root).expect("resolve");
        assert_eq!(
            ids,
            vec![
                "recurse".to_string(),
                "recurse/subdir".to_string(),
                "pass".to_string(),
            ]
        );
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn hidden_and_underscore_directories_are_not_importable() {
        let root = fixture_tree();
        let ids = resolve(&["recurse/..."], &root).expect("resolve");
        assert!(!ids.iter().any(|id| id.contains("_private")));
        assert!(!ids.iter().any(|id| id.contains(".hidden")));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn resolution_is_stable_across_runs() {
        let root = fixture_tree();
        let first = resolve(&["..."], &root).expect("resolve");
        let second = resolve(&["..."], &root).expect("resolve");
        assert_eq!(first, second);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn no_patterns_is_an_error_not_a_vacuous_pass() {
        let root = fixture_tree();
        assert_eq!(resolve(&[], &root), Err(PatternError::EmptyResolution));
        let _ = std::fs::remove_dir_all(&root);
    }
}
