//! Architectural Enforcement Integration Tests
//!
//! Source-level checks over the production code of every sockserv crate:
//! - No sleep-based polling (waits must block on a signal)
//! - No `unwrap()` / `expect()` outside tests
//!
//! Test modules (everything after the first `#[cfg(test)]` in a file) and
//! comments are ignored.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A forbidden pattern found in production code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the pattern
    pub file: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending source line, trimmed
    pub text: String,
}

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// All `.rs` files under `<root>/sockserv/*/src`
#[must_use]
pub fn production_sources(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root.join("sockserv"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .filter(|path| path.components().any(|c| c.as_os_str() == "src"))
        .collect();
    files.sort();
    files
}

/// Lines of `source` that belong to production code, with line numbers
pub fn production_lines(source: &str) -> impl Iterator<Item = (usize, &str)> {
    source
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
}

/// Scan `files` for any of `patterns`
#[must_use]
pub fn find_violations(files: &[PathBuf], patterns: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let Ok(source) = fs::read_to_string(file) else {
            continue;
        };
        for (line, text) in production_lines(&source) {
            if patterns.iter().any(|p| text.contains(p)) {
                violations.push(Violation {
                    file: file.clone(),
                    line,
                    text: text.trim().to_string(),
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(violations: &[Violation]) -> String {
        violations
            .iter()
            .map(|v| format!("{}:{}: {}", v.file.display(), v.line, v.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_sources_are_found() {
        let files = production_sources(&workspace_root());
        assert!(
            files.iter().any(|f| f.ends_with("server/dispatch.rs")),
            "expected to scan the core crate, found {files:?}"
        );
    }

    #[test]
    fn test_no_sleep_in_production_code() {
        let files = production_sources(&workspace_root());
        let violations = find_violations(
            &files,
            &["thread::sleep", "time::sleep(", "sleep_until("],
        );
        assert!(
            violations.is_empty(),
            "sleep-based waiting in production code:\n{}",
            report(&violations)
        );
    }

    #[test]
    fn test_no_unwrap_in_production_code() {
        let files = production_sources(&workspace_root());
        let violations = find_violations(&files, &[".unwrap()", ".expect("]);
        assert!(
            violations.is_empty(),
            "unwrap/expect in production code:\n{}",
            report(&violations)
        );
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = "fn a() {}\n// x.unwrap()\n#[cfg(test)]\nmod tests { fn b() { x.unwrap(); } }\n";
        let lines: Vec<_> = production_lines(source).collect();
        assert_eq!(lines, vec![(1, "fn a() {}")]);
    }
}
