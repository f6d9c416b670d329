//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - Reducers stay pure (no awaiting, spawning or dispatching in `reduce`)
//! - No blocking sleeps or blocking HTTP clients in production code
//!
//! These tests are designed to catch violations early in the development cycle.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A source file loaded for inspection
#[derive(Debug)]
pub struct SourceFile {
    /// Path of the file
    pub path: PathBuf,
    /// Contents
    pub text: String,
}

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Every `.rs` file under the `src/` directories of the dashboard crates
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let dashboard = workspace_root().join("dashboard");
    WalkDir::new(dashboard)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .filter(|e| e.path().components().any(|c| c.as_os_str() == "src"))
        .filter_map(|e| {
            let text = fs::read_to_string(e.path()).ok()?;
            Some(SourceFile {
                path: e.path().to_path_buf(),
                text,
            })
        })
        .collect()
}

/// Source text with the `#[cfg(test)]` module and everything after it removed
#[must_use]
pub fn without_tests(text: &str) -> &str {
    text.find("#[cfg(test)]").map_or(text, |idx| &text[..idx])
}

/// Bodies of every function named `name`, braces included
#[must_use]
pub fn function_bodies<'a>(text: &'a str, name: &str) -> Vec<&'a str> {
    let needle = format!("fn {name}(");
    let mut bodies = Vec::new();
    let mut rest = text;
    let mut offset = 0;
    while let Some(found) = rest.find(&needle) {
        let start = offset + found;
        if let Some(body) = braced_block(&text[start..]) {
            bodies.push(body);
        }
        offset = start + needle.len();
        rest = &text[offset..];
    }
    bodies
}

/// First `{ ... }` block of `text`, matched by brace depth
fn braced_block(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    // a trait method declaration ends at `;` before any body
    if text[..open].contains(';') {
        return None;
    }
    let mut depth = 0usize;
    for (i, ch) in text[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=open + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Lines of `text` containing `pattern`, as `(line number, line)`
#[must_use]
pub fn find_lines<'a>(text: &'a str, pattern: &str) -> Vec<(usize, &'a str)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| line.contains(pattern) && !line.trim_start().starts_with("//"))
        .map(|(i, line)| (i + 1, line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_bodies() {
        let text = "fn reduce(&self) -> u8 { if x { 1 } else { 2 } }\nfn other() {}\nfn reduce(&self) -> u8;";
        assert_eq!(
            function_bodies(text, "reduce"),
            vec!["{ if x { 1 } else { 2 } }"]
        );
    }

    #[test]
    fn test_without_tests() {
        assert_eq!(without_tests("a\n#[cfg(test)]\nmod tests {}"), "a\n");
    }

    #[test]
    fn test_find_lines_skips_comments() {
        let text = "// std::thread::sleep is banned\nstd::thread::sleep(d);";
        assert_eq!(find_lines(text, "std::thread::sleep"), vec![(2, "std::thread::sleep(d);")]);
    }
}
