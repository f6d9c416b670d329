//! Workspace-wide architecture checks

use architectural_enforcement::{find_lines, function_bodies, production_sources, without_tests};

#[test]
fn test_sources_found() {
    let sources = production_sources();
    assert!(
        sources.iter().any(|s| s.path.ends_with("bus.rs")),
        "dashboard sources not found under the workspace root"
    );
}

#[test]
fn test_reducers_are_pure() {
    let mut violations = Vec::new();
    for source in production_sources() {
        for body in function_bodies(without_tests(&source.text), "reduce") {
            for banned in [".await", "spawn", "dispatch("] {
                if body.contains(banned) {
                    violations.push(format!("{}: reduce uses {banned}", source.path.display()));
                }
            }
        }
    }
    assert!(violations.is_empty(), "impure reducers:\n{}", violations.join("\n"));
}

#[test]
fn test_no_blocking_calls_in_production_code() {
    let mut violations = Vec::new();
    for source in production_sources() {
        let code = without_tests(&source.text);
        for banned in ["std::thread::sleep", "reqwest::blocking"] {
            for (line, text) in find_lines(code, banned) {
                violations.push(format!("{}:{line}: {}", source.path.display(), text.trim()));
            }
        }
    }
    assert!(violations.is_empty(), "blocking calls:\n{}", violations.join("\n"));
}
