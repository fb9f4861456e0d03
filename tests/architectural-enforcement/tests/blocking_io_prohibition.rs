//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code in the picker MUST NOT block inside async code.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::process` and async
//! `reqwest`, not their `std` or blocking counterparts.

use architectural_enforcement::{
    code_part, is_in_async_function, is_in_non_async_function, is_in_test_code, rust_sources,
    SourceFile, PRODUCTION_DIRS,
};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<String> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| rust_sources(dir))
        .flat_map(|file| check_file(&file))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::fs::*, std::net::*, std::process::Command");
        eprintln!("  - reqwest::blocking::*");
        eprintln!("  - std::thread::sleep");
        eprintln!("\n✅ ACCEPTABLE blocking I/O:");
        eprintln!("  - Non-async functions (before tokio runtime starts)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn check_file(file: &SourceFile) -> Vec<String> {
    let lines = file.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);

        if is_in_test_code(&lines, idx) || is_in_non_async_function(&lines, idx) {
            continue;
        }

        let kind = if code.contains("std::fs") {
            "Blocking file I/O"
        } else if code.contains("std::net") {
            "Blocking network I/O"
        } else if code.contains("std::process::Command") {
            "Blocking process I/O"
        } else if code.contains("reqwest::blocking") {
            "Blocking HTTP client"
        } else if code.contains("std::thread::sleep") {
            "Blocking sleep"
        } else if (code.contains("std::io::stdin()") || code.contains("std::io::stdout()"))
            && is_in_async_function(&lines, idx)
        {
            "Blocking stdin/stdout in async"
        } else {
            continue;
        };

        violations.push(format!(
            "{}:{} - {kind}: {}",
            file.path.display(),
            idx + 1,
            line.trim()
        ));
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn source(lines: &[&str]) -> SourceFile {
        SourceFile {
            path: PathBuf::from("example.rs"),
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn test_std_fs_in_async_fn_is_flagged() {
        let file = source(&[
            "pub async fn load(path: &Path) -> Result<String> {",
            "    Ok(std::fs::read_to_string(path)?)",
            "}",
        ]);
        assert_eq!(check_file(&file).len(), 1);
    }

    #[test]
    fn test_tokio_fs_is_accepted() {
        let file = source(&[
            "pub async fn load(path: &Path) -> Result<String> {",
            "    Ok(tokio::fs::read_to_string(path).await?)",
            "}",
        ]);
        assert!(check_file(&file).is_empty());
    }
}
