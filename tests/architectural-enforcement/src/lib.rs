//! Architectural Enforcement Integration Tests
//!
//! Source scans that keep the picker's production code honest:
//! - No blocking I/O inside async code
//! - No sleeping except for retry backoff
//!
//! The helpers here are line based. They look backwards from a line for the
//! enclosing function or test module, which is enough for rustfmt-formatted
//! code.

use std::path::{Path, PathBuf};

/// Production source trees checked by the scans, relative to the workspace
pub const PRODUCTION_DIRS: &[&str] = &["picker/core/src", "picker/daemon/src"];

/// Files that only exist to support tests
pub const TEST_SUPPORT_FILES: &[&str] = &["testing.rs"];

pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// A Rust source file split into lines
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    pub fn is_test_support(&self) -> bool {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| TEST_SUPPORT_FILES.contains(&n))
    }

    pub fn line_refs(&self) -> Vec<&str> {
        self.lines.iter().map(String::as_str).collect()
    }
}

/// Every `.rs` file under `dir` (relative to the workspace root)
pub fn rust_sources(dir: &str) -> Vec<SourceFile> {
    let root = workspace_root().join(dir);
    if !root.exists() {
        return Vec::new();
    }

    walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|e| {
            let content = std::fs::read_to_string(e.path()).ok()?;
            Some(SourceFile {
                path: e.path().to_path_buf(),
                lines: content.lines().map(str::to_string).collect(),
            })
        })
        .collect()
}

/// The part of a line before any `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Check if line is inside a `#[cfg(test)]` module or a test function
pub fn is_in_test_code(lines: &[&str], current_idx: usize) -> bool {
    if lines[..current_idx]
        .iter()
        .any(|l| l.trim().starts_with("#[cfg(test)]"))
    {
        return true;
    }

    let Some(fn_idx) = (0..current_idx).rev().find(|&i| is_fn_line(lines[i].trim())) else {
        return false;
    };
    for i in (0..fn_idx).rev() {
        let line = lines[i].trim();
        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }
        if !line.starts_with("#[") && !line.starts_with("///") {
            break;
        }
    }
    false
}

/// Check if line is inside an async function
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx).is_some_and(|l| l.contains("async fn "))
}

/// Check if line is inside a plain (non-async) function
pub fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    enclosing_fn(lines, current_idx).is_some_and(|l| !l.contains("async fn "))
}

fn is_fn_line(line: &str) -> bool {
    line.starts_with("fn ")
        || line.starts_with("async fn ")
        || line.starts_with("pub fn ")
        || line.starts_with("pub async fn ")
        || line.starts_with("pub(crate) fn ")
        || line.starts_with("pub(crate) async fn ")
}

/// Nearest function signature above the line, stopping at module and impl
/// boundaries
fn enclosing_fn<'a>(lines: &[&'a str], current_idx: usize) -> Option<&'a str> {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();
        if is_fn_line(line) {
            return Some(line);
        }
        if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_function_detection() {
        let code = vec![
            "pub async fn load() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert!(is_in_async_function(&code, 1));
        assert!(!is_in_non_async_function(&code, 1));
    }

    #[test]
    fn test_non_async_function_detection() {
        let code = vec![
            "fn main() {",
            "    let contents = std::fs::read_to_string(\"config.toml\")?;",
            "}",
        ];
        assert!(is_in_non_async_function(&code, 1));
    }

    #[test]
    fn test_test_function_detection() {
        let code = vec![
            "#[tokio::test(start_paused = true)]",
            "async fn test_something() {",
            "    tokio::time::sleep(Duration::from_secs(1)).await;",
            "}",
        ];
        assert!(is_in_test_code(&code, 2));
    }

    #[test]
    fn test_cfg_test_module_detection() {
        let code = vec![
            "pub fn real() {}",
            "#[cfg(test)]",
            "mod tests {",
            "    fn helper() {",
            "        std::thread::sleep(Duration::from_millis(1));",
            "    }",
            "}",
        ];
        assert!(!is_in_test_code(&code, 0));
        assert!(is_in_test_code(&code, 4));
    }

    #[test]
    fn test_production_dirs_exist() {
        for dir in PRODUCTION_DIRS {
            assert!(!rust_sources(dir).is_empty(), "no sources under {dir}");
        }
    }
}
