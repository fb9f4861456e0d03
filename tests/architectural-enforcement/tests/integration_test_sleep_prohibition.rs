//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the picker MUST NOT call sleep methods.
//! Periodic work uses `tokio::time::interval`, waiting uses channels and
//! `Notify`.
//! **Exceptions**: retry backoff delays, test code, test support files.

use architectural_enforcement::{
    code_part, is_in_test_code, rust_sources, SourceFile, PRODUCTION_DIRS,
};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| rust_sources(dir))
        .filter(|file| !file.is_test_support())
        .flat_map(|file| check_file(&file))
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Delayed re-adds for retry backoff");
        eprintln!("  - Test code (#[test] or #[tokio::test] functions, #[cfg(test)] modules)");
        eprintln!("  - Periodic tasks using tokio::time::interval()");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

fn check_file(file: &SourceFile) -> Vec<String> {
    let lines = file.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);
        if !(code.contains("::sleep(") || code.contains(".sleep(")) {
            continue;
        }
        if is_in_test_code(&lines, idx) || is_backoff_context(&lines, idx) {
            continue;
        }
        violations.push(format!(
            "{}:{} - {}",
            file.path.display(),
            idx + 1,
            line.trim()
        ));
    }
    violations
}

/// Check if sleep waits out a retry delay handed over by a rate limiter
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_delay = false;
    let mut has_retry_context = false;
    for line in &lines[context] {
        let line = line.to_lowercase();
        if line.contains("delay") {
            has_delay = true;
        }
        if line.contains("retry") || line.contains("backoff") || line.contains("rate_limited") {
            has_retry_context = true;
        }
    }
    has_delay && has_retry_context
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
    fn test_polling_sleep_is_flagged() {
        let file = source(&[
            "pub async fn wait_for_pool(store: &PoolStore) {",
            "    while !store.is_ready() {",
            "        tokio::time::sleep(Duration::from_millis(10)).await;",
            "    }",
            "}",
        ]);
        assert_eq!(check_file(&file).len(), 1);
    }

    #[test]
    fn test_backoff_detection() {
        let lines = [
            "pub fn add_after(self: &Arc<Self>, item: K, delay: Duration) {",
            "    tokio::spawn(async move {",
            "        // retry backoff delay, cancelled by shutdown",
            "        tokio::time::sleep(delay).await;",
            "    });",
            "}",
        ];
        assert!(is_backoff_context(&lines, 3));
    }

    #[test]
    fn test_sleep_in_test_module_is_accepted() {
        let file = source(&[
            "#[cfg(test)]",
            "mod tests {",
            "    #[tokio::test]",
            "    async fn test_run() {",
            "        tokio::time::sleep(Duration::from_millis(500)).await;",
            "    }",
            "}",
        ]);
        assert!(check_file(&file).is_empty());
    }
}
