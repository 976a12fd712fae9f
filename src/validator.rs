//! Static denylist validator.
//!
//! Scans submitted code for dangerous execution and network primitives before
//! any process is spawned. This is a fast-reject heuristic layered in front of
//! the runner's process-level isolation, not a sandboxing guarantee by itself:
//! the real boundary is the isolated process (resource limits, scratch-confined
//! filesystem, builtin guards).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Verdict returned by [`validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

struct DenyPattern {
    regex: Regex,
    description: &'static str,
}

fn deny(pattern: &str, description: &'static str) -> DenyPattern {
    DenyPattern {
        // Patterns are fixed at compile time; a failure here is a programmer
        // error caught by the test suite.
        regex: Regex::new(pattern).unwrap(),
        description,
    }
}

static DENY_PATTERNS: LazyLock<Vec<DenyPattern>> = LazyLock::new(|| {
    vec![
        // Dynamic execution primitives
        deny(r"\beval\s*\(", "eval() - dynamic code evaluation"),
        deny(r"\bexec\s*\(", "exec() - dynamic code execution"),
        deny(r"\bcompile\s*\(", "compile() - dynamic code compilation"),
        deny(r"\b__import__\s*\(", "__import__() - dynamic imports"),
        deny(r"\bglobals\s*\(", "globals() - namespace introspection"),
        deny(r"\blocals\s*\(", "locals() - namespace introspection"),
        deny(r"\bvars\s*\(", "vars() - namespace introspection"),
        // Process and OS access
        deny(
            r"(?m)^\s*(?:import|from)\s+os\b",
            "os module - operating system access",
        ),
        deny(
            r"(?m)^\s*(?:import|from)\s+subprocess\b",
            "subprocess module - process execution",
        ),
        deny(
            r"(?m)^\s*(?:import|from)\s+importlib\b",
            "importlib - dynamic import machinery",
        ),
        deny(
            r"(?m)^\s*(?:import|from)\s+ctypes\b",
            "ctypes - native code access",
        ),
        deny(r"\bos\.system\s*\(", "os.system() - system commands"),
        // Network access primitives
        deny(
            r"(?m)^\s*(?:import|from)\s+socket\b",
            "socket module - network access",
        ),
        deny(r"\bsocket\.", "socket usage - network access"),
        deny(
            r"(?m)^\s*(?:import|from)\s+urllib\b",
            "urllib - network access",
        ),
        deny(r"\burllib\.", "urllib usage - network access"),
        deny(
            r"(?m)^\s*(?:import|from)\s+(?:requests|httpx|aiohttp)\b",
            "HTTP client library - network access",
        ),
        deny(
            r"(?m)^\s*(?:import|from)\s+http\b",
            "http module - network access",
        ),
    ]
});

/// Validate submitted code against the denylist.
///
/// Pure function: same input always yields the same report. Empty code is
/// valid. Patterns match on word boundaries, so identifiers that merely
/// contain a banned substring (`importance`, `silvereval`) do not trip it.
pub fn validate(code: &str) -> ValidationReport {
    let mut errors = Vec::new();

    for pattern in DENY_PATTERNS.iter() {
        if pattern.regex.is_match(code) {
            errors.push(format!(
                "Dangerous pattern detected: {}",
                pattern.description
            ));
        }
    }

    ValidationReport {
        valid: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_code_is_valid() {
        let report = validate("");
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn plain_code_is_valid() {
        let report = validate("x = 1 + 2\nprint(x)\n");
        assert!(report.valid);
    }

    #[test]
    fn eval_is_rejected() {
        let report = validate("result = eval('1 + 1')");
        assert!(!report.valid);
        assert!(report.errors[0].contains("Dangerous pattern"));
        assert!(report.errors[0].contains("eval"));
    }

    #[test]
    fn dynamic_import_is_rejected() {
        let report = validate("mod = __import__('os')");
        assert!(!report.valid);
        assert!(report
            .errors
            .iter()
            .any(|e| e.to_lowercase().contains("dangerous pattern")));
    }

    #[test]
    fn os_and_subprocess_imports_are_rejected() {
        let report = validate("import os\nimport subprocess\n");
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn network_primitives_are_rejected() {
        for code in [
            "import socket",
            "from urllib import request",
            "import requests",
            "s = socket.socket()",
        ] {
            let report = validate(code);
            assert!(!report.valid, "expected rejection for: {}", code);
        }
    }

    #[test]
    fn word_boundaries_avoid_false_positives() {
        // Identifiers containing banned substrings are fine.
        let report = validate("importance = 5\nmedieval = 'period'\nexecutor_count = 2\n");
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn os_path_attribute_alone_is_not_import() {
        // Accessing a variable named os_path should not match the os import rule.
        let report = validate("os_path = '/tmp'\n");
        assert!(report.valid);
    }

    #[test]
    fn validation_is_idempotent() {
        let code = "import os\neval('x')";
        let first = validate(code);
        let second = validate(code);
        assert_eq!(first, second);
        assert!(!first.valid);
    }
}
