use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Syntax,
    Runtime,
    Import,
    Type,
    Security,
    Performance,
    Logic,
    Configuration,
    Dependency,
    Unknown,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Syntax => "syntax",
            ErrorType::Runtime => "runtime",
            ErrorType::Import => "import",
            ErrorType::Type => "type",
            ErrorType::Security => "security",
            ErrorType::Performance => "performance",
            ErrorType::Logic => "logic",
            ErrorType::Configuration => "configuration",
            ErrorType::Dependency => "dependency",
            ErrorType::Unknown => "unknown",
        }
    }

    pub fn probable_cause(self) -> &'static str {
        match self {
            ErrorType::Syntax => "Source file does not parse",
            ErrorType::Runtime => "Invalid value or missing key reached at runtime",
            ErrorType::Import => "Module or symbol cannot be resolved",
            ErrorType::Type => "Operation applied to a value of the wrong type",
            ErrorType::Security => "Operation blocked by a permission or security check",
            ErrorType::Performance => "Resource limit or timeout exceeded",
            ErrorType::Logic => "Program state contradicts an expected invariant",
            ErrorType::Configuration => "Configuration value is missing or invalid",
            ErrorType::Dependency => "Dependency version or installation is inconsistent",
            ErrorType::Unknown => "Unable to determine exact cause",
        }
    }

    pub fn suggestions(self) -> &'static [&'static str] {
        match self {
            ErrorType::Syntax => &[
                "Check brackets, quotes, and indentation near the reported line",
                "Run the language parser or linter on the file",
            ],
            ErrorType::Runtime => &[
                "Validate inputs before use",
                "Guard lookups with defaults for missing keys or indexes",
            ],
            ErrorType::Import => &[
                "Install the missing module or add it to the dependency manifest",
                "Check the import path and symbol name",
            ],
            ErrorType::Type => &[
                "Check the value's type before calling the operation",
                "Verify the attribute exists on the object",
            ],
            ErrorType::Security => &[
                "Review permissions on the affected resource",
                "Escalate to the security owner before changing access",
            ],
            ErrorType::Performance => &[
                "Profile the hot path and add limits or pagination",
                "Raise the timeout only after confirming the workload is expected",
            ],
            ErrorType::Logic => &["Add assertions around the failing invariant"],
            ErrorType::Configuration => &["Compare the configuration against the documented defaults"],
            ErrorType::Dependency => &["Pin and reinstall the dependency set"],
            ErrorType::Unknown => &["Manual review required"],
        }
    }

    /// Kind of change a fix for this error usually needs.
    pub fn fix_kind(self) -> &'static str {
        match self {
            ErrorType::Import | ErrorType::Dependency => "dependency",
            ErrorType::Configuration => "config",
            ErrorType::Unknown => "manual",
            _ => "code",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::High => "high",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::Low => "low",
            ErrorSeverity::Info => "info",
        }
    }

    pub fn impact(self) -> &'static str {
        match self {
            ErrorSeverity::Critical => "Service is down or data is at risk",
            ErrorSeverity::High => "Major feature is broken",
            ErrorSeverity::Medium => "Feature degraded with a workaround available",
            ErrorSeverity::Low => "Minor inconvenience",
            ErrorSeverity::Info => "No user-facing impact",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PATTERN_TABLE: &[(ErrorType, &[&str])] = &[
    (
        ErrorType::Syntax,
        &[
            r"SyntaxError:",
            r"unexpected EOF",
            r"invalid syntax",
            r"unexpected indent",
        ],
    ),
    (
        ErrorType::Import,
        &[
            r"ImportError:",
            r"ModuleNotFoundError:",
            r"cannot import name",
            r"No module named",
        ],
    ),
    (
        ErrorType::Type,
        &[
            r"TypeError:",
            r"AttributeError:",
            r"object has no attribute",
            r"not subscriptable",
        ],
    ),
    (
        ErrorType::Runtime,
        &[r"RuntimeError:", r"ValueError:", r"KeyError:", r"IndexError:"],
    ),
    (
        ErrorType::Security,
        &[
            r"SecurityError:",
            r"PermissionError:",
            r"(?i)sql injection",
            r"(?i)XSS vulnerability",
        ],
    ),
    (
        ErrorType::Performance,
        &[
            r"TimeoutError:",
            r"MemoryError:",
            r"maximum recursion depth",
            r"(?i)performance degradation",
        ],
    ),
];

static ERROR_PATTERNS: LazyLock<Vec<(ErrorType, Regex)>> = LazyLock::new(|| {
    PATTERN_TABLE
        .iter()
        .flat_map(|(kind, patterns)| {
            patterns
                .iter()
                .filter_map(move |pattern| Regex::new(pattern).ok().map(|re| (*kind, re)))
        })
        .collect()
});

static LOCATION_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).ok());

/// First matching entry of the ordered pattern table wins.
pub fn detect_error_type(message: &str) -> ErrorType {
    ERROR_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(message))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorType::Unknown)
}

pub fn assess_severity(error_type: ErrorType, message: &str) -> ErrorSeverity {
    if matches!(error_type, ErrorType::Security | ErrorType::Runtime) {
        return ErrorSeverity::Critical;
    }

    let message = message.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|word| message.contains(word));
    if mentions(&["critical", "fatal", "emergency"]) {
        ErrorSeverity::Critical
    } else if mentions(&["high", "important", "major"]) {
        ErrorSeverity::High
    } else if mentions(&["medium", "moderate", "warning"]) {
        ErrorSeverity::Medium
    } else if mentions(&["low", "minor", "info"]) {
        ErrorSeverity::Low
    } else {
        ErrorSeverity::Medium
    }
}

/// First `File "<path>", line <n>` frame in a stack trace.
pub fn location_from_trace(stack_trace: &str) -> Option<(String, u32)> {
    let pattern = LOCATION_PATTERN.as_ref()?;
    let captures = pattern.captures(stack_trace)?;
    let file = captures.get(1)?.as_str().to_string();
    let line = captures.get(2)?.as_str().parse().ok()?;
    Some((file, line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_types_in_table_order() {
        assert_eq!(
            detect_error_type("SyntaxError: unexpected EOF while parsing"),
            ErrorType::Syntax
        );
        assert_eq!(
            detect_error_type("ModuleNotFoundError: No module named 'yaml'"),
            ErrorType::Import
        );
        assert_eq!(
            detect_error_type("'NoneType' object has no attribute 'id'"),
            ErrorType::Type
        );
        assert_eq!(detect_error_type("KeyError: 'user'"), ErrorType::Runtime);
        assert_eq!(
            detect_error_type("possible SQL Injection in query builder"),
            ErrorType::Security
        );
        assert_eq!(
            detect_error_type("RecursionError: maximum recursion depth exceeded"),
            ErrorType::Performance
        );
        assert_eq!(detect_error_type("disk quota exceeded"), ErrorType::Unknown);
    }

    #[test]
    fn syntax_wins_over_later_patterns() {
        // Mentions both a syntax marker and a runtime marker.
        assert_eq!(
            detect_error_type("ValueError: invalid syntax in template"),
            ErrorType::Syntax
        );
    }

    #[test]
    fn case_sensitive_patterns_stay_case_sensitive() {
        assert_eq!(detect_error_type("syntaxerror: nope"), ErrorType::Unknown);
        assert_eq!(
            detect_error_type("PERFORMANCE DEGRADATION on node-3"),
            ErrorType::Performance
        );
    }

    #[test]
    fn severity_rules() {
        assert_eq!(
            assess_severity(ErrorType::Runtime, "minor"),
            ErrorSeverity::Critical
        );
        assert_eq!(
            assess_severity(ErrorType::Security, ""),
            ErrorSeverity::Critical
        );
        assert_eq!(
            assess_severity(ErrorType::Syntax, "Fatal: parser crashed"),
            ErrorSeverity::Critical
        );
        assert_eq!(
            assess_severity(ErrorType::Import, "major module missing"),
            ErrorSeverity::High
        );
        assert_eq!(
            assess_severity(ErrorType::Type, "deprecation warning"),
            ErrorSeverity::Medium
        );
        assert_eq!(
            assess_severity(ErrorType::Unknown, "minor glitch"),
            ErrorSeverity::Low
        );
        assert_eq!(
            assess_severity(ErrorType::Unknown, "something odd"),
            ErrorSeverity::Medium
        );
    }

    #[test]
    fn location_is_read_from_first_frame() {
        let trace = "Traceback (most recent call last):\n  File \"/srv/app/main.py\", line 42, in <module>\n  File \"/srv/app/util.py\", line 7, in load";
        assert_eq!(
            location_from_trace(trace),
            Some(("/srv/app/main.py".to_string(), 42))
        );
        assert_eq!(location_from_trace("no frames here"), None);
    }
}
