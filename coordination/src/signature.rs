//! Failure signature extraction
//!
//! Turns a raw failure (error text plus whatever structured context the agent
//! reported) into a comparable [`FailureSignature`]. Extraction is pure and
//! never fails: sparse input degrades to [`ErrorType::Unknown`] and an
//! `"unknown"` location.
//!
//! `context_hash` is a stable 64-bit hash over a normalized trace, so traces
//! that differ only in addresses, line numbers or whitespace collapse to the
//! same value across processes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::similarity::SimilarityScorer;

/// Location used when nothing better can be recovered
pub const UNKNOWN_LOCATION: &str = "unknown";

static TIMEOUT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(timed? ?out|deadline exceeded|ETIMEDOUT)").unwrap()
});

static NETWORK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(connection (refused|reset|closed)|ECONNREFUSED|ECONNRESET|dns|network is unreachable|tls handshake|503 service unavailable|502 bad gateway)",
    )
    .unwrap()
});

static DEPENDENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(failed to (fetch|download|resolve) (package|crate|dependency|dependencies)|registry|rate limit|no matching package|could not resolve dependency|npm ERR! (404|network))",
    )
    .unwrap()
});

static PERMISSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(permission denied|EACCES|forbidden|not permitted|unauthori[sz]ed)").unwrap()
});

static SYNTAX_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(syntax ?error|unexpected token|parse error|expected one of)").unwrap()
});

static COMPILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(error\[E\d{4}\]|cannot find|mismatched types|unresolved import|undefined reference|type ?error|compil(e|ation) failed)",
    )
    .unwrap()
});

static TEST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(assert(ion)?(_eq|_ne)? ?failed|test(s)? failed|expected .* (but )?(got|found)|FAILED)")
        .unwrap()
});

static RUNTIME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(panicked at|exception|segmentation fault|null pointer|stack overflow|out of memory|traceback)")
        .unwrap()
});

static LOCATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:-->\s*|\bat\s+|^|\s)([\w./\\-]+\.[A-Za-z]{1,5}):(\d+)").unwrap()
});

static PY_LOCATION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).unwrap());

static HEX_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());

static NUMBER_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

static WHITESPACE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Classified failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Build or type-check failure
    Compile,
    /// Source could not be parsed
    Syntax,
    /// Test assertions failed
    Test,
    /// Crash or exception while running
    Runtime,
    /// Tool or filesystem access denied
    Permission,
    /// Operation exceeded a deadline
    Timeout,
    /// Remote endpoint unreachable or flaky
    Network,
    /// Third-party package or registry problem
    Dependency,
    /// Nothing recognizable
    Unknown,
}

impl ErrorType {
    /// Whether this failure originates outside the agent's own work
    pub fn is_external(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network | Self::Dependency)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Syntax => "syntax",
            Self::Test => "test",
            Self::Runtime => "runtime",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Dependency => "dependency",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a caller-supplied category name
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compile" | "build" => Some(Self::Compile),
            "syntax" | "parse" => Some(Self::Syntax),
            "test" | "assertion" => Some(Self::Test),
            "runtime" | "panic" | "exception" => Some(Self::Runtime),
            "permission" => Some(Self::Permission),
            "timeout" => Some(Self::Timeout),
            "network" => Some(Self::Network),
            "dependency" | "external" => Some(Self::Dependency),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Classify free-form error text
    ///
    /// External categories are checked first so that, e.g., a test run that
    /// died on a registry outage is not mistaken for a test regression.
    pub fn classify(text: &str) -> Self {
        if TIMEOUT_PATTERN.is_match(text) {
            Self::Timeout
        } else if NETWORK_PATTERN.is_match(text) {
            Self::Network
        } else if DEPENDENCY_PATTERN.is_match(text) {
            Self::Dependency
        } else if PERMISSION_PATTERN.is_match(text) {
            Self::Permission
        } else if SYNTAX_PATTERN.is_match(text) {
            Self::Syntax
        } else if COMPILE_PATTERN.is_match(text) {
            Self::Compile
        } else if TEST_PATTERN.is_match(text) {
            Self::Test
        } else if RUNTIME_PATTERN.is_match(text) {
            Self::Runtime
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured context reported alongside a failure. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureContext {
    /// Caller's own classification (e.g. "network"), trusted when recognized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Explicit location string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Stack trace or tool output the hash is computed over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl FailureContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

/// Comparable fingerprint of one failure
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureSignature {
    /// Error text exactly as reported
    pub exact_message: String,
    /// Classified category
    pub error_type: ErrorType,
    /// `file:line` or `"unknown"`
    pub location: String,
    /// Stable hash over the normalized trace
    pub context_hash: u64,
}

impl FailureSignature {
    /// Byte-identical error text (the fast-path comparison)
    pub fn matches_exactly(&self, other: &FailureSignature) -> bool {
        self.exact_message == other.exact_message
    }

    /// Semantic similarity of the two error texts in `[0, 1]`
    ///
    /// Signatures with different categories or trace hashes are compared on
    /// message text alone, but a shared `context_hash` is treated as a
    /// perfect match.
    pub fn similarity(&self, other: &FailureSignature, scorer: &dyn SimilarityScorer) -> f64 {
        if self.context_hash == other.context_hash && self.error_type == other.error_type {
            return 1.0;
        }
        scorer.score(&self.exact_message, &other.exact_message)
    }
}

/// Extract a signature from an error message and its context
pub fn extract(error_message: &str, context: &FailureContext) -> FailureSignature {
    let error_type = context
        .error_type
        .as_deref()
        .and_then(ErrorType::parse)
        .unwrap_or_else(|| {
            let mut combined = error_message.to_string();
            if let Some(trace) = &context.stack_trace {
                combined.push('\n');
                combined.push_str(trace);
            }
            ErrorType::classify(&combined)
        });

    let location = resolve_location(error_message, context);

    let trace = context
        .stack_trace
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(error_message);

    FailureSignature {
        exact_message: error_message.to_string(),
        error_type,
        location,
        context_hash: context_hash(trace),
    }
}

fn resolve_location(error_message: &str, context: &FailureContext) -> String {
    if let Some(location) = context.location.as_deref().filter(|l| !l.trim().is_empty()) {
        return location.trim().to_string();
    }

    if let Some(file) = context.file.as_deref().filter(|f| !f.trim().is_empty()) {
        return match context.line {
            Some(line) => format!("{}:{}", file.trim(), line),
            None => file.trim().to_string(),
        };
    }

    let sources = [context.stack_trace.as_deref(), Some(error_message)];
    for text in sources.into_iter().flatten() {
        if let Some(caps) = PY_LOCATION_PATTERN.captures(text) {
            return format!("{}:{}", &caps[1], &caps[2]);
        }
        if let Some(caps) = LOCATION_PATTERN.captures(text) {
            return format!("{}:{}", &caps[1], &caps[2]);
        }
    }

    UNKNOWN_LOCATION.to_string()
}

/// Collapse volatile details so near-identical traces normalize identically
pub fn normalize_trace(trace: &str) -> String {
    let without_hex = HEX_PATTERN.replace_all(trace, "0x_");
    let without_numbers = NUMBER_PATTERN.replace_all(&without_hex, "N");
    let collapsed = WHITESPACE_PATTERN.replace_all(&without_numbers, " ");
    collapsed.trim().to_string()
}

/// Stable 64-bit hash of a normalized trace
pub fn context_hash(trace: &str) -> u64 {
    let normalized = normalize_trace(trace);
    let digest = blake3::hash(normalized.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::LexicalSimilarity;

    #[test]
    fn test_sparse_context_falls_back_to_unknown() {
        let sig = extract("something odd happened", &FailureContext::new());
        assert_eq!(sig.error_type, ErrorType::Unknown);
        assert_eq!(sig.location, UNKNOWN_LOCATION);
        assert_eq!(sig.exact_message, "something odd happened");
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            ErrorType::classify("error[E0308]: mismatched types"),
            ErrorType::Compile
        );
        assert_eq!(
            ErrorType::classify("connection refused (os error 111)"),
            ErrorType::Network
        );
        assert_eq!(
            ErrorType::classify("request timed out after 30s"),
            ErrorType::Timeout
        );
        assert_eq!(
            ErrorType::classify("thread 'main' panicked at src/lib.rs:4:5"),
            ErrorType::Runtime
        );
        assert_eq!(
            ErrorType::classify("assertion failed: left == right"),
            ErrorType::Test
        );
        assert!(ErrorType::Network.is_external());
        assert!(!ErrorType::Compile.is_external());
    }

    #[test]
    fn test_caller_error_type_wins() {
        let ctx = FailureContext::new().with_error_type("dependency");
        let sig = extract("assertion failed", &ctx);
        assert_eq!(sig.error_type, ErrorType::Dependency);

        let ctx = FailureContext::new().with_error_type("not-a-category");
        let sig = extract("assertion failed", &ctx);
        assert_eq!(sig.error_type, ErrorType::Test);
    }

    #[test]
    fn test_location_resolution() {
        let ctx = FailureContext::new().with_file("src/main.rs", Some(12));
        assert_eq!(extract("boom", &ctx).location, "src/main.rs:12");

        let ctx = FailureContext::new().with_location("parser::parse_expr");
        assert_eq!(extract("boom", &ctx).location, "parser::parse_expr");

        let sig = extract(
            "error[E0425]: cannot find value `x`\n --> src/lib.rs:7:13",
            &FailureContext::new(),
        );
        assert_eq!(sig.location, "src/lib.rs:7");

        let ctx = FailureContext::new()
            .with_stack_trace("Traceback:\n  File \"app/models.py\", line 42, in save");
        assert_eq!(extract("KeyError: 'id'", &ctx).location, "app/models.py:42");
    }

    #[test]
    fn test_near_identical_traces_share_hash() {
        let a = "panicked at 0x7ffd1234 in worker 3\n  at src/lib.rs:10";
        let b = "panicked at 0x7ffe9999 in worker 7\n   at src/lib.rs:11";
        assert_eq!(context_hash(a), context_hash(b));
    }

    #[test]
    fn test_unrelated_traces_diverge() {
        assert_ne!(
            context_hash("failed to open config file"),
            context_hash("index out of bounds in tokenizer")
        );
    }

    #[test]
    fn test_hash_is_stable_across_calls() {
        let trace = "error: linker `cc` not found";
        assert_eq!(context_hash(trace), context_hash(trace));
    }

    #[test]
    fn test_similarity_uses_hash_shortcut() {
        let scorer = LexicalSimilarity;
        let a = extract("test failed: expected 3 got 4", &FailureContext::new());
        let b = extract("test failed: expected 5 got 6", &FailureContext::new());
        assert!(!a.matches_exactly(&b));
        assert_eq!(a.similarity(&b, &scorer), 1.0);
    }
}
