use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::create_timestamp;

pub const TIMEOUT_ERROR_PREFIX: &str = "Execution timed out";
pub const TIMEOUT_HINT: &str = "Tip: Try running with a smaller sample to keep execution fast.";
pub const STOPPED_ERROR: &str =
    "Execution stopped. If the runtime is still busy, restart the runner.";

/// Languages a snippet can be executed in
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    /// Runs in a disposable sandboxed script context
    JavaScript,
    /// Runs inside the shared, lazily loaded interpreter runtime
    Python,
}

impl Language {
    /// Maps a fence/declared language tag onto an executable language
    ///
    /// Returns `None` for languages that do not support execution.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Self::Python),
            "javascript" | "js" => Some(Self::JavaScript),
            _ => None,
        }
    }

    pub fn is_interpreted(self) -> bool {
        matches!(self, Self::Python)
    }

    /// Whether a run can be terminated outright instead of merely ignored
    pub fn supports_hard_cancel(self) -> bool {
        matches!(self, Self::JavaScript)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JavaScript => f.write_str("javascript"),
            Self::Python => f.write_str("python"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source_text: String,
}

/// Outcome of one execution, immutable once produced
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: String,
    pub error: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
}

impl ExecutionResult {
    pub fn new(output: String, error: Option<String>) -> Self {
        Self {
            output,
            error,
            timestamp: create_timestamp(),
            duration_ms: None,
        }
    }

    pub fn success(output: impl Into<String>) -> Self {
        Self::new(output.into(), None)
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::new(String::new(), Some(error.into()))
    }

    pub fn timed_out(limit: Duration) -> Self {
        let secs = (limit.as_millis() as f64 / 1000.0).round() as u64;
        Self::failure(format!(
            "{TIMEOUT_ERROR_PREFIX} after {secs}s. Try reducing the data size."
        ))
    }

    pub fn stopped() -> Self {
        Self::failure(STOPPED_ERROR)
    }

    pub fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Extra advice shown under timeout errors
    pub fn timeout_hint(&self) -> Option<&'static str> {
        self.error
            .as_deref()
            .filter(|e| e.contains(TIMEOUT_ERROR_PREFIX))
            .map(|_| TIMEOUT_HINT)
    }
}

/// Formats a duration the way the output panel shows it
pub fn format_duration(duration_ms: u64) -> String {
    if duration_ms < 1000 {
        format!("{duration_ms} ms")
    } else {
        format!("{:.2} s", duration_ms as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_declared_language_mapping() {
        assert_eq!(Language::from_declared("Python"), Some(Language::Python));
        assert_eq!(Language::from_declared(" py "), Some(Language::Python));
        assert_eq!(Language::from_declared("JS"), Some(Language::JavaScript));
        assert_eq!(Language::from_declared("rust"), None);
        assert_eq!(Language::from_declared(""), None);
    }

    #[test]
    fn test_timeout_and_stop_messages_differ() {
        let timed_out = ExecutionResult::timed_out(Duration::from_secs(10));
        let stopped = ExecutionResult::stopped();

        assert_eq!(
            timed_out.error.as_deref(),
            Some("Execution timed out after 10s. Try reducing the data size.")
        );
        assert_ne!(timed_out.error, stopped.error);
        assert_eq!(timed_out.timeout_hint(), Some(TIMEOUT_HINT));
        assert_eq!(stopped.timeout_hint(), None);
        assert!(timed_out.output.is_empty());
    }

    #[test]
    fn test_serialization_omits_missing_duration() {
        let mut result = ExecutionResult::success("2");
        result.timestamp = "2025-01-01T00:00:00.000Z".to_string();
        assert_json_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"output": "2", "error": null, "timestamp": "2025-01-01T00:00:00.000Z"})
        );

        let timed = result.with_duration(Duration::from_millis(1500));
        assert_eq!(serde_json::to_value(&timed).unwrap()["duration_ms"], json!(1500));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0 ms");
        assert_eq!(format_duration(999), "999 ms");
        assert_eq!(format_duration(1000), "1.00 s");
        assert_eq!(format_duration(12340), "12.34 s");
    }
}
