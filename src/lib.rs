pub mod config;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod interpreter;
pub mod lifecycle;
pub mod runtime;
pub mod sandbox;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Returns whether `program` can be found on `PATH`
pub fn tool_available(program: &str) -> bool {
    std::process::Command::new("which")
        .arg(program)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
