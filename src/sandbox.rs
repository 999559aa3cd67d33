mod harness;
mod script_runner;

pub use harness::escape_source;
pub use script_runner::ScriptRunner;
