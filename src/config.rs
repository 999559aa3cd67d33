use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_RUNTIME_BASE: &str = "/usr/";
pub const RUNTIME_BASE_ENV: &str = "LESSON_RUNTIME_BASE";
pub const DEFAULT_EXECUTION_TIMEOUT: MilliSecond = MilliSecond(10_000);

#[derive(Parser)]
#[command(name = "lesson-runner", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Language of the snippet (python, javascript)
    #[arg(long = "language", short = 'l', default_value = "python")]
    pub language: String,

    /// File holding the snippet; read from stdin when omitted
    #[arg(long = "file", short = 'f')]
    pub file: Option<String>,

    /// Start loading the interpreter runtime before reading the snippet
    #[arg(long = "prewarm", default_value_t = false)]
    pub prewarm: bool,

    /// Override the execution timeout in milliseconds
    #[arg(long = "timeout-ms")]
    pub timeout_ms: Option<u64>,
}

impl CliArgs {
    /// Load the configuration from the specified file, or defaults if none was given
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader).map_err(std::io::Error::from)?
            }
            None => Config::default(),
        };
        if let Some(ms) = self.timeout_ms {
            config.execution.timeout_ms = MilliSecond(ms);
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub script: ScriptConfig,
    pub execution: ExecutionConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Installation prefix of the interpreter; `LESSON_RUNTIME_BASE` wins over this
    pub base: Option<String>,
    pub optional_packages: Vec<String>,
    pub startup_timeout_ms: MilliSecond,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base: None,
            optional_packages: vec!["numpy".to_string(), "pandas".to_string()],
            startup_timeout_ms: MilliSecond(30_000),
        }
    }
}

impl RuntimeConfig {
    /// The base location override, from the environment first, then the file
    pub fn base_override(&self) -> Option<String> {
        std::env::var(RUNTIME_BASE_ENV)
            .ok()
            .or_else(|| self.base.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ScriptConfig {
    /// Command that evaluates a script fed on stdin
    pub command: Vec<String>,
}

/// Default script host: no filesystem or child process access, no code generation
/// from strings, and `import()` routed to the harness's refusal callback
const DEFAULT_SCRIPT_COMMAND: &[&str] = &[
    "node",
    "--experimental-permission",
    "--experimental-vm-modules",
    "--disallow-code-generation-from-strings",
    "--no-warnings",
    "-",
];

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_SCRIPT_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_ms: MilliSecond,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}
