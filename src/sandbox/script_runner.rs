use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::ScriptConfig;
use crate::execution::ExecutionResult;
use crate::tool_available;

use super::harness;

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Message the context sends back once the snippet is done
#[derive(Deserialize, Debug)]
struct ContextMessage {
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs script-language snippets, each in its own throw-away context
///
/// Every run gets a fresh interpreter process with an empty environment and
/// an empty working directory. Nothing survives between runs. The runner does
/// not enforce a timeout; dropping the returned future kills the context.
pub struct ScriptRunner {
    command: Vec<String>,
}

impl ScriptRunner {
    pub fn new(config: &ScriptConfig) -> Self {
        if let Some(program) = config.command.first() {
            if !tool_available(program) {
                log::warn!("Script command {program} not found on PATH; script snippets will fail");
            }
        }
        Self {
            command: config.command.clone(),
        }
    }

    /// Executes `source`; always resolves, failures land in `error`
    pub async fn run(&self, source: &str) -> ExecutionResult {
        match self.run_in_context(source).await {
            Ok(result) => result,
            Err(e) => {
                log::debug!("Script context failed: {e:#}");
                ExecutionResult::failure(format!("{e:#}"))
            }
        }
    }

    async fn run_in_context(&self, source: &str) -> Result<ExecutionResult> {
        let mut context = ScriptContext::create(&self.command)?;
        let script = harness::build(source, &context.nonce)?;

        let mut stdin = context
            .child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Script context stdin unavailable"))?;
        stdin.write_all(script.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let message = context.wait_for_message().await?;
        log::debug!("Script context {} reported back", context.nonce);

        Ok(ExecutionResult::new(
            message.output.unwrap_or_default(),
            message.error,
        ))
    }
}

/// One disposable execution context; torn down on drop whatever the outcome
struct ScriptContext {
    nonce: String,
    work_dir: PathBuf,
    child: Child,
}

impl ScriptContext {
    fn create(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("Empty script command");
        };

        let seq = CONTEXT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let nonce = format!(
            "lesson-{}-{seq}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let work_dir = std::env::temp_dir().join("lesson-runner-script").join(&nonce);
        fs::create_dir_all(&work_dir)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Only PATH survives, so the host program can still be located
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        let child = cmd.spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_dir_all(&work_dir);
                bail!("Failed to start script context ({program}): {e}");
            }
        };

        Ok(Self {
            nonce,
            work_dir,
            child,
        })
    }

    /// Waits for the single tagged message; other output lines are ignored
    async fn wait_for_message(&mut self) -> Result<ContextMessage> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Script context stdout unavailable"))?;
        let stderr = self.child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut collected).await;
            }
            collected
        });

        let tag = format!("{} ", self.nonce);
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(payload) = line.strip_prefix(&tag) {
                stderr_task.abort();
                return serde_json::from_str(payload)
                    .map_err(|e| anyhow!("Malformed message from script context: {e}"));
            }
        }

        let status = self.child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        let stderr = stderr.trim();
        if stderr.is_empty() {
            bail!("Script context exited ({status}) without reporting a result");
        }
        bail!("Script context exited ({status}) without reporting a result:\n{stderr}");
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            log::debug!("Script context {} already exited: {e}", self.nonce);
        }
        if let Err(e) = fs::remove_dir_all(&self.work_dir) {
            log::debug!(
                "Unable to remove script context dir {}: {e}",
                self.work_dir.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn runner_with(command: &[&str]) -> ScriptRunner {
        ScriptRunner::new(&ScriptConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[tokio::test]
    async fn test_empty_command_resolves_with_error() {
        let result = runner_with(&[]).run("console.log(1)").await;
        assert_eq!(result.output, "");
        assert_eq!(result.error.as_deref(), Some("Empty script command"));
    }

    #[tokio::test]
    async fn test_missing_program_resolves_with_error() {
        let result = runner_with(&["definitely-not-a-script-host"])
            .run("console.log(1)")
            .await;
        assert!(
            result
                .error
                .unwrap()
                .starts_with("Failed to start script context (definitely-not-a-script-host)")
        );
    }

    #[tokio::test]
    async fn test_context_without_message_reports_exit() {
        // `cat` echoes the harness back but never emits the tagged line
        let result = runner_with(&["/bin/cat"]).run("console.log(1)").await;
        let error = result.error.unwrap();
        assert!(error.starts_with("Script context exited"), "{error}");
    }

    #[tokio::test]
    async fn test_context_is_torn_down_on_drop() {
        let context = ScriptContext::create(&["/bin/cat".to_string()]).unwrap();
        let work_dir = context.work_dir.clone();
        assert!(work_dir.is_dir());

        drop(context);
        assert!(!work_dir.exists());
    }
}
