use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::{LoadError, RuntimeError};

use super::{InterpreterRuntime, RuntimeBackend, RuntimeHandle, RuntimeLocation};

/// Interpreter executable, relative to the runtime base
pub const LOADER_ENTRY: &str = "bin/python3";

const BOOTSTRAP_FILE: &str = "bootstrap.py";
const BOOTSTRAP_SOURCE: &str = include_str!("bootstrap.py");
const BOOTSTRAP_MARKER: &str = "# lesson-runtime-bootstrap";

// Staging directory permissions
const CACHE_DIR_PERMISSIONS: u32 = 0o700;

/// Loader entry that passed staging
#[derive(Debug, Clone)]
struct StagedLoader {
    entry: PathBuf,
    bootstrap: PathBuf,
}

/// Runs the interpreter as a long-lived child process
///
/// Staging checks that the interpreter exists under the base location and
/// writes the bootstrap script into the cache directory. Starting spawns the
/// interpreter on that script and waits for its ready handshake.
pub struct ProcessBackend {
    startup_timeout: Duration,
    staging_dir: Option<PathBuf>,
    staged: Mutex<Option<StagedLoader>>,
}

impl ProcessBackend {
    pub fn new(startup_timeout: Duration) -> Self {
        Self {
            startup_timeout,
            staging_dir: None,
            staged: Mutex::new(None),
        }
    }

    /// Stages the bootstrap into `dir` instead of the user cache directory
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Sets up the directory the bootstrap script is staged into
    fn setup_cache_directory(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.staging_dir {
            fs::create_dir_all(dir)?;
            return Ok(dir.clone());
        }

        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "lesson-runner")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;

        let cache_dir = proj_dirs.cache_dir().join("runtime");
        fs::create_dir_all(&cache_dir)?;
        fs::set_permissions(&cache_dir, fs::Permissions::from_mode(CACHE_DIR_PERMISSIONS))?;

        Ok(cache_dir)
    }

    /// Writes the bootstrap unless an identical, marked copy is already there
    fn stage_bootstrap(&self) -> Result<PathBuf> {
        let path = self.setup_cache_directory()?.join(BOOTSTRAP_FILE);
        let current = fs::read_to_string(&path).ok();
        let already_staged = current
            .as_deref()
            .is_some_and(|s| s.starts_with(BOOTSTRAP_MARKER) && s == BOOTSTRAP_SOURCE);

        if already_staged {
            log::debug!("Runtime bootstrap already staged at {}", path.display());
        } else {
            fs::write(&path, BOOTSTRAP_SOURCE)?;
            log::debug!("Runtime bootstrap staged at {}", path.display());
        }
        Ok(path)
    }

    async fn spawn_runtime(
        &self,
        staged: &StagedLoader,
        base: &RuntimeLocation,
    ) -> Result<ProcessRuntime> {
        let mut child = Command::new(&staged.entry)
            .arg("-I")
            .arg("-u")
            .arg(&staged.bootstrap)
            .arg("--base")
            .arg(base.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}", staged.entry.display(), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Runtime stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Runtime stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("runtime stderr: {line}");
                }
            });
        }

        let mut replies = BufReader::new(stdout).lines();
        let handshake = timeout(self.startup_timeout, replies.next_line())
            .await
            .map_err(|_| anyhow!("no handshake within {:?}", self.startup_timeout))??
            .ok_or_else(|| anyhow!("runtime exited before its handshake"))?;
        let handshake: Handshake = serde_json::from_str(&handshake)
            .map_err(|e| anyhow!("invalid handshake {handshake:?}: {e}"))?;
        if !handshake.ready {
            return Err(anyhow!("runtime reported it is not ready"));
        }
        log::info!("Interpreter runtime {} started", handshake.version);

        let (commands, requests) = mpsc::channel(8);
        tokio::spawn(serve(child, stdin, replies, requests));

        Ok(ProcessRuntime { commands })
    }
}

#[async_trait]
impl RuntimeBackend for ProcessBackend {
    fn loader_present(&self) -> bool {
        self.staged.lock().is_some()
    }

    async fn inject_loader(&self, base: &RuntimeLocation) -> Result<(), LoadError> {
        let entry = base.entry(LOADER_ENTRY);
        let unavailable = |reason: String| LoadError::LoaderUnavailable {
            location: entry.display().to_string(),
            reason,
        };

        if !is_executable(&entry) {
            return Err(unavailable("no interpreter executable found".to_string()));
        }
        let bootstrap = self.stage_bootstrap().map_err(|e| unavailable(e.to_string()))?;

        *self.staged.lock() = Some(StagedLoader {
            entry: entry.clone(),
            bootstrap,
        });
        log::info!("Runtime loader staged from {}", entry.display());
        Ok(())
    }

    async fn instantiate(&self, base: &RuntimeLocation) -> Result<RuntimeHandle, LoadError> {
        let staged = self.staged.lock().clone().ok_or(LoadError::EntryMissing)?;

        match self.spawn_runtime(&staged, base).await {
            Ok(runtime) => Ok(Arc::new(runtime) as RuntimeHandle),
            Err(e) => {
                // Force the next attempt to stage again
                self.staged.lock().take();
                Err(LoadError::Startup(e.to_string()))
            }
        }
    }
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct Handshake {
    ready: bool,
    #[serde(default)]
    version: String,
}

#[derive(Serialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Run { code: String },
    LoadPackage { name: String },
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: &'a Request,
}

#[derive(Deserialize)]
struct Reply {
    id: Option<u64>,
    ok: bool,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

struct RuntimeCommand {
    request: Request,
    responder: oneshot::Sender<Result<Option<String>, RuntimeError>>,
}

/// Handle to a running interpreter process
pub struct ProcessRuntime {
    commands: mpsc::Sender<RuntimeCommand>,
}

impl ProcessRuntime {
    async fn request(&self, request: Request) -> Result<Option<String>, RuntimeError> {
        let (responder, reply) = oneshot::channel();
        self.commands
            .send(RuntimeCommand { request, responder })
            .await
            .map_err(|_| RuntimeError::Closed)?;
        reply.await.map_err(|_| RuntimeError::Closed)?
    }
}

#[async_trait]
impl InterpreterRuntime for ProcessRuntime {
    async fn run(&self, code: &str) -> Result<Option<String>, RuntimeError> {
        self.request(Request::Run {
            code: code.to_string(),
        })
        .await
    }

    async fn load_package(&self, name: &str) -> Result<(), RuntimeError> {
        self.request(Request::LoadPackage {
            name: name.to_string(),
        })
        .await
        .map(|_| ())
    }

    fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Owns the interpreter process and forwards requests to it one at a time
///
/// A requester that stops waiting only loses its reply; the interpreter keeps
/// working on the request and the next one queues behind it.
async fn serve(
    mut child: Child,
    mut stdin: ChildStdin,
    mut replies: Lines<BufReader<ChildStdout>>,
    mut commands: mpsc::Receiver<RuntimeCommand>,
) {
    let mut next_id = 0u64;

    while let Some(RuntimeCommand { request, responder }) = commands.recv().await {
        next_id += 1;
        let outcome = exchange(&mut stdin, &mut replies, next_id, &request).await;
        let closed = matches!(outcome, Err(RuntimeError::Closed));

        if responder.send(outcome).is_err() {
            log::debug!("Runtime reply {next_id} discarded, requester went away");
        }
        if closed {
            log::error!("Interpreter runtime exited unexpectedly");
            break;
        }
    }

    commands.close();
    if let Err(e) = child.start_kill() {
        log::debug!("Runtime process already gone: {e}");
    }
    log::info!("Interpreter runtime shut down");
}

async fn exchange(
    stdin: &mut ChildStdin,
    replies: &mut Lines<BufReader<ChildStdout>>,
    id: u64,
    request: &Request,
) -> Result<Option<String>, RuntimeError> {
    let mut line = serde_json::to_string(&Envelope { id, request })
        .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|_| RuntimeError::Closed)?;
    stdin.flush().await.map_err(|_| RuntimeError::Closed)?;

    loop {
        let raw = replies
            .next_line()
            .await
            .map_err(|_| RuntimeError::Closed)?
            .ok_or(RuntimeError::Closed)?;
        let reply: Reply = serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::Protocol(format!("{e}: {raw}")))?;

        if reply.id != Some(id) {
            log::debug!("Skipping stale runtime reply {:?}", reply.id);
            continue;
        }
        return if reply.ok {
            Ok(reply.value)
        } else {
            Err(RuntimeError::Raised(reply.error.unwrap_or_default()))
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bootstrap_carries_marker() {
        assert!(BOOTSTRAP_SOURCE.starts_with(BOOTSTRAP_MARKER));
    }

    #[test]
    fn test_request_wire_format() {
        let request = Request::LoadPackage {
            name: "numpy".to_string(),
        };
        let line = serde_json::to_string(&Envelope {
            id: 7,
            request: &request,
        })
        .unwrap();
        assert_eq!(line, r#"{"id":7,"op":"load_package","name":"numpy"}"#);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_unavailable() {
        let staging = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(Duration::from_secs(5)).with_staging_dir(staging.path());
        let base = RuntimeLocation::resolve(Some("/nonexistent/prefix"), Path::new("/"));

        let err = backend.inject_loader(&base).await.unwrap_err();
        assert_eq!(
            err,
            LoadError::LoaderUnavailable {
                location: "/nonexistent/prefix/bin/python3".to_string(),
                reason: "no interpreter executable found".to_string(),
            }
        );
        assert!(!backend.loader_present());
    }

    #[tokio::test]
    async fn test_staging_writes_bootstrap_once() {
        let prefix = tempfile::tempdir().unwrap();
        let bin = prefix.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let entry = bin.join("python3");
        fs::write(&entry, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&entry, fs::Permissions::from_mode(0o755)).unwrap();

        let staging = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(Duration::from_secs(5)).with_staging_dir(staging.path());
        let base = RuntimeLocation::resolve(prefix.path().to_str(), Path::new("/"));

        backend.inject_loader(&base).await.unwrap();
        assert!(backend.loader_present());
        let staged = fs::read_to_string(staging.path().join(BOOTSTRAP_FILE)).unwrap();
        assert_eq!(staged, BOOTSTRAP_SOURCE);
    }

    #[tokio::test]
    async fn test_failed_start_clears_staged_loader() {
        let prefix = tempfile::tempdir().unwrap();
        let bin = prefix.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let entry = bin.join("python3");
        // Exits without ever printing a handshake
        fs::write(&entry, "#!/bin/sh\nexit 3\n").unwrap();
        fs::set_permissions(&entry, fs::Permissions::from_mode(0o755)).unwrap();

        let staging = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(Duration::from_secs(5)).with_staging_dir(staging.path());
        let base = RuntimeLocation::resolve(prefix.path().to_str(), Path::new("/"));

        backend.inject_loader(&base).await.unwrap();
        let err = backend.instantiate(&base).await.err().unwrap();
        assert!(matches!(err, LoadError::Startup(_)));
        assert!(!backend.loader_present());
    }
}
