use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::dispatcher::CodeExecutor;
use crate::execution::{ExecutionResult, Language};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    /// Waiting for the interpreter runtime to load
    Loading,
    Running,
}

/// Identifies one start of a run; only the latest one is current
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a UI shows for the controller
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub phase: RunPhase,
    pub result: Option<ExecutionResult>,
}

struct RunState {
    latest: RunId,
    phase: RunPhase,
    result: Option<ExecutionResult>,
    timer: Option<AbortHandle>,
    task: Option<AbortHandle>,
}

impl RunState {
    fn advance(&mut self) -> RunId {
        self.latest = RunId(self.latest.0 + 1);
        self.latest
    }

    /// Moves to idle, disarming the timer and killing a hard-cancellable task
    fn settle(&mut self, result: ExecutionResult) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.phase = RunPhase::Idle;
        self.result = Some(result);
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.latest,
            phase: self.phase,
            result: self.result.clone(),
        }
    }
}

struct Inner {
    executor: Arc<dyn CodeExecutor>,
    timeout: Duration,
    state: Mutex<RunState>,
    updates: watch::Sender<RunSnapshot>,
}

/// Runs one snippet at a time with a timeout and cooperative stop
///
/// Every start issues a new run id. Completions, load failures and timer
/// expirations carry the id they were started with and are dropped once it is
/// no longer the latest. Script-language runs are also killed on stop and
/// timeout; interpreted runs keep going in the runtime and their late result
/// is ignored.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

impl RunController {
    pub fn new(executor: Arc<dyn CodeExecutor>, timeout: Duration) -> Self {
        let state = RunState {
            latest: RunId(0),
            phase: RunPhase::Idle,
            result: None,
            timer: None,
            task: None,
        };
        let (updates, _) = watch::channel(state.snapshot());

        Self {
            inner: Arc::new(Inner {
                executor,
                timeout,
                state: Mutex::new(state),
                updates,
            }),
        }
    }

    /// Starts a run; returns `None` if one is in progress or the language cannot run
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, declared_language: &str, source: impl Into<String>) -> Option<RunId> {
        let Some(language) = Language::from_declared(declared_language) else {
            log::debug!("Language {declared_language:?} does not support execution");
            return None;
        };
        let source = source.into();

        let mut state = self.inner.state.lock();
        if state.phase != RunPhase::Idle {
            log::debug!("Run {} still in progress, start ignored", state.latest);
            return None;
        }

        let run_id = state.advance();
        let needs_loading = language.is_interpreted() && !self.inner.executor.is_runtime_warm();
        state.result = None;
        state.phase = if needs_loading {
            RunPhase::Loading
        } else {
            RunPhase::Running
        };

        let inner = self.inner.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.timeout).await;
            inner.expire(run_id);
        });
        state.timer = Some(timer.abort_handle());

        let task = tokio::spawn(self.inner.clone().drive(run_id, language, source, needs_loading));
        state.task = language.supports_hard_cancel().then(|| task.abort_handle());

        log::info!("Run {run_id} started ({language})");
        self.inner.publish(&state);
        Some(run_id)
    }

    /// Cancels the current run; returns `false` if nothing was running
    pub fn stop(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.phase == RunPhase::Idle {
            return false;
        }

        let stopped = state.latest;
        state.advance();
        state.settle(ExecutionResult::stopped());
        log::info!("Run {stopped} stopped");
        self.inner.publish(&state);
        true
    }

    pub fn phase(&self) -> RunPhase {
        self.inner.state.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() != RunPhase::Idle
    }

    /// The result currently on display, if any
    pub fn result(&self) -> Option<ExecutionResult> {
        self.inner.state.lock().result.clone()
    }

    pub fn latest_run(&self) -> RunId {
        self.inner.state.lock().latest
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.inner.state.lock().snapshot()
    }

    /// Subscribes to every visible state change
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.inner.updates.subscribe()
    }
}

impl Inner {
    fn publish(&self, state: &RunState) {
        self.updates.send_replace(state.snapshot());
    }

    async fn drive(self: Arc<Self>, run_id: RunId, language: Language, source: String, needs_loading: bool) {
        if needs_loading {
            if let Err(e) = self.executor.prepare(language).await {
                self.complete(run_id, ExecutionResult::failure(e.to_string()));
                return;
            }
            if !self.enter_running(run_id) {
                return;
            }
        }

        let started = Instant::now();
        let result = self.executor.execute(language, &source).await;
        self.complete(run_id, result.with_duration(started.elapsed()));
    }

    fn enter_running(&self, run_id: RunId) -> bool {
        let mut state = self.state.lock();
        if state.latest != run_id {
            log::debug!("Run {run_id} was superseded while loading");
            return false;
        }
        state.phase = RunPhase::Running;
        self.publish(&state);
        true
    }

    fn complete(&self, run_id: RunId, result: ExecutionResult) -> bool {
        let mut state = self.state.lock();
        if state.latest != run_id {
            log::debug!("Discarding result of superseded run {run_id}");
            return false;
        }

        // The finishing task is this one; it must not abort itself
        state.task = None;
        state.settle(result);
        log::info!("Run {run_id} finished");
        self.publish(&state);
        true
    }

    fn expire(&self, run_id: RunId) {
        let mut state = self.state.lock();
        if state.latest != run_id {
            return;
        }

        state.advance();
        // The firing timer is this task
        state.timer = None;
        state.settle(ExecutionResult::timed_out(self.timeout));
        log::warn!("Run {run_id} timed out after {:?}", self.timeout);
        self.publish(&state);
    }
}
