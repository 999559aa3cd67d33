use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::LoadError;
use crate::execution::{ExecutionRequest, ExecutionResult, Language};
use crate::interpreter;
use crate::runtime::RuntimeLoader;
use crate::sandbox::ScriptRunner;

/// The seam callers execute code through
///
/// `execute` never fails: every outcome, including runtime load failures, is
/// an `ExecutionResult`. `prepare` is the one operation that reports a load
/// failure as such.
#[async_trait]
pub trait CodeExecutor: Send + Sync + 'static {
    async fn execute(&self, language: Language, source_text: &str) -> ExecutionResult;

    /// Makes sure whatever `language` needs is loaded
    async fn prepare(&self, language: Language) -> Result<(), LoadError>;

    /// Whether the interpreter runtime is already loaded
    fn is_runtime_warm(&self) -> bool;
}

/// Routes snippets to the sandboxed script runner or the interpreter runtime
pub struct Dispatcher {
    loader: Arc<RuntimeLoader>,
    scripts: ScriptRunner,
}

impl Dispatcher {
    pub fn new(loader: Arc<RuntimeLoader>, scripts: ScriptRunner) -> Self {
        Self { loader, scripts }
    }

    /// Builds a dispatcher backed by the process-wide runtime loader
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RuntimeLoader::global(&config.runtime),
            ScriptRunner::new(&config.script),
        )
    }

    /// Starts loading the interpreter runtime in the background
    pub fn prewarm(&self) -> JoinHandle<()> {
        let loader = self.loader.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.acquire().await {
                log::warn!("Runtime pre-warm failed: {e}");
            }
        })
    }

    pub async fn execute_request(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.execute(request.language, &request.source_text).await
    }
}

#[async_trait]
impl CodeExecutor for Dispatcher {
    async fn execute(&self, language: Language, source_text: &str) -> ExecutionResult {
        if !language.is_interpreted() {
            return self.scripts.run(source_text).await;
        }

        match self.loader.acquire().await {
            Ok(runtime) => interpreter::run(runtime.as_ref(), source_text).await,
            Err(e) => ExecutionResult::failure(e.to_string()),
        }
    }

    async fn prepare(&self, language: Language) -> Result<(), LoadError> {
        if language.is_interpreted() {
            self.loader.acquire().await?;
        }
        Ok(())
    }

    fn is_runtime_warm(&self) -> bool {
        self.loader.is_loaded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, ScriptConfig};
    use crate::error::RuntimeError;
    use crate::runtime::{InterpreterRuntime, RuntimeBackend, RuntimeHandle, RuntimeLocation};

    use pretty_assertions::assert_eq;

    struct EchoRuntime;

    #[async_trait]
    impl InterpreterRuntime for EchoRuntime {
        async fn run(&self, _code: &str) -> Result<Option<String>, RuntimeError> {
            Ok(Some(r#"{"output": "from runtime\n", "error": null}"#.to_string()))
        }

        async fn load_package(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    struct StaticBackend {
        available: bool,
    }

    #[async_trait]
    impl RuntimeBackend for StaticBackend {
        fn loader_present(&self) -> bool {
            self.available
        }

        async fn inject_loader(&self, base: &RuntimeLocation) -> Result<(), LoadError> {
            Err(LoadError::LoaderUnavailable {
                location: base.to_string(),
                reason: "offline".to_string(),
            })
        }

        async fn instantiate(&self, _base: &RuntimeLocation) -> Result<RuntimeHandle, LoadError> {
            Ok(Arc::new(EchoRuntime) as RuntimeHandle)
        }
    }

    fn dispatcher(available: bool, script_command: &[&str]) -> Dispatcher {
        let runtime_config = RuntimeConfig {
            base: Some("/usr/".to_string()),
            optional_packages: Vec::new(),
            ..Default::default()
        };
        let loader = RuntimeLoader::new(Arc::new(StaticBackend { available }), &runtime_config);
        let scripts = ScriptRunner::new(&ScriptConfig {
            command: script_command.iter().map(|s| s.to_string()).collect(),
        });
        Dispatcher::new(Arc::new(loader), scripts)
    }

    #[tokio::test]
    async fn test_interpreted_language_goes_through_runtime() {
        let dispatcher = dispatcher(true, &[]);
        assert!(!dispatcher.is_runtime_warm());

        let result = dispatcher.execute(Language::Python, "print('x')").await;
        assert_eq!(result.output, "from runtime\n");
        assert_eq!(result.error, None);
        assert!(dispatcher.is_runtime_warm());
    }

    #[tokio::test]
    async fn test_script_language_goes_through_sandbox() {
        // An empty script command proves the runtime was never consulted
        let dispatcher = dispatcher(true, &[]);
        let result = dispatcher
            .execute_request(&ExecutionRequest {
                language: Language::JavaScript,
                source_text: "console.log(1)".to_string(),
            })
            .await;
        assert_eq!(result.error.as_deref(), Some("Empty script command"));
        assert!(!dispatcher.is_runtime_warm());
    }

    #[tokio::test]
    async fn test_load_failure_is_a_result_but_prepare_reports_it() {
        let dispatcher = dispatcher(false, &[]);

        let result = dispatcher.execute(Language::Python, "1").await;
        assert_eq!(result.output, "");
        assert!(result.error.unwrap().contains("offline"));

        let err = dispatcher.prepare(Language::Python).await.unwrap_err();
        assert!(matches!(err, LoadError::LoaderUnavailable { .. }));
        assert!(dispatcher.prepare(Language::JavaScript).await.is_ok());
    }

    #[tokio::test]
    async fn test_prewarm_loads_runtime() {
        let dispatcher = dispatcher(true, &[]);
        dispatcher.prewarm().await.unwrap();
        assert!(dispatcher.is_runtime_warm());
    }
}
