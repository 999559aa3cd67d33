use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::Deserialize;

use crate::execution::ExecutionResult;
use crate::runtime::InterpreterRuntime;

static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*import[ \t]+([^#\n;]+)").unwrap());
static FROM_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+([A-Za-z_][A-Za-z0-9_]*)[A-Za-z0-9_.]*[ \t]+import\b").unwrap()
});

#[derive(Deserialize)]
struct HarnessReply {
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Executes `source` in `runtime`; never fails, errors land in the result
///
/// The snippet is wrapped in a harness that captures the runtime's standard
/// streams for the duration of the call and reports `{output, error}` back as
/// JSON.
pub async fn run(runtime: &dyn InterpreterRuntime, source: &str) -> ExecutionResult {
    prefetch_imports(runtime, source).await;

    match run_in_harness(runtime, source).await {
        Ok(result) => result,
        Err(e) => {
            log::debug!("Interpreter harness failed: {e:#}");
            ExecutionResult::failure(e.to_string())
        }
    }
}

/// Top-level modules named by `import` statements in `source`, in order of appearance
pub fn imported_packages(source: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for caps in IMPORT_RE.captures_iter(source) {
        let (Some(whole), Some(names)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        for clause in names.as_str().split(',') {
            let module = clause.split_whitespace().next().unwrap_or_default();
            let top = module.split('.').next().unwrap_or_default();
            if is_identifier(top) {
                found.push((whole.start(), top.to_string()));
            }
        }
    }
    for caps in FROM_IMPORT_RE.captures_iter(source) {
        if let (Some(whole), Some(top)) = (caps.get(0), caps.get(1)) {
            found.push((whole.start(), top.as_str().to_string()));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut packages: Vec<String> = Vec::new();
    for (_, name) in found {
        if !packages.contains(&name) {
            packages.push(name);
        }
    }
    packages
}

/// Wraps `source` in the capture harness evaluated by the runtime
pub fn build_harness(source: &str) -> Result<String> {
    let literal = serde_json::to_string(source)?;
    Ok(format!(
        r#"import sys, io, traceback, textwrap, json, warnings
warnings.filterwarnings("ignore")
_buffer = io.StringIO()
_stdout, _stderr = sys.stdout, sys.stderr
sys.stdout = _buffer
sys.stderr = _buffer
_error = None
try:
    exec(textwrap.dedent({literal}), {{"__name__": "__main__"}})
except Exception:
    _error = traceback.format_exc()
finally:
    sys.stdout = _stdout
    sys.stderr = _stderr
json.dumps({{"output": _buffer.getvalue(), "error": _error}})
"#
    ))
}

/// Asks the runtime for every imported package; failures are ignored
async fn prefetch_imports(runtime: &dyn InterpreterRuntime, source: &str) {
    for package in imported_packages(source) {
        if let Err(e) = runtime.load_package(&package).await {
            log::debug!("Import prefetch of \"{package}\" skipped: {e}");
        }
    }
}

async fn run_in_harness(runtime: &dyn InterpreterRuntime, source: &str) -> Result<ExecutionResult> {
    let harness = build_harness(source)?;
    let raw = runtime
        .run(&harness)
        .await?
        .ok_or_else(|| anyhow!("Interpreter harness returned no result"))?;
    let reply: HarnessReply = serde_json::from_str(&raw)?;

    Ok(ExecutionResult::new(
        reply.output.unwrap_or_default(),
        reply.error,
    ))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Replays canned harness replies and records what it was asked
    struct ScriptedRuntime {
        reply: Result<Option<String>, RuntimeError>,
        missing: Vec<&'static str>,
        requested: Mutex<Vec<String>>,
        harnesses: Mutex<Vec<String>>,
    }

    impl ScriptedRuntime {
        fn replying(reply: Result<Option<String>, RuntimeError>) -> Self {
            Self {
                reply,
                missing: Vec::new(),
                requested: Mutex::new(Vec::new()),
                harnesses: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InterpreterRuntime for ScriptedRuntime {
        async fn run(&self, code: &str) -> Result<Option<String>, RuntimeError> {
            self.harnesses.lock().push(code.to_string());
            self.reply.clone()
        }

        async fn load_package(&self, name: &str) -> Result<(), RuntimeError> {
            self.requested.lock().push(name.to_string());
            if self.missing.iter().any(|m| *m == name) {
                return Err(RuntimeError::Raised(format!("No module named '{name}'")));
            }
            Ok(())
        }
    }

    #[test]
    fn test_imported_packages() {
        let source = "\
import numpy as np, os.path
from pandas.io import json
from . import sibling
    import re  # indented import inside a block
x = 'import nothing'
import numpy
";
        assert_eq!(imported_packages(source), vec!["numpy", "os", "pandas", "re"]);
        assert!(imported_packages("print('hi')").is_empty());
    }

    #[test]
    fn test_harness_embeds_source_as_literal() {
        let harness = build_harness("print(\"a\")\n\tx = '''\n'''").unwrap();
        assert!(harness.contains(r#"textwrap.dedent("print(\"a\")\n\tx = '''\n'''")"#));
        assert!(harness.contains("finally:\n    sys.stdout = _stdout"));
        assert!(harness.trim_end().ends_with(r#"json.dumps({"output": _buffer.getvalue(), "error": _error})"#));
    }

    #[tokio::test]
    async fn test_reply_is_translated_into_result() {
        let runtime = ScriptedRuntime::replying(Ok(Some(
            r#"{"output": "Hello\n", "error": null}"#.to_string(),
        )));
        let result = run(&runtime, "print(\"Hello\")").await;
        assert_eq!(result.output, "Hello\n");
        assert_eq!(result.error, None);
        assert!(!result.timestamp.is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_failures_do_not_block_execution() {
        let mut runtime = ScriptedRuntime::replying(Ok(Some(
            r#"{"output": "", "error": "Traceback ...\nModuleNotFoundError: No module named 'nope'\n"}"#
                .to_string(),
        )));
        runtime.missing = vec!["nope"];

        let result = run(&runtime, "import nope\nimport math").await;
        assert_eq!(*runtime.requested.lock(), vec!["nope", "math"]);
        assert_eq!(runtime.harnesses.lock().len(), 1);
        assert!(result.error.unwrap().contains("ModuleNotFoundError"));
    }

    #[tokio::test]
    async fn test_runtime_failure_becomes_error_result() {
        let runtime = ScriptedRuntime::replying(Err(RuntimeError::Closed));
        let result = run(&runtime, "1 + 1").await;
        assert_eq!(result.output, "");
        assert_eq!(result.error.as_deref(), Some("Runtime is no longer running"));
    }

    #[tokio::test]
    async fn test_unparsable_reply_becomes_error_result() {
        let runtime = ScriptedRuntime::replying(Ok(Some("not json".to_string())));
        let result = run(&runtime, "1 + 1").await;
        assert_eq!(result.output, "");
        assert!(result.error.is_some());

        let runtime = ScriptedRuntime::replying(Ok(None));
        let result = run(&runtime, "1 + 1").await;
        assert_eq!(
            result.error.as_deref(),
            Some("Interpreter harness returned no result")
        );
    }
}
