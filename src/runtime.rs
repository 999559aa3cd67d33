mod loader;
mod location;
mod process;

pub use loader::RuntimeLoader;
pub use location::RuntimeLocation;
pub use process::{LOADER_ENTRY, ProcessBackend};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{LoadError, RuntimeError};

/// Shared reference to the loaded interpreter
pub type RuntimeHandle = Arc<dyn InterpreterRuntime>;

/// A loaded interpreter that evaluates source text
#[async_trait]
pub trait InterpreterRuntime: Send + Sync {
    /// Executes `code` and returns the text of its trailing expression, if any
    async fn run(&self, code: &str) -> Result<Option<String>, RuntimeError>;

    /// Makes the named package importable inside the runtime
    async fn load_package(&self, name: &str) -> Result<(), RuntimeError>;

    /// Whether the runtime can still accept requests
    fn is_alive(&self) -> bool {
        true
    }
}

/// Where and how the interpreter gets fetched and started
///
/// The loader drives this in two stages: the loader entry is made available
/// for a base location, then the runtime is started from it.
#[async_trait]
pub trait RuntimeBackend: Send + Sync + 'static {
    /// Whether a usable loader is already present in this process
    fn loader_present(&self) -> bool;

    /// Fetches and stages the loader entry found under `base`
    async fn inject_loader(&self, base: &RuntimeLocation) -> Result<(), LoadError>;

    /// Starts a runtime using the staged loader
    async fn instantiate(&self, base: &RuntimeLocation) -> Result<RuntimeHandle, LoadError>;
}
