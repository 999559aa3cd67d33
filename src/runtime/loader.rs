use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::LoadError;

use super::{ProcessBackend, RuntimeBackend, RuntimeHandle, RuntimeLocation};

type PendingLoad = Shared<BoxFuture<'static, Result<RuntimeHandle, LoadError>>>;

/// Lifecycle of the process-wide runtime
enum Slot {
    Absent,
    Loading { generation: u64, load: PendingLoad },
    Loaded(RuntimeHandle),
}

static GLOBAL_LOADER: OnceLock<Arc<RuntimeLoader>> = OnceLock::new();

/// Lazily loads the interpreter runtime once and hands out the cached handle
///
/// Concurrent callers that arrive while a load is in flight await that same
/// load. A failed load leaves the loader empty so the next call starts over.
pub struct RuntimeLoader {
    backend: Arc<dyn RuntimeBackend>,
    config: RuntimeConfig,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

impl RuntimeLoader {
    pub fn new(backend: Arc<dyn RuntimeBackend>, config: &RuntimeConfig) -> Self {
        Self {
            backend,
            config: config.clone(),
            slot: Mutex::new(Slot::Absent),
            generation: AtomicU64::new(0),
        }
    }

    /// The loader shared by the whole process
    ///
    /// The first caller's configuration wins; later configurations are ignored.
    pub fn global(config: &RuntimeConfig) -> Arc<Self> {
        GLOBAL_LOADER
            .get_or_init(|| {
                let backend = ProcessBackend::new(config.startup_timeout_ms.into());
                Arc::new(Self::new(Arc::new(backend), config))
            })
            .clone()
    }

    /// Whether a runtime handle is already cached
    pub fn is_loaded(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Loaded(handle) if handle.is_alive())
    }

    /// Returns the cached runtime, loading it first if needed
    pub async fn acquire(&self) -> Result<RuntimeHandle, LoadError> {
        let (generation, load) = {
            let mut slot = self.slot.lock();
            let in_flight = match &*slot {
                Slot::Loaded(handle) if handle.is_alive() => return Ok(handle.clone()),
                Slot::Loaded(_) => {
                    log::warn!("Cached interpreter runtime is gone, loading a new one");
                    None
                }
                // A failure nobody was left to collect must not be handed out again
                Slot::Loading { load, .. } if matches!(load.peek(), Some(Err(_))) => None,
                Slot::Loading { generation, load } => Some((*generation, load.clone())),
                Slot::Absent => None,
            };
            match in_flight {
                Some(pending) => pending,
                None => self.begin_load(&mut slot),
            }
        };

        let outcome = load.await;

        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Loading { generation: g, .. } if *g == generation) {
            *slot = match &outcome {
                Ok(handle) => Slot::Loaded(handle.clone()),
                Err(e) => {
                    log::error!("Interpreter runtime failed to load: {e}");
                    Slot::Absent
                }
            };
        }
        outcome
    }

    fn begin_load(&self, slot: &mut Slot) -> (u64, PendingLoad) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let origin = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let base = RuntimeLocation::resolve(self.config.base_override().as_deref(), &origin);
        let load = load_runtime(
            self.backend.clone(),
            base,
            self.config.optional_packages.clone(),
        )
        .boxed()
        .shared();

        *slot = Slot::Loading {
            generation,
            load: load.clone(),
        };
        (generation, load)
    }
}

async fn load_runtime(
    backend: Arc<dyn RuntimeBackend>,
    configured: RuntimeLocation,
    optional_packages: Vec<String>,
) -> Result<RuntimeHandle, LoadError> {
    let mut resolved = configured;
    if let Err(err) = ensure_loader(backend.as_ref(), &resolved).await {
        if resolved.is_default() {
            return Err(err);
        }
        let fallback = RuntimeLocation::default_base();
        log::warn!("{err}; retrying with {fallback}");
        resolved = fallback;
        ensure_loader(backend.as_ref(), &resolved).await?;
    }

    if !backend.loader_present() {
        return Err(LoadError::EntryMissing);
    }

    log::info!("Starting interpreter runtime from {resolved}");
    let runtime = backend.instantiate(&resolved).await?;

    for package in &optional_packages {
        match runtime.load_package(package).await {
            Ok(()) => log::debug!("Optional runtime package \"{package}\" loaded"),
            Err(e) => log::warn!("Optional runtime package \"{package}\" failed to load: {e}"),
        }
    }

    log::info!("Interpreter runtime ready");
    Ok(runtime)
}

/// Stages the loader unless one is already present
async fn ensure_loader(
    backend: &dyn RuntimeBackend,
    base: &RuntimeLocation,
) -> Result<(), LoadError> {
    if backend.loader_present() {
        log::debug!("Runtime loader already present, skipping injection");
        return Ok(());
    }
    backend.inject_loader(base).await
}
