//! # kiln-runtime
//!
//! Owns one instance of every Kiln component and wires them together:
//!
//! ```text
//! HardwareMonitor ──► AdaptiveController ──► ComputeDispatcher
//!                                 │
//! ModelLoaderRegistry ──► ModelRegistry ──► InferenceRouter ──► caller
//! ```
//!
//! There are no process-wide singletons; pass the [`Runtime`] (or clones of
//! its components) to whatever needs them.
//!
//! ```rust,ignore
//! use kiln_runtime::{RuntimeBuilder, RuntimeConfig};
//!
//! let config = RuntimeConfig::load(Some("kiln.toml".as_ref()))?;
//! let runtime = RuntimeBuilder::new().with_config(config).build()?;
//! runtime.start()?;
//! let handle = runtime.registry().load("models/llama.gguf", Default::default()).await?;
//! let result = runtime.router().generate(handle.id(), "Hello", Default::default()).await?;
//! runtime.shutdown().await?;
//! ```

pub mod builder;
pub mod config;

pub use builder::RuntimeBuilder;
pub use config::RuntimeConfig;

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use kiln_foundation::{
    AdaptiveController, ComputeDispatcher, HardwareMonitor, InferenceRouter, ModelLoaderRegistry,
    ModelRegistry,
};
use kiln_kernel::hardware::HardwareProfile;
use kiln_kernel::{KernelError, KernelResult};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The assembled runtime
pub struct Runtime {
    config: RuntimeConfig,
    profile: Arc<HardwareProfile>,
    monitor: HardwareMonitor,
    dispatcher: Arc<ComputeDispatcher>,
    loaders: Arc<ModelLoaderRegistry>,
    registry: ModelRegistry,
    router: InferenceRouter,
    controller: Arc<AdaptiveController>,
    background: Mutex<Option<Background>>,
}

struct Background {
    cancel: CancellationToken,
    sweeper: Option<JoinHandle<()>>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        config: RuntimeConfig,
        profile: Arc<HardwareProfile>,
        monitor: HardwareMonitor,
        dispatcher: Arc<ComputeDispatcher>,
        loaders: Arc<ModelLoaderRegistry>,
        registry: ModelRegistry,
        router: InferenceRouter,
        controller: Arc<AdaptiveController>,
    ) -> Self {
        Self {
            config,
            profile,
            monitor,
            dispatcher,
            loaders,
            registry,
            router,
            controller,
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn monitor(&self) -> &HardwareMonitor {
        &self.monitor
    }

    pub fn dispatcher(&self) -> &Arc<ComputeDispatcher> {
        &self.dispatcher
    }

    pub fn loaders(&self) -> &Arc<ModelLoaderRegistry> {
        &self.loaders
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn router(&self) -> &InferenceRouter {
        &self.router
    }

    pub fn controller(&self) -> &Arc<AdaptiveController> {
        &self.controller
    }

    /// Start the monitor loop and, when an idle timeout is configured, the
    /// idle-eviction sweeper. Calling it twice is a no-op. After
    /// [`shutdown`](Self::shutdown) it re-attaches the adaptive controller.
    pub fn start(&self) -> KernelResult<()> {
        let mut background = self.background.lock();
        if background.is_some() {
            return Ok(());
        }
        self.controller.subscribe_to(&self.monitor);
        self.monitor
            .start()
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("starting hardware monitor")?;

        let cancel = CancellationToken::new();
        let sweeper = self.registry.spawn_idle_sweeper(cancel.child_token());
        *background = Some(Background { cancel, sweeper });
        info!("runtime started");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Stop background work and unload every model.
    ///
    /// Models still generating get the registry's unload grace period.
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned.
    pub async fn shutdown(&self) -> KernelResult<()> {
        let background = self.background.lock().take();
        self.controller.detach(&self.monitor);

        if let Some(Background { cancel, sweeper }) = background {
            cancel.cancel();
            if let Some(sweeper) = sweeper {
                if let Err(e) = sweeper.await {
                    warn!(error = %e, "idle sweeper task failed");
                }
            }
        }
        self.controller.settle().await;

        let mut first_error = self
            .monitor
            .stop()
            .await
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach("stopping hardware monitor")
            .err();

        for info in self.registry.list() {
            if let Err(e) = self.registry.unload(&info.id, true).await {
                warn!(model_id = %info.id, error = %e, "failed to unload model during shutdown");
                if first_error.is_none() {
                    first_error = Some(
                        Report::new(KernelError::from(e))
                            .attach(format!("unloading {} during shutdown", info.id)),
                    );
                }
            }
        }

        match first_error {
            Some(report) => Err(report),
            None => {
                info!("runtime shut down");
                Ok(())
            }
        }
    }
}
