//! Fluent assembly of a [`Runtime`].

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use kiln_foundation::hardware::{SystemSensors, detect_profile};
use kiln_foundation::{
    AdaptiveController, ComputeDispatcher, EngineSet, HardwareMonitor, InferenceRouter,
    ModelLoaderRegistry, ModelRegistry,
};
use kiln_kernel::hardware::{HardwareProfile, SensorSource};
use kiln_kernel::loader::ModelLoader;
use kiln_kernel::{KernelError, KernelResult};
use tracing::info;

use crate::Runtime;
use crate::config::RuntimeConfig;

/// Builder for [`Runtime`]
///
/// Anything not supplied is detected or defaulted: the profile comes from
/// [`detect_profile`] with the config's overrides applied, sensors read the
/// host, engines are the reference set and loaders are the built-in four.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    profile: Option<HardwareProfile>,
    sensors: Option<Box<dyn SensorSource>>,
    engines: Option<EngineSet>,
    loaders: Vec<Arc<dyn ModelLoader>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a fixed profile instead of detecting one. Overrides from the
    /// config still apply.
    pub fn with_profile(mut self, profile: HardwareProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_sensors(mut self, sensors: Box<dyn SensorSource>) -> Self {
        self.sensors = Some(sensors);
        self
    }

    pub fn with_engines(mut self, engines: EngineSet) -> Self {
        self.engines = Some(engines);
        self
    }

    /// Register an extra loader after the built-in ones.
    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    /// Wire every component together.
    ///
    /// Must be called from within a Tokio runtime so the controller can
    /// schedule evictions.
    pub fn build(self) -> KernelResult<Runtime> {
        let Self {
            config,
            profile,
            sensors,
            engines,
            loaders: extra_loaders,
        } = self;
        config.validate().attach("building runtime")?;

        let profile = config.hardware.apply(profile.unwrap_or_else(detect_profile));
        if profile.total_memory_bytes == 0 {
            return Err(Report::new(KernelError::InvalidConfig(
                "hardware profile reports no memory".to_string(),
            )))
            .attach("building runtime");
        }
        let profile = Arc::new(profile);

        let sensors =
            sensors.unwrap_or_else(|| Box::new(SystemSensors::new(profile.gpu_kind.clone())));
        let monitor = HardwareMonitor::new(config.monitor.clone(), sensors)
            .map_err(|reason| Report::new(KernelError::InvalidConfig(format!("monitor: {reason}"))))
            .attach("building hardware monitor")?;

        let engines = Arc::new(engines.unwrap_or_else(|| EngineSet::reference(None)));
        let dispatcher = Arc::new(ComputeDispatcher::new(
            Arc::clone(&profile),
            engines,
            config.dispatch.clone(),
        ));

        let loaders = Arc::new(ModelLoaderRegistry::with_builtin());
        for loader in extra_loaders {
            loaders.register_loader(loader);
        }

        let registry = ModelRegistry::new(config.registry.clone(), Arc::clone(&loaders), Arc::clone(&dispatcher));
        let router = InferenceRouter::new(registry.clone(), config.router.clone());
        let controller = AdaptiveController::attach(
            config.controller.clone(),
            &monitor,
            Arc::clone(&dispatcher),
            registry.clone(),
            router.advisory().clone(),
        );

        info!(
            accelerator_cores = profile.accelerator_cores,
            gpu_cores = profile.gpu_cores,
            total_memory_bytes = profile.total_memory_bytes,
            "runtime assembled"
        );

        Ok(Runtime::from_parts(
            config, profile, monitor, dispatcher, loaders, registry, router, controller,
        ))
    }
}
