//! Runtime configuration
//!
//! One file (TOML, YAML or JSON, picked by extension) layered under
//! `KILN__SECTION__KEY` environment variables. `${VAR}` references inside
//! the file are substituted before parsing. Every section has complete
//! defaults, so an empty file or no file at all is a valid configuration.

use std::path::Path;

use error_stack::{Report, ResultExt};
use kiln_foundation::hardware::ProfileOverrides;
use kiln_foundation::{ControllerConfig, DispatchConfig, MonitorConfig, RegistryConfig, RouterConfig};
use kiln_kernel::config::load_with_env;
use kiln_kernel::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "KILN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Corrections applied on top of hardware detection
    pub hardware: ProfileOverrides,
    pub monitor: MonitorConfig,
    pub dispatch: DispatchConfig,
    pub registry: RegistryConfig,
    pub router: RouterConfig,
    pub controller: ControllerConfig,
}

impl RuntimeConfig {
    /// Load from `path` (if any) plus environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> KernelResult<Self> {
        let source = match path {
            Some(path) => format!("loading runtime config from {}", path.display()),
            None => "loading runtime config from the environment".to_string(),
        };
        let config: Self = load_with_env(path, ENV_PREFIX)
            .map_err(KernelError::from)
            .map_err(Report::new)
            .attach(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KernelResult<()> {
        check("monitor", self.monitor.validate())?;
        check("dispatch", self.dispatch.validate())?;
        check("registry", self.registry.validate())?;
        check("router", self.router.validate())?;
        check("controller", self.controller.validate())?;
        Ok(())
    }
}

fn check(section: &'static str, result: Result<(), &'static str>) -> KernelResult<()> {
    result
        .map_err(|reason| Report::new(KernelError::InvalidConfig(format!("{section}: {reason}"))))
        .attach("validating runtime config")
}
