//! Command implementations

pub mod chat;
pub mod generate;
pub mod info;
pub mod models;
pub mod monitor;

use std::path::Path;

use kiln_foundation::{LoadOptions, ModelHandle};
use kiln_kernel::engine::GenerationConfig;
use kiln_runtime::{Runtime, RuntimeBuilder, RuntimeConfig};

use crate::cli::RunArgs;

pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    RuntimeConfig::load(path).map_err(|report| anyhow::anyhow!("{report:?}"))
}

pub(crate) fn build_runtime(config: RuntimeConfig) -> anyhow::Result<Runtime> {
    RuntimeBuilder::new()
        .with_config(config)
        .build()
        .map_err(|report| anyhow::anyhow!("{report:?}"))
}

/// Build a runtime and load `model` into it.
pub(crate) async fn runtime_with_model(
    config: Option<&Path>,
    model: &Path,
    run: &RunArgs,
) -> anyhow::Result<(Runtime, ModelHandle)> {
    let runtime = build_runtime(load_config(config)?)?;
    let mut options = LoadOptions::new().with_backend(run.backend);
    if let Some(id) = &run.id {
        options = options.with_id(id.clone());
    }
    let handle = runtime.registry().load(model, options).await?;
    Ok((runtime, handle))
}

pub(crate) fn generation_config(run: &RunArgs) -> GenerationConfig {
    let config = GenerationConfig::default().with_temperature(run.temperature);
    match run.max_tokens {
        Some(max) => config.with_max_tokens(max),
        None => config,
    }
}

pub(crate) async fn shutdown(runtime: Runtime) -> anyhow::Result<()> {
    runtime
        .shutdown()
        .await
        .map_err(|report| anyhow::anyhow!("{report:?}"))
}
