//! # kiln-foundation
//!
//! Concrete building blocks of the Kiln runtime: hardware detection and
//! sampling, backend dispatch, per-format model loaders, the model registry,
//! request routing and the adaptive controller that ties them to live device
//! health.

// hardware detection and sensors
pub mod hardware;

// monitor module - background sampling and tier events
pub mod monitor;

// dispatch module - backend selection
pub mod dispatch;

// engine bindings per backend
pub mod engine;

// model file loaders
pub mod loader;

// registry module - loaded model ownership and eviction
pub mod registry;

// router module - generate, streaming and chat
pub mod router;

// controller module - reacts to monitor events
pub mod controller;

pub use controller::{AdaptiveController, AxisLevel, ControllerConfig};
pub use dispatch::{ComputeDispatcher, DispatchConfig};
pub use engine::{EngineSet, ReferenceEngine};
pub use loader::ModelLoaderRegistry;
pub use monitor::{HardwareMonitor, MonitorConfig};
pub use registry::{LoadOptions, ModelHandle, ModelRegistry, RegistryConfig};
pub use router::{InferenceRouter, RouterConfig};
