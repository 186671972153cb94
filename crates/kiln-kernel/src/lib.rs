//! # kiln-kernel
//!
//! Contracts shared by every Kiln crate: the hardware and model data model,
//! the error taxonomy, and the traits that loaders, engines and sensors
//! implement. Concrete implementations live in `kiln-foundation`; the kernel
//! never depends on it.

// error module
pub mod error;
pub use error::{KernelError, KernelResult, ModelLoadError, RuntimeError, RuntimeResult, SensorError};

// hardware data model
pub mod hardware;

// backends and dispatch directives
pub mod backend;
pub use backend::{BackendAvailability, ComputeBackend, Directive, DirectiveSource, Workload, WorkloadKind};

// model descriptors and payloads
pub mod model;

// loader contract
pub mod loader;

// engine contract
pub mod engine;

// chat types
pub mod chat;

// config loading helpers
#[cfg(feature = "config")]
pub mod config;
