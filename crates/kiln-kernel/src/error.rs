//! Error taxonomy for the Kiln runtime.
//!
//! Request-level operations return [`RuntimeError`], a plain `thiserror` enum
//! callers can match on. Startup and assembly paths return
//! [`KernelResult`], an [`error_stack::Report`] that carries attached context
//! as it propagates.
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//! use kiln_kernel::error::{KernelError, KernelResult};
//!
//! fn read_profile() -> KernelResult<String> {
//!     std::fs::read_to_string("profile.json")
//!         .map_err(KernelError::from)
//!         .map_err(error_stack::Report::new)
//!         .attach("reading cached hardware profile")
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::ComputeBackend;

/// Failures while turning a file on disk into a loaded model.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelLoadError {
    /// No registered loader recognised the file.
    #[error("unknown model format: {path}")]
    UnknownFormat { path: PathBuf },

    /// A structural check failed. `check` names which one.
    #[error("corrupt model file {path}: {check} check failed: {detail}")]
    CorruptFile {
        path: PathBuf,
        check: &'static str,
        detail: String,
    },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("insufficient memory: model needs {required_bytes} bytes, {available_bytes} available")]
    InsufficientMemory {
        required_bytes: u64,
        available_bytes: u64,
    },

    /// Transient I/O failure (file vanished, permission flapped, ...).
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ModelLoadError {
    pub fn corrupt(path: impl Into<PathBuf>, check: &'static str, detail: impl Into<String>) -> Self {
        Self::CorruptFile {
            path: path.into(),
            check,
            detail: detail.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same load could succeed without changing the file.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::InsufficientMemory { .. })
    }
}

/// A single sensor counter could not be read.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SensorError {
    #[error("sensor '{0}' is not supported on this platform")]
    Unsupported(&'static str),

    #[error("sensor '{sensor}' read failed: {reason}")]
    ReadFailed { sensor: &'static str, reason: String },
}

impl SensorError {
    pub fn read_failed(sensor: &'static str, reason: impl Into<String>) -> Self {
        Self::ReadFailed {
            sensor,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by runtime operations (load, unload, generate, monitor control).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// A requested sensor or counter cannot be read.
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(#[from] SensorError),

    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        backend: ComputeBackend,
        reason: String,
    },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    /// The model's generation lock is held by another request.
    #[error("model '{model_id}' is busy with another generation")]
    InferenceBusy { model_id: String },

    #[error("generation on '{model_id}' was cancelled")]
    InferenceCancelled { model_id: String },

    /// The monitor loop produced no sample within twice its interval.
    #[error("hardware monitor stalled: no sample for {elapsed:?} (interval {interval:?})")]
    MonitorStalled { elapsed: Duration, interval: Duration },

    /// The monitor loop did not exit within the join timeout.
    #[error("hardware monitor did not stop within {0:?}")]
    MonitorJoinTimeout(Duration),

    /// The monitor loop ended abnormally, e.g. by panicking.
    #[error("hardware monitor task failed: {0}")]
    MonitorFailed(String),

    #[error("engine '{engine}' failed: {reason}")]
    Engine { engine: String, reason: String },
}

impl RuntimeError {
    pub fn engine(engine: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Engine {
            engine: engine.into(),
            reason: reason.into(),
        }
    }

    pub fn busy(model_id: impl Into<String>) -> Self {
        Self::InferenceBusy {
            model_id: model_id.into(),
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InferenceBusy { .. } | Self::MonitorStalled { .. } => true,
            Self::ModelLoad(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// HTTP status an outer request layer should map this error to.
    pub fn status_hint(&self) -> u16 {
        match self {
            Self::ModelNotFound(_) => 404,
            Self::InferenceBusy { .. } => 429,
            Self::InferenceCancelled { .. } => 499,
            Self::ModelLoad(
                ModelLoadError::UnknownFormat { .. }
                | ModelLoadError::CorruptFile { .. }
                | ModelLoadError::ChecksumMismatch { .. },
            ) => 400,
            Self::MonitorStalled { .. } | Self::HardwareUnavailable(_) => 503,
            _ => 500,
        }
    }
}

/// Result alias for request-level operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Crate-level error for startup and assembly paths.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[cfg(feature = "config")]
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid value supplied to a builder.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias carrying an [`error_stack::Report`].
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;
