//! Compute backends, workloads and dispatch directives.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ModelDescriptor, ModelFormat};

/// A compute surface a model can execute on.
///
/// `Auto` is a request, not a capability: the dispatcher resolves it to one
/// of the concrete variants before a loader or engine ever sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeBackend {
    Cpu,
    Gpu,
    Accelerator,
    #[default]
    Auto,
}

impl ComputeBackend {
    /// The concrete backends, in default preference order.
    pub const CONCRETE: [ComputeBackend; 3] = [Self::Accelerator, Self::Gpu, Self::Cpu];

    pub fn is_concrete(self) -> bool {
        !matches!(self, Self::Auto)
    }
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
            Self::Accelerator => write!(f, "accelerator"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for ComputeBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" | "metal" | "cuda" => Ok(Self::Gpu),
            "accelerator" | "ane" | "npu" => Ok(Self::Accelerator),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown compute backend '{other}'")),
        }
    }
}

/// Whether a concrete backend can be used on this machine.
///
/// Absence is represented explicitly; there is no stand-in engine for a
/// backend whose native library is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendAvailability {
    Available,
    Unavailable { reason: String },
}

impl BackendAvailability {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }
}

/// The kind of work being dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    #[default]
    Generation,
    Chat,
    Embedding,
}

impl WorkloadKind {
    /// Embedding workloads are the only ones that batch.
    pub fn supports_batching(self) -> bool {
        matches!(self, Self::Embedding)
    }
}

/// A unit of work presented to the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workload {
    pub kind: WorkloadKind,
    /// Size of the model the work will run against, if known.
    pub model_size_bytes: Option<u64>,
    pub format: Option<ModelFormat>,
}

impl Workload {
    pub fn new(kind: WorkloadKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Workload for loading the model described by `descriptor`.
    pub fn for_model(descriptor: &ModelDescriptor) -> Self {
        let kind = if descriptor.supports(crate::model::Capability::Chat) {
            WorkloadKind::Chat
        } else if descriptor.supports(crate::model::Capability::Embedding) {
            WorkloadKind::Embedding
        } else {
            WorkloadKind::Generation
        };
        Self {
            kind,
            model_size_bytes: Some(descriptor.size_bytes),
            format: Some(descriptor.format),
        }
    }
}

/// The single shared dispatch hint written by the adaptive controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    PreferAccelerator,
    PreferGpu,
    #[default]
    NoPreference,
}

impl Directive {
    /// The backend the directive points at, if any.
    pub fn preferred_backend(self) -> Option<ComputeBackend> {
        match self {
            Self::PreferAccelerator => Some(ComputeBackend::Accelerator),
            Self::PreferGpu => Some(ComputeBackend::Gpu),
            Self::NoPreference => None,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreferAccelerator => write!(f, "prefer-accelerator"),
            Self::PreferGpu => write!(f, "prefer-gpu"),
            Self::NoPreference => write!(f, "no-preference"),
        }
    }
}

/// Which pressure axis caused a directive to be issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveSource {
    #[default]
    None,
    Thermal,
    Power,
    Memory,
    Operator,
}
