//! Engine bindings per compute backend.
//!
//! Each concrete backend has exactly one slot. A slot without an engine is
//! recorded as unavailable with a reason; nothing stands in for it.

mod reference;

pub use reference::ReferenceEngine;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_kernel::engine::InferenceEngine;
use kiln_kernel::model::ModelFormat;
use kiln_kernel::{BackendAvailability, ComputeBackend, RuntimeError, RuntimeResult};

/// What is bound to one backend.
#[derive(Clone)]
pub enum EngineSlot {
    Available(Arc<dyn InferenceEngine>),
    Unavailable { reason: String },
}

impl std::fmt::Debug for EngineSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available(e) => f.debug_tuple("Available").field(&e.name()).finish(),
            Self::Unavailable { reason } => f.debug_struct("Unavailable").field("reason", reason).finish(),
        }
    }
}

/// Backend → engine table, fixed once the runtime is assembled.
#[derive(Debug, Clone)]
pub struct EngineSet {
    slots: HashMap<ComputeBackend, EngineSlot>,
}

impl Default for EngineSet {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineSet {
    /// Every backend unbound.
    pub fn new() -> Self {
        let slots = ComputeBackend::CONCRETE
            .into_iter()
            .map(|b| {
                (
                    b,
                    EngineSlot::Unavailable {
                        reason: "no engine registered".to_string(),
                    },
                )
            })
            .collect();
        Self { slots }
    }

    /// A [`ReferenceEngine`] on every backend.
    pub fn reference(token_latency: Option<Duration>) -> Self {
        ComputeBackend::CONCRETE.into_iter().fold(Self::new(), |set, backend| {
            let mut engine = ReferenceEngine::new(backend);
            if let Some(latency) = token_latency {
                engine = engine.with_token_latency(latency);
            }
            set.with_engine(Arc::new(engine))
        })
    }

    /// Bind `engine` to the backend it reports. Engines reporting `Auto` are ignored.
    pub fn with_engine(mut self, engine: Arc<dyn InferenceEngine>) -> Self {
        let backend = engine.backend();
        if backend.is_concrete() {
            self.slots.insert(backend, EngineSlot::Available(engine));
        }
        self
    }

    pub fn with_unavailable(mut self, backend: ComputeBackend, reason: impl Into<String>) -> Self {
        if backend.is_concrete() {
            self.slots.insert(
                backend,
                EngineSlot::Unavailable {
                    reason: reason.into(),
                },
            );
        }
        self
    }

    pub fn slot(&self, backend: ComputeBackend) -> Option<&EngineSlot> {
        self.slots.get(&backend)
    }

    pub fn availability(&self, backend: ComputeBackend) -> BackendAvailability {
        match self.slots.get(&backend) {
            Some(EngineSlot::Available(_)) => BackendAvailability::Available,
            Some(EngineSlot::Unavailable { reason }) => BackendAvailability::unavailable(reason.clone()),
            None => BackendAvailability::unavailable("auto is not a concrete backend"),
        }
    }

    pub fn engine(&self, backend: ComputeBackend) -> RuntimeResult<Arc<dyn InferenceEngine>> {
        match self.slots.get(&backend) {
            Some(EngineSlot::Available(engine)) => Ok(Arc::clone(engine)),
            Some(EngineSlot::Unavailable { reason }) => Err(RuntimeError::BackendUnavailable {
                backend,
                reason: reason.clone(),
            }),
            None => Err(RuntimeError::BackendUnavailable {
                backend,
                reason: "auto is not a concrete backend".to_string(),
            }),
        }
    }

    /// Formats the engine on `backend` accepts; empty when unbound.
    pub fn formats(&self, backend: ComputeBackend) -> Vec<ModelFormat> {
        match self.slots.get(&backend) {
            Some(EngineSlot::Available(engine)) => ModelFormat::ALL
                .into_iter()
                .filter(|f| engine.supports(*f))
                .collect(),
            _ => Vec::new(),
        }
    }
}
