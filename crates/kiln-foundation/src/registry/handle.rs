//! Runtime record for one loaded model.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use kiln_kernel::engine::{AcquireMode, EngineModel, InferenceEngine};
use kiln_kernel::model::{ModelDescriptor, ModelPayload};
use kiln_kernel::{ComputeBackend, RuntimeError, RuntimeResult};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::metadata::ModelRecord;

struct HandleInner {
    descriptor: ModelDescriptor,
    backend: ComputeBackend,
    engine: Arc<dyn InferenceEngine>,
    model: EngineModel,
    // Keeps the mapping alive for as long as the engine may read it.
    payload: ModelPayload,
    generation: Arc<Mutex<()>>,
    loaded_at: DateTime<Utc>,
    last_accessed_us: AtomicI64,
    access_count: AtomicU64,
    // A metadata write for this handle is queued and has not run yet.
    persist_pending: AtomicBool,
}

/// Shared reference to a loaded model. Clones refer to the same record.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<HandleInner>,
}

impl ModelHandle {
    pub(crate) fn new(
        descriptor: ModelDescriptor,
        backend: ComputeBackend,
        engine: Arc<dyn InferenceEngine>,
        model: EngineModel,
        payload: ModelPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(HandleInner {
                descriptor,
                backend,
                engine,
                model,
                payload,
                generation: Arc::new(Mutex::new(())),
                loaded_at: now,
                last_accessed_us: AtomicI64::new(now.timestamp_micros()),
                access_count: AtomicU64::new(0),
                persist_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.descriptor.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.inner.descriptor
    }

    pub fn backend(&self) -> ComputeBackend {
        self.inner.backend
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.inner.engine
    }

    pub fn engine_model(&self) -> &EngineModel {
        &self.inner.model
    }

    pub fn payload(&self) -> &ModelPayload {
        &self.inner.payload
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.inner.loaded_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        let us = self.inner.last_accessed_us.load(Ordering::Acquire);
        DateTime::from_timestamp_micros(us).unwrap_or(self.inner.loaded_at)
    }

    pub fn access_count(&self) -> u64 {
        self.inner.access_count.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same loaded instance.
    pub fn same_as(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A generation currently holds the lock.
    pub fn is_busy(&self) -> bool {
        self.inner.generation.try_lock().is_err()
    }

    pub(crate) fn touch(&self) {
        self.inner
            .last_accessed_us
            .fetch_max(Utc::now().timestamp_micros(), Ordering::AcqRel);
        self.inner.access_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns false when a write is already queued.
    pub(crate) fn mark_persist_pending(&self) -> bool {
        !self.inner.persist_pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_persist_pending(&self) {
        self.inner.persist_pending.store(false, Ordering::Release);
    }

    /// Sort key for eviction; smaller is evicted first.
    pub(crate) fn lru_key(&self) -> (i64, u64) {
        (
            self.inner.last_accessed_us.load(Ordering::Acquire),
            self.access_count(),
        )
    }

    pub fn try_acquire(&self) -> Option<GenerationPermit> {
        let guard = Arc::clone(&self.inner.generation).try_lock_owned().ok()?;
        Some(GenerationPermit {
            handle: self.clone(),
            _guard: guard,
        })
    }

    /// Take the generation lock according to `mode`.
    pub async fn acquire(&self, mode: AcquireMode) -> RuntimeResult<GenerationPermit> {
        match mode {
            AcquireMode::FailFast => self.try_acquire().ok_or_else(|| RuntimeError::busy(self.id())),
            AcquireMode::Wait(timeout) => {
                let lock = Arc::clone(&self.inner.generation).lock_owned();
                match tokio::time::timeout(timeout, lock).await {
                    Ok(guard) => Ok(GenerationPermit {
                        handle: self.clone(),
                        _guard: guard,
                    }),
                    Err(_) => Err(RuntimeError::busy(self.id())),
                }
            }
        }
    }

    pub(crate) fn record(&self) -> ModelRecord {
        let d = &self.inner.descriptor;
        ModelRecord {
            model_id: d.id.clone(),
            format: d.format,
            size_bytes: d.size_bytes,
            quantization: d.quantization.clone(),
            memory_footprint: d.memory_footprint_bytes(),
            checksum: d.checksum.clone(),
            last_accessed: self.last_accessed(),
            access_count: self.access_count(),
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id())
            .field("backend", &self.backend())
            .field("engine", &self.inner.engine.name())
            .field("access_count", &self.access_count())
            .finish()
    }
}

/// Exclusive right to run one generation on a model. Released on drop.
pub struct GenerationPermit {
    handle: ModelHandle,
    _guard: OwnedMutexGuard<()>,
}

impl GenerationPermit {
    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }
}

impl fmt::Debug for GenerationPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationPermit").field("model_id", &self.handle.id()).finish()
    }
}
