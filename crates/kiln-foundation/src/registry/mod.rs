//! ModelRegistry - ownership of loaded models
//!
//! The registry holds at most one [`ModelHandle`] per model id. Loading
//! resolves the file through the [`ModelLoaderRegistry`], asks the
//! [`ComputeDispatcher`] for a backend and binds the model to that backend's
//! engine. Loads of one id are serialized through a per-id gate; loads of
//! different ids run concurrently and are admitted against the memory budget
//! under the registry's write lock. A gate is dropped once no load holds it.
//!
//! Eviction walks handles in `(last_accessed, access_count)` order. A first
//! pass skips models with a generation in flight; a second, forced pass runs
//! only when the first fell short.

mod handle;
pub mod metadata;

pub use handle::{GenerationPermit, ModelHandle};
pub use metadata::{MetadataStore, ModelRecord};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kiln_kernel::engine::AcquireMode;
use kiln_kernel::loader::LoadRequest;
use kiln_kernel::model::{ModelFormat, Quantization, model_id_from_path};
use kiln_kernel::{ComputeBackend, ModelLoadError, RuntimeError, RuntimeResult, Workload};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::ComputeDispatcher;
use crate::loader::ModelLoaderRegistry;

/// Configuration for [`ModelRegistry`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Share of physical memory loaded models may occupy
    pub memory_budget_fraction: f64,
    /// How long a forced unload waits for an in-flight generation
    pub unload_grace_ms: u64,
    /// Unload models idle this long; `None` disables the sweeper
    pub idle_timeout_secs: Option<u64>,
    pub idle_check_interval_secs: u64,
    /// Where per-model metadata records are written; `None` disables persistence
    pub metadata_dir: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            memory_budget_fraction: 0.8,
            unload_grace_ms: 5_000,
            idle_timeout_secs: None,
            idle_check_interval_secs: 60,
            metadata_dir: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_memory_budget_fraction(mut self, fraction: f64) -> Result<Self, &'static str> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err("memory_budget_fraction must be in (0, 1]");
        }
        self.memory_budget_fraction = fraction;
        Ok(self)
    }

    pub fn with_unload_grace(mut self, grace: Duration) -> Self {
        self.unload_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Result<Self, &'static str> {
        if timeout.is_zero() {
            return Err("idle timeout must be > 0");
        }
        self.idle_timeout_secs = Some(timeout.as_secs().max(1));
        Ok(self)
    }

    pub fn with_metadata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metadata_dir = Some(dir.into());
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !(self.memory_budget_fraction > 0.0 && self.memory_budget_fraction <= 1.0) {
            return Err("memory_budget_fraction must be in (0, 1]");
        }
        if self.idle_check_interval_secs == 0 {
            return Err("idle_check_interval_secs must be > 0");
        }
        if self.idle_timeout_secs == Some(0) {
            return Err("idle_timeout_secs must be > 0");
        }
        Ok(())
    }

    pub fn unload_grace(&self) -> Duration {
        Duration::from_millis(self.unload_grace_ms)
    }
}

/// Options for [`ModelRegistry::load`]
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Defaults to the file stem
    pub id: Option<String>,
    /// Skips format detection
    pub format: Option<ModelFormat>,
    pub backend: ComputeBackend,
    /// Replace an already-loaded model with the same id
    pub force_reload: bool,
    /// Lowercase hex sha-256 the file must match
    pub expected_checksum: Option<String>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_format(mut self, format: ModelFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_backend(mut self, backend: ComputeBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn force_reload(mut self) -> Self {
        self.force_reload = true;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }
}

/// Row of [`ModelRegistry::list`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub format: ModelFormat,
    pub backend: ComputeBackend,
    pub engine: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub memory_footprint_bytes: u64,
    pub quantization: Quantization,
    pub loaded_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub busy: bool,
}

impl From<&ModelHandle> for ModelInfo {
    fn from(h: &ModelHandle) -> Self {
        let d = h.descriptor();
        Self {
            id: d.id.clone(),
            format: d.format,
            backend: h.backend(),
            engine: h.engine().name().to_string(),
            path: d.path.clone(),
            size_bytes: d.size_bytes,
            memory_footprint_bytes: d.memory_footprint_bytes(),
            quantization: d.quantization.clone(),
            loaded_at: h.loaded_at(),
            last_accessed: h.last_accessed(),
            access_count: h.access_count(),
            busy: h.is_busy(),
        }
    }
}

/// Entry of [`ModelRegistry::lru_candidates`], in eviction order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionCandidate {
    pub id: String,
    pub memory_footprint_bytes: u64,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
    pub busy: bool,
}

/// Outcome of an eviction call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Evicted ids, in eviction order
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
    /// Number of evictions that needed the forced pass
    pub forced: usize,
}

#[derive(Debug, Clone, Copy)]
enum EvictionGoal {
    Count(usize),
    Bytes(u64),
}

impl EvictionGoal {
    fn met(self, report: &EvictionReport) -> bool {
        match self {
            Self::Count(n) => report.evicted.len() >= n,
            Self::Bytes(b) => report.freed_bytes >= b,
        }
    }
}

struct RegistryInner {
    config: RegistryConfig,
    loaders: Arc<ModelLoaderRegistry>,
    dispatcher: Arc<ComputeDispatcher>,
    models: RwLock<HashMap<String, ModelHandle>>,
    gates: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    metadata: Option<Arc<MetadataStore>>,
    // Serializes record writes so the last write carries the newest stats.
    persist_lock: Mutex<()>,
}

/// Owner of all loaded models.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(
        config: RegistryConfig,
        loaders: Arc<ModelLoaderRegistry>,
        dispatcher: Arc<ComputeDispatcher>,
    ) -> Self {
        let metadata = config
            .metadata_dir
            .as_ref()
            .map(|dir| Arc::new(MetadataStore::new(dir)));
        Self {
            inner: Arc::new(RegistryInner {
                config,
                loaders,
                dispatcher,
                models: RwLock::new(HashMap::new()),
                gates: DashMap::new(),
                metadata,
                persist_lock: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn loaders(&self) -> &Arc<ModelLoaderRegistry> {
        &self.inner.loaders
    }

    pub fn dispatcher(&self) -> &Arc<ComputeDispatcher> {
        &self.inner.dispatcher
    }

    pub fn metadata(&self) -> Option<&MetadataStore> {
        self.inner.metadata.as_deref()
    }

    fn gate(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.inner.gates.entry(id.to_string()).or_default().value())
    }

    /// Load `source` and register it, or return the handle already loaded
    /// under the same id.
    pub async fn load(&self, source: impl AsRef<Path>, options: LoadOptions) -> RuntimeResult<ModelHandle> {
        let path = source.as_ref().to_path_buf();
        let id = options
            .id
            .clone()
            .or_else(|| model_id_from_path(&path))
            .ok_or_else(|| ModelLoadError::UnknownFormat { path: path.clone() })?;

        let gate = self.gate(&id);
        let result = {
            let _serial = gate.lock().await;
            self.load_serialized(&path, &id, &options).await
        };
        drop(gate);
        self.inner.gates.remove_if(&id, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn load_serialized(&self, path: &Path, id: &str, options: &LoadOptions) -> RuntimeResult<ModelHandle> {
        let existing = self.get(id);
        if let Some(handle) = &existing {
            if !options.force_reload {
                debug!(model_id = %id, "model already loaded");
                return Ok(handle.clone());
            }
        }

        let loaders = Arc::clone(&self.inner.loaders);
        let mut request = LoadRequest::new(path, id.to_string());
        request.expected_checksum = options.expected_checksum.clone();
        let hint = options.format;
        let loaded = tokio::task::spawn_blocking(move || loaders.load_request(&request, hint))
            .await
            .map_err(|e| RuntimeError::engine("loader", e.to_string()))??;

        let footprint = loaded.descriptor.memory_footprint_bytes();
        self.admit(id, footprint, &self.inner.models.read())?;

        let backend = self
            .inner
            .dispatcher
            .select(&Workload::for_model(&loaded.descriptor), options.backend)?;
        let engine = self.inner.dispatcher.engines().engine(backend)?;
        let engine_model = engine.load_into(&loaded).await?;

        let handle = ModelHandle::new(
            loaded.descriptor,
            backend,
            engine,
            engine_model,
            loaded.payload,
        );

        let old_permit = match &existing {
            Some(old) => self.drain(old).await,
            None => None,
        };

        // Other ids may have been admitted while the engine was loading.
        let replaced = {
            let mut models = self.inner.models.write();
            self.admit(id, footprint, &models)
                .map(|()| models.insert(id.to_string(), handle.clone()))
        };
        let replaced = match replaced {
            Ok(replaced) => replaced,
            Err(e) => {
                handle.engine().release(handle.engine_model()).await;
                return Err(e);
            }
        };

        if let Some(old) = replaced {
            old.engine().release(old.engine_model()).await;
            drop(old_permit);
            info!(model_id = %id, "model reloaded");
        }

        info!(
            model_id = %id,
            format = %handle.descriptor().format,
            backend = %backend,
            engine = handle.engine().name(),
            size_bytes = handle.descriptor().size_bytes,
            "model loaded"
        );
        self.persist(&handle).await;
        Ok(handle)
    }

    /// Fails with `InsufficientMemory` when `footprint` does not fit next to
    /// the models in `models` other than `id`.
    fn admit(&self, id: &str, footprint: u64, models: &HashMap<String, ModelHandle>) -> RuntimeResult<()> {
        let resident: u64 = models
            .values()
            .filter(|h| h.id() != id)
            .map(|h| h.descriptor().memory_footprint_bytes())
            .sum();
        let budget = self.memory_budget_bytes();
        if resident.saturating_add(footprint) > budget {
            warn!(model_id = %id, footprint, resident, budget, "model does not fit the memory budget");
            return Err(ModelLoadError::InsufficientMemory {
                required_bytes: footprint,
                available_bytes: budget.saturating_sub(resident),
            }
            .into());
        }
        Ok(())
    }

    /// Wait up to the unload grace period for the generation lock. `None`
    /// means the grace period ran out and the caller proceeds without it.
    async fn drain(&self, handle: &ModelHandle) -> Option<GenerationPermit> {
        match handle.acquire(AcquireMode::Wait(self.inner.config.unload_grace())).await {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!(
                    model_id = %handle.id(),
                    grace_ms = self.inner.config.unload_grace_ms,
                    "generation still running after grace period, releasing anyway"
                );
                None
            }
        }
    }

    /// Unload `id`. Without `force` a busy model fails with `InferenceBusy`;
    /// with `force` the in-flight generation gets the configured grace period.
    pub async fn unload(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let handle = self.get(id).ok_or_else(|| RuntimeError::ModelNotFound(id.to_string()))?;
        self.unload_handle(&handle, force).await.map(|_| ())
    }

    /// Returns the freed footprint, or zero when the handle was already gone.
    async fn unload_handle(&self, handle: &ModelHandle, force: bool) -> RuntimeResult<u64> {
        let permit = if force {
            self.drain(handle).await
        } else {
            Some(handle.try_acquire().ok_or_else(|| RuntimeError::busy(handle.id()))?)
        };

        let removed = {
            let mut models = self.inner.models.write();
            match models.get(handle.id()) {
                Some(current) if current.same_as(handle) => models.remove(handle.id()).is_some(),
                _ => false,
            }
        };
        if !removed {
            return Ok(0);
        }

        handle.engine().release(handle.engine_model()).await;
        drop(permit);
        info!(model_id = %handle.id(), forced = force, "model unloaded");
        self.persist(handle).await;
        Ok(handle.descriptor().memory_footprint_bytes())
    }

    pub fn get(&self, id: &str) -> Option<ModelHandle> {
        self.inner.models.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.models.read().contains_key(id)
    }

    /// Loaded models, sorted by id.
    pub fn list(&self) -> Vec<ModelInfo> {
        let mut out: Vec<ModelInfo> = self.inner.models.read().values().map(ModelInfo::from).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record an access; returns the handle.
    pub fn touch(&self, id: &str) -> RuntimeResult<ModelHandle> {
        let handle = self.get(id).ok_or_else(|| RuntimeError::ModelNotFound(id.to_string()))?;
        self.record_access(&handle);
        Ok(handle)
    }

    /// Bump the access statistics and queue a metadata write. Writes for one
    /// handle coalesce until the queued one runs.
    pub(crate) fn record_access(&self, handle: &ModelHandle) {
        handle.touch();
        if self.inner.metadata.is_none() || !handle.mark_persist_pending() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            handle.clear_persist_pending();
            return;
        };
        let registry = self.clone();
        let handle = handle.clone();
        runtime.spawn_blocking(move || registry.write_record(&handle));
    }

    /// Handles in eviction order.
    fn eviction_order(&self) -> Vec<ModelHandle> {
        let mut handles: Vec<ModelHandle> = self.inner.models.read().values().cloned().collect();
        handles.sort_by_key(|h| h.lru_key());
        handles
    }

    pub fn lru_candidates(&self) -> Vec<EvictionCandidate> {
        self.eviction_order()
            .iter()
            .map(|h| EvictionCandidate {
                id: h.id().to_string(),
                memory_footprint_bytes: h.descriptor().memory_footprint_bytes(),
                last_accessed: h.last_accessed(),
                access_count: h.access_count(),
                busy: h.is_busy(),
            })
            .collect()
    }

    /// Sum of loaded models' footprints.
    pub fn resident_bytes(&self) -> u64 {
        self.inner
            .models
            .read()
            .values()
            .map(|h| h.descriptor().memory_footprint_bytes())
            .sum()
    }

    pub fn memory_budget_bytes(&self) -> u64 {
        let total = self.inner.dispatcher.profile().total_memory_bytes;
        (total as f64 * self.inner.config.memory_budget_fraction) as u64
    }

    pub async fn evict_least_recently_used(&self, n: usize) -> EvictionReport {
        self.evict(EvictionGoal::Count(n)).await
    }

    /// Evict in LRU order until at least `bytes` of footprint is freed.
    pub async fn evict_bytes(&self, bytes: u64) -> EvictionReport {
        self.evict(EvictionGoal::Bytes(bytes)).await
    }

    async fn evict(&self, goal: EvictionGoal) -> EvictionReport {
        let mut report = EvictionReport::default();
        if goal.met(&report) {
            return report;
        }

        let mut skipped = Vec::new();
        for handle in self.eviction_order() {
            if goal.met(&report) {
                break;
            }
            match self.unload_handle(&handle, false).await {
                Ok(0) => {}
                Ok(freed) => {
                    report.evicted.push(handle.id().to_string());
                    report.freed_bytes += freed;
                }
                Err(_) => skipped.push(handle),
            }
        }

        for handle in skipped {
            if goal.met(&report) {
                break;
            }
            match self.unload_handle(&handle, true).await {
                Ok(0) => {}
                Ok(freed) => {
                    report.evicted.push(handle.id().to_string());
                    report.freed_bytes += freed;
                    report.forced += 1;
                }
                Err(e) => warn!(model_id = %handle.id(), error = %e, "forced eviction failed"),
            }
        }

        if !report.evicted.is_empty() {
            info!(
                evicted = ?report.evicted,
                freed_bytes = report.freed_bytes,
                forced = report.forced,
                "models evicted"
            );
        }
        report
    }

    /// Unload every idle model not accessed within `idle_timeout`. Busy
    /// models are never forced.
    pub async fn evict_idle(&self, idle_timeout: Duration) -> EvictionReport {
        let idle_us = i64::try_from(idle_timeout.as_micros()).unwrap_or(i64::MAX);
        let cutoff_us = Utc::now().timestamp_micros().saturating_sub(idle_us);
        let mut report = EvictionReport::default();
        for handle in self.eviction_order() {
            if handle.lru_key().0 > cutoff_us {
                continue;
            }
            if let Ok(freed) = self.unload_handle(&handle, false).await {
                if freed > 0 {
                    report.evicted.push(handle.id().to_string());
                    report.freed_bytes += freed;
                }
            }
        }
        if !report.evicted.is_empty() {
            info!(evicted = ?report.evicted, "idle models unloaded");
        }
        report
    }

    /// Periodically run [`evict_idle`](Self::evict_idle) until `cancel` fires.
    /// Returns `None` when no idle timeout is configured.
    pub fn spawn_idle_sweeper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let timeout = Duration::from_secs(self.inner.config.idle_timeout_secs?);
        let period = Duration::from_secs(self.inner.config.idle_check_interval_secs);
        let registry = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_idle(timeout).await;
                    }
                }
            }
            debug!("idle sweeper stopped");
        }))
    }

    async fn persist(&self, handle: &ModelHandle) {
        if self.inner.metadata.is_none() {
            return;
        }
        let registry = self.clone();
        let writer = handle.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || registry.write_record(&writer)).await {
            error!(model_id = %handle.id(), error = %e, "metadata writer task failed");
        }
    }

    /// Blocking. Snapshots the handle under the write lock, so a later write
    /// never carries older statistics than an earlier one.
    fn write_record(&self, handle: &ModelHandle) {
        let Some(store) = self.inner.metadata.as_deref() else {
            return;
        };
        let _serial = self.inner.persist_lock.lock();
        handle.clear_persist_pending();
        let record = handle.record();
        if let Err(e) = store.save(&record) {
            error!(model_id = %record.model_id, error = %e, "failed to write model metadata");
        }
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.inner.models.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
