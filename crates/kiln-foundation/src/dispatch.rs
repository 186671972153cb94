//! ComputeDispatcher - backend selection for workloads
//!
//! Selection walks a fixed priority chain:
//!
//! 1. an explicit, non-`Auto` caller preference, if viable;
//! 2. the active directive written by the adaptive controller, if viable;
//! 3. the accelerator, if enabled, viable and the model fits its size limit;
//! 4. the GPU, if enabled and viable;
//! 5. the CPU, if viable.
//!
//! A backend is viable for a workload when the hardware has it, an engine is
//! bound to it, and that engine accepts the workload's model format. The
//! dispatcher never returns a backend that is not available.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use kiln_kernel::hardware::{HardwareProfile, MemoryPressure};
use kiln_kernel::model::ModelFormat;
use kiln_kernel::{
    BackendAvailability, ComputeBackend, Directive, DirectiveSource, RuntimeError, RuntimeResult, Workload,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::EngineSet;

/// Tunables for [`ComputeDispatcher`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Gates chain step 3; directives and explicit preferences ignore it
    pub accelerator_enabled: bool,
    /// Gates chain step 4
    pub gpu_enabled: bool,
    /// Models larger than this skip the accelerator step
    pub accelerator_max_model_bytes: u64,
    pub cpu_batch_size: usize,
    pub gpu_batch_size: usize,
    pub accelerator_batch_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            accelerator_enabled: true,
            gpu_enabled: true,
            accelerator_max_model_bytes: 1 << 30,
            cpu_batch_size: 8,
            gpu_batch_size: 32,
            accelerator_batch_size: 16,
        }
    }
}

impl DispatchConfig {
    pub fn with_accelerator_enabled(mut self, enabled: bool) -> Self {
        self.accelerator_enabled = enabled;
        self
    }

    pub fn with_gpu_enabled(mut self, enabled: bool) -> Self {
        self.gpu_enabled = enabled;
        self
    }

    pub fn with_accelerator_max_model_bytes(mut self, bytes: u64) -> Result<Self, &'static str> {
        if bytes == 0 {
            return Err("accelerator_max_model_bytes must be > 0");
        }
        self.accelerator_max_model_bytes = bytes;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.cpu_batch_size == 0 || self.gpu_batch_size == 0 || self.accelerator_batch_size == 0 {
            return Err("batch sizes must be > 0");
        }
        Ok(())
    }

    fn base_batch(&self, backend: ComputeBackend) -> usize {
        match backend {
            ComputeBackend::Gpu => self.gpu_batch_size,
            ComputeBackend::Accelerator => self.accelerator_batch_size,
            ComputeBackend::Cpu | ComputeBackend::Auto => self.cpu_batch_size,
        }
    }
}

/// One row of [`ComputeDispatcher::capabilities`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCapability {
    pub backend: ComputeBackend,
    pub availability: BackendAvailability,
    pub formats: Vec<ModelFormat>,
    pub enabled: bool,
    pub recommended_batch_size: usize,
}

/// Decoded contents of the directive slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveState {
    pub directive: Directive,
    pub source: DirectiveSource,
    /// Incremented on every write
    pub version: u64,
}

// Slot layout: bits 0..8 directive, 8..16 source, 16..64 version.
fn pack(directive: Directive, source: DirectiveSource, version: u64) -> u64 {
    let d = match directive {
        Directive::NoPreference => 0u64,
        Directive::PreferAccelerator => 1,
        Directive::PreferGpu => 2,
    };
    let s = match source {
        DirectiveSource::None => 0u64,
        DirectiveSource::Thermal => 1,
        DirectiveSource::Power => 2,
        DirectiveSource::Memory => 3,
        DirectiveSource::Operator => 4,
    };
    d | (s << 8) | (version << 16)
}

fn unpack(word: u64) -> DirectiveState {
    let directive = match word & 0xff {
        1 => Directive::PreferAccelerator,
        2 => Directive::PreferGpu,
        _ => Directive::NoPreference,
    };
    let source = match (word >> 8) & 0xff {
        1 => DirectiveSource::Thermal,
        2 => DirectiveSource::Power,
        3 => DirectiveSource::Memory,
        4 => DirectiveSource::Operator,
        _ => DirectiveSource::None,
    };
    DirectiveState {
        directive,
        source,
        version: word >> 16,
    }
}

fn pressure_code(p: MemoryPressure) -> u8 {
    match p {
        MemoryPressure::Normal => 0,
        MemoryPressure::Warning => 1,
        MemoryPressure::Urgent => 2,
        MemoryPressure::Critical => 3,
    }
}

fn pressure_from(code: u8) -> MemoryPressure {
    match code {
        1 => MemoryPressure::Warning,
        2 => MemoryPressure::Urgent,
        3 => MemoryPressure::Critical,
        _ => MemoryPressure::Normal,
    }
}

/// Chooses a concrete backend for each workload
pub struct ComputeDispatcher {
    profile: Arc<HardwareProfile>,
    engines: Arc<EngineSet>,
    config: DispatchConfig,
    directive: AtomicU64,
    memory_pressure: AtomicU8,
}

impl ComputeDispatcher {
    pub fn new(profile: Arc<HardwareProfile>, engines: Arc<EngineSet>, config: DispatchConfig) -> Self {
        Self {
            profile,
            engines,
            config,
            directive: AtomicU64::new(pack(Directive::NoPreference, DirectiveSource::None, 0)),
            memory_pressure: AtomicU8::new(0),
        }
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn engines(&self) -> &Arc<EngineSet> {
        &self.engines
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Hardware presence combined with engine binding.
    pub fn availability(&self, backend: ComputeBackend) -> BackendAvailability {
        let hardware = match backend {
            ComputeBackend::Auto => return BackendAvailability::unavailable("auto is not a concrete backend"),
            ComputeBackend::Cpu => true,
            ComputeBackend::Gpu => self.profile.gpu_available(),
            ComputeBackend::Accelerator => self.profile.accelerator_available(),
        };
        if !hardware {
            return BackendAvailability::unavailable(format!("no {backend} detected on this machine"));
        }
        self.engines.availability(backend)
    }

    fn viable(&self, backend: ComputeBackend, workload: &Workload) -> bool {
        if !self.availability(backend).is_available() {
            return false;
        }
        match (workload.format, self.engines.engine(backend)) {
            (Some(format), Ok(engine)) => engine.supports(format),
            (None, Ok(_)) => true,
            (_, Err(_)) => false,
        }
    }

    fn fits_accelerator(&self, workload: &Workload) -> bool {
        workload
            .model_size_bytes
            .is_none_or(|size| size <= self.config.accelerator_max_model_bytes)
    }

    /// Pick a backend for `workload`.
    pub fn select(&self, workload: &Workload, preference: ComputeBackend) -> RuntimeResult<ComputeBackend> {
        if preference.is_concrete() {
            if self.viable(preference, workload) {
                debug!(backend = %preference, "dispatch: explicit preference");
                return Ok(preference);
            }
            debug!(backend = %preference, "dispatch: explicit preference not viable, falling through");
        }

        let state = self.directive_state();
        if let Some(target) = state.directive.preferred_backend() {
            if self.viable(target, workload) {
                debug!(backend = %target, source = ?state.source, "dispatch: directive");
                return Ok(target);
            }
        }

        if self.config.accelerator_enabled
            && self.fits_accelerator(workload)
            && self.viable(ComputeBackend::Accelerator, workload)
        {
            return Ok(ComputeBackend::Accelerator);
        }
        if self.config.gpu_enabled && self.viable(ComputeBackend::Gpu, workload) {
            return Ok(ComputeBackend::Gpu);
        }
        if self.viable(ComputeBackend::Cpu, workload) {
            return Ok(ComputeBackend::Cpu);
        }

        let reason = match workload.format {
            Some(format) => format!("no available backend accepts {format} models"),
            None => "no compute backend is available".to_string(),
        };
        Err(RuntimeError::BackendUnavailable {
            backend: preference,
            reason,
        })
    }

    pub fn capabilities(&self) -> Vec<BackendCapability> {
        ComputeBackend::CONCRETE
            .into_iter()
            .map(|backend| BackendCapability {
                backend,
                availability: self.availability(backend),
                formats: self.engines.formats(backend),
                enabled: match backend {
                    ComputeBackend::Accelerator => self.config.accelerator_enabled,
                    ComputeBackend::Gpu => self.config.gpu_enabled,
                    _ => true,
                },
                recommended_batch_size: self.recommended_batch_size(backend),
            })
            .collect()
    }

    /// Operator-issued directive.
    pub fn apply_directive(&self, directive: Directive) -> DirectiveState {
        self.apply_directive_from(directive, DirectiveSource::Operator)
    }

    /// Replace the directive, recording which pressure axis issued it.
    pub fn apply_directive_from(&self, directive: Directive, source: DirectiveSource) -> DirectiveState {
        let source = if directive == Directive::NoPreference {
            DirectiveSource::None
        } else {
            source
        };
        let previous = self
            .directive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(directive, source, unpack(word).version + 1))
            })
            .unwrap_or_else(|word| word);
        let previous = unpack(previous);
        let next = DirectiveState {
            directive,
            source,
            version: previous.version + 1,
        };
        if previous.directive != directive {
            info!(from = %previous.directive, to = %directive, source = ?source, "dispatch directive changed");
        }
        next
    }

    pub fn directive(&self) -> Directive {
        self.directive_state().directive
    }

    pub fn directive_state(&self) -> DirectiveState {
        unpack(self.directive.load(Ordering::Acquire))
    }

    /// Record the memory tier used for batch sizing.
    pub fn observe_memory_pressure(&self, pressure: MemoryPressure) {
        self.memory_pressure.store(pressure_code(pressure), Ordering::Release);
    }

    pub fn memory_pressure(&self) -> MemoryPressure {
        pressure_from(self.memory_pressure.load(Ordering::Acquire))
    }

    /// Full batches only under normal memory pressure.
    pub fn recommended_batch_size(&self, backend: ComputeBackend) -> usize {
        let backend = if backend.is_concrete() {
            backend
        } else {
            self.select(&Workload::default(), ComputeBackend::Auto)
                .unwrap_or(ComputeBackend::Cpu)
        };
        let base = self.config.base_batch(backend);
        let scaled = match self.memory_pressure() {
            MemoryPressure::Normal => base,
            MemoryPressure::Warning => base / 2,
            MemoryPressure::Urgent => base / 4,
            MemoryPressure::Critical => 1,
        };
        scaled.max(1)
    }

    /// Batch size for `workload` on `backend`; kinds that do not batch get 1.
    pub fn batch_size_for(&self, workload: &Workload, backend: ComputeBackend) -> usize {
        if !workload.kind.supports_batching() {
            return 1;
        }
        self.recommended_batch_size(backend)
    }
}
