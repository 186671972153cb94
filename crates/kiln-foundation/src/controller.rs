//! AdaptiveController - turns hardware tier transitions into dispatch
//! directives, a power-saving advisory and memory eviction.
//!
//! The controller keeps one level per axis (`Normal`, `Elevated`,
//! `Critical`). Rising levels step through every intermediate level; falling
//! levels drop directly. It runs synchronously inside monitor dispatch, so
//! anything slow (eviction) is handed to a spawned task.

use std::sync::{Arc, Weak};

use kiln_kernel::hardware::{
    EventFilter, EventKind, HardwareEvent, MemoryPressure, PowerSource, ThermalState,
};
use kiln_kernel::{Directive, DirectiveSource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::ComputeDispatcher;
use crate::monitor::{HardwareMonitor, SubscriptionId};
use crate::registry::{EvictionReport, ModelRegistry};
use crate::router::PowerSavingAdvisory;

/// Controller view of one pressure axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisLevel {
    #[default]
    Normal,
    Elevated,
    Critical,
}

impl AxisLevel {
    fn next_up(self) -> Self {
        match self {
            Self::Normal => Self::Elevated,
            Self::Elevated | Self::Critical => Self::Critical,
        }
    }

    pub fn is_elevated(self) -> bool {
        self >= Self::Elevated
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisLevels {
    pub thermal: AxisLevel,
    pub power: AxisLevel,
    pub memory: AxisLevel,
}

/// Configuration for [`AdaptiveController`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Thermal tier at which the thermal axis is elevated
    pub thermal_elevated_at: ThermalState,
    /// Memory tier at which the memory axis is elevated
    pub memory_elevated_at: MemoryPressure,
    /// Evict models when memory reaches `Critical`
    pub evict_on_memory_critical: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            thermal_elevated_at: ThermalState::Hot,
            memory_elevated_at: MemoryPressure::Urgent,
            evict_on_memory_critical: true,
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.thermal_elevated_at == ThermalState::Normal || self.thermal_elevated_at > ThermalState::Throttled {
            return Err("thermal_elevated_at must be between warm and throttled");
        }
        if self.memory_elevated_at == MemoryPressure::Normal || self.memory_elevated_at == MemoryPressure::Critical {
            return Err("memory_elevated_at must be warning or urgent");
        }
        Ok(())
    }

    fn thermal_level(&self, state: ThermalState) -> AxisLevel {
        if state == ThermalState::Critical {
            AxisLevel::Critical
        } else if state >= self.thermal_elevated_at {
            AxisLevel::Elevated
        } else {
            AxisLevel::Normal
        }
    }

    fn power_level(&self, source: PowerSource) -> AxisLevel {
        match source {
            PowerSource::LowBattery => AxisLevel::Elevated,
            PowerSource::Ac | PowerSource::Battery => AxisLevel::Normal,
        }
    }

    fn memory_level(&self, pressure: MemoryPressure) -> AxisLevel {
        if pressure == MemoryPressure::Critical {
            AxisLevel::Critical
        } else if pressure >= self.memory_elevated_at {
            AxisLevel::Elevated
        } else {
            AxisLevel::Normal
        }
    }
}

fn step(axis: &'static str, current: AxisLevel, target: AxisLevel) -> AxisLevel {
    if target <= current {
        if target != current {
            info!(axis, from = ?current, to = ?target, "pressure recovered");
        }
        return target;
    }
    let mut level = current;
    while level < target {
        let next = level.next_up();
        info!(axis, from = ?level, to = ?next, "pressure rising");
        level = next;
    }
    level
}

/// Reacts to monitor events on behalf of the dispatcher, registry and router.
pub struct AdaptiveController {
    config: ControllerConfig,
    dispatcher: Arc<ComputeDispatcher>,
    registry: ModelRegistry,
    advisory: PowerSavingAdvisory,
    warning_ceiling: f64,
    levels: Mutex<AxisLevels>,
    eviction: Mutex<Option<JoinHandle<EvictionReport>>>,
    runtime: Option<Handle>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl AdaptiveController {
    /// Build a controller and subscribe it to every axis of `monitor`.
    ///
    /// Must be called from within a Tokio runtime for eviction to run.
    pub fn attach(
        config: ControllerConfig,
        monitor: &HardwareMonitor,
        dispatcher: Arc<ComputeDispatcher>,
        registry: ModelRegistry,
        advisory: PowerSavingAdvisory,
    ) -> Arc<Self> {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!("adaptive controller attached outside a Tokio runtime; eviction is disabled");
        }
        let controller = Arc::new(Self {
            config,
            dispatcher,
            registry,
            advisory,
            warning_ceiling: monitor.config().thresholds.warning_ceiling(),
            levels: Mutex::new(AxisLevels::default()),
            eviction: Mutex::new(None),
            runtime,
            subscription: Mutex::new(None),
        });

        controller.subscribe_to(monitor);
        controller
    }

    /// Subscribe to every axis of `monitor`. No-op while already subscribed,
    /// so a runtime can call it again after [`detach`](Self::detach).
    pub fn subscribe_to(self: &Arc<Self>, monitor: &HardwareMonitor) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = monitor.subscribe(EventFilter::All, move |event| {
            if let Some(controller) = weak.upgrade() {
                controller.on_event(event);
            }
        });
        *subscription = Some(id);
        info!("adaptive controller attached");
    }

    /// Stop receiving events from `monitor`.
    pub fn detach(&self, monitor: &HardwareMonitor) {
        if let Some(id) = self.subscription.lock().take() {
            monitor.unsubscribe(id);
            debug!("adaptive controller detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.lock().is_some()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn levels(&self) -> AxisLevels {
        *self.levels.lock()
    }

    /// Whether an eviction task is still running.
    pub fn eviction_pending(&self) -> bool {
        self.eviction.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the most recent eviction, if any, and return its report.
    pub async fn settle(&self) -> Option<EvictionReport> {
        let handle = self.eviction.lock().take()?;
        match handle.await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "eviction task failed");
                None
            }
        }
    }

    fn on_event(&self, event: &HardwareEvent) {
        if event.changed(EventKind::Memory) {
            self.dispatcher.observe_memory_pressure(event.current.memory);
        }

        let mut levels = self.levels.lock();
        let before = *levels;
        if event.changed(EventKind::Thermal) {
            levels.thermal = step("thermal", levels.thermal, self.config.thermal_level(event.current.thermal));
        }
        if event.changed(EventKind::Power) {
            levels.power = step("power", levels.power, self.config.power_level(event.current.power));
        }
        if event.changed(EventKind::Memory) {
            levels.memory = step("memory", levels.memory, self.config.memory_level(event.current.memory));
        }
        let after = *levels;
        drop(levels);

        self.update_directive(after);
        self.advisory.set(after.power.is_elevated());

        if after.memory == AxisLevel::Critical
            && before.memory != AxisLevel::Critical
            && self.config.evict_on_memory_critical
        {
            self.schedule_eviction(event);
        }
    }

    fn update_directive(&self, levels: AxisLevels) {
        let current = self.dispatcher.directive_state();
        let driver = if levels.thermal.is_elevated() {
            Some(DirectiveSource::Thermal)
        } else if levels.power.is_elevated() {
            Some(DirectiveSource::Power)
        } else {
            None
        };

        match driver {
            Some(source) => {
                if current.directive != Directive::PreferAccelerator || current.source != source {
                    self.dispatcher.apply_directive_from(Directive::PreferAccelerator, source);
                }
            }
            // Operator directives are left alone.
            None if matches!(current.source, DirectiveSource::Thermal | DirectiveSource::Power) => {
                self.dispatcher
                    .apply_directive_from(Directive::NoPreference, DirectiveSource::None);
            }
            None => {}
        }
    }

    /// Bytes to free so utilization falls back to `Warning` or below.
    fn eviction_target(&self, event: &HardwareEvent) -> Option<u64> {
        let memory = event.sample.memory?;
        let ceiling = (memory.total_bytes as f64 * self.warning_ceiling) as u64;
        Some(memory.used_bytes.saturating_sub(ceiling).saturating_add(1))
    }

    fn schedule_eviction(&self, event: &HardwareEvent) {
        let Some(runtime) = &self.runtime else {
            error!("memory critical but no runtime is available for eviction");
            return;
        };
        let mut slot = self.eviction.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("eviction already running");
            return;
        }

        let registry = self.registry.clone();
        let target = self.eviction_target(event);
        warn!(target_bytes = ?target, resident_bytes = registry.resident_bytes(), "memory critical, evicting models");
        *slot = Some(runtime.spawn(async move {
            match target {
                Some(bytes) => registry.evict_bytes(bytes).await,
                None => registry.evict_least_recently_used(1).await,
            }
        }));
    }
}

impl std::fmt::Debug for AdaptiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveController")
            .field("levels", &self.levels())
            .field("eviction_pending", &self.eviction_pending())
            .finish_non_exhaustive()
    }
}
