//! Hardware data model: the static profile, per-tick samples, pressure tiers
//! and the sensor contract the monitor samples through.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SensorError;

/// Operating system of the host machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsClassification {
    MacOS,
    Windows,
    Linux,
    Other(String),
}

/// CPU family/architecture of the host machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuFamily {
    AppleSilicon,
    X86_64,
    Arm,
    Other(String),
}

/// The kind of GPU acceleration detected on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuKind {
    Metal,
    Cuda,
    Rocm,
    IntelGpu,
}

/// Static description of the machine's compute capabilities.
///
/// Computed once at startup and read-only afterwards, so it is shared
/// behind an `Arc` without any locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub os: OsClassification,
    pub cpu_family: CpuFamily,
    /// Neural accelerator cores; 0 when no accelerator is present.
    pub accelerator_cores: u32,
    /// GPU cores (or compute units); 0 when no usable GPU is present.
    pub gpu_cores: u32,
    pub gpu_kind: Option<GpuKind>,
    pub performance_cores: u32,
    pub efficiency_cores: u32,
    pub total_memory_bytes: u64,
    /// Estimated memory bandwidth in GB/s.
    pub memory_bandwidth_gbps: f64,
}

impl HardwareProfile {
    /// A generic machine with CPU cores only.
    pub fn cpu_only(cores: u32, total_memory_bytes: u64) -> Self {
        Self {
            os: OsClassification::Other("unknown".to_string()),
            cpu_family: CpuFamily::Other("unknown".to_string()),
            accelerator_cores: 0,
            gpu_cores: 0,
            gpu_kind: None,
            performance_cores: cores,
            efficiency_cores: 0,
            total_memory_bytes,
            memory_bandwidth_gbps: 20.0,
        }
    }

    pub fn accelerator_available(&self) -> bool {
        self.accelerator_cores > 0
    }

    pub fn gpu_available(&self) -> bool {
        self.gpu_cores > 0
    }

    pub fn cpu_cores(&self) -> u32 {
        self.performance_cores + self.efficiency_cores
    }
}

/// Memory pressure tier, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    #[default]
    Normal,
    Warning,
    Urgent,
    Critical,
}

/// Thermal tier, ordered from coolest to hottest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    #[default]
    Normal,
    Warm,
    Hot,
    Throttled,
    Critical,
}

/// Where the machine is drawing power from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSource {
    #[default]
    Ac,
    Battery,
    LowBattery,
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ThermalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Warm => "warm",
            Self::Hot => "hot",
            Self::Throttled => "throttled",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl fmt::Display for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ac => "ac",
            Self::Battery => "battery",
            Self::LowBattery => "low-battery",
        };
        f.write_str(s)
    }
}

/// Memory usage at sample time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub pressure: MemoryPressure,
}

impl MemoryReading {
    pub fn utilization(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// One immutable snapshot of device health.
///
/// Each sensor-derived field is optional: a counter that failed to read on
/// this tick is omitted rather than failing the whole sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSample {
    pub timestamp: DateTime<Utc>,
    /// Fraction in `0.0..=1.0`.
    pub cpu_utilization: Option<f32>,
    pub memory: Option<MemoryReading>,
    pub thermal: Option<ThermalState>,
    pub power: Option<PowerSource>,
    pub accelerator_utilization: Option<f32>,
    pub gpu_utilization: Option<f32>,
}

impl Default for HardwareSample {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareSample {
    /// An empty sample stamped with the current time.
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_utilization: None,
            memory: None,
            thermal: None,
            power: None,
            accelerator_utilization: None,
            gpu_utilization: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_cpu(mut self, utilization: f32) -> Self {
        self.cpu_utilization = Some(utilization);
        self
    }

    pub fn with_memory(mut self, used_bytes: u64, total_bytes: u64, pressure: MemoryPressure) -> Self {
        self.memory = Some(MemoryReading {
            used_bytes,
            total_bytes,
            pressure,
        });
        self
    }

    pub fn with_thermal(mut self, thermal: ThermalState) -> Self {
        self.thermal = Some(thermal);
        self
    }

    pub fn with_power(mut self, power: PowerSource) -> Self {
        self.power = Some(power);
        self
    }

    pub fn memory_pressure(&self) -> Option<MemoryPressure> {
        self.memory.map(|m| m.pressure)
    }
}

/// The pressure axes a subscriber can be notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Thermal,
    Power,
    Memory,
}

/// Subscription filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    Thermal,
    Power,
    Memory,
    #[default]
    All,
}

impl EventFilter {
    pub fn matches(self, kind: EventKind) -> bool {
        matches!(
            (self, kind),
            (Self::All, _)
                | (Self::Thermal, EventKind::Thermal)
                | (Self::Power, EventKind::Power)
                | (Self::Memory, EventKind::Memory)
        )
    }
}

/// The tier of every axis at one point in time.
///
/// The default is the nominal state a machine is assumed to boot in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub thermal: ThermalState,
    pub power: PowerSource,
    pub memory: MemoryPressure,
}

impl TierSnapshot {
    /// Fold a sample in. Axes the sample omits keep their previous tier.
    pub fn advance(&self, sample: &HardwareSample) -> TierSnapshot {
        TierSnapshot {
            thermal: sample.thermal.unwrap_or(self.thermal),
            power: sample.power.unwrap_or(self.power),
            memory: sample.memory_pressure().unwrap_or(self.memory),
        }
    }

    /// Axes whose tier differs between `self` and `next`.
    pub fn changes(&self, next: &TierSnapshot) -> Vec<EventKind> {
        let mut changed = Vec::with_capacity(3);
        if self.thermal != next.thermal {
            changed.push(EventKind::Thermal);
        }
        if self.power != next.power {
            changed.push(EventKind::Power);
        }
        if self.memory != next.memory {
            changed.push(EventKind::Memory);
        }
        changed
    }
}

/// A tier transition delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareEvent {
    pub changed: Vec<EventKind>,
    pub previous: TierSnapshot,
    pub current: TierSnapshot,
    pub sample: HardwareSample,
}

impl HardwareEvent {
    pub fn changed(&self, kind: EventKind) -> bool {
        self.changed.contains(&kind)
    }
}

/// Thresholds used to turn raw counter values into tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    /// Memory utilization fractions at which each tier begins.
    pub memory_warning: f64,
    pub memory_urgent: f64,
    pub memory_critical: f64,
    /// Temperatures (°C) at which each thermal tier begins.
    pub thermal_warm_c: f32,
    pub thermal_hot_c: f32,
    pub thermal_throttled_c: f32,
    pub thermal_critical_c: f32,
    /// Battery percentage below which the power source is `LowBattery`.
    pub low_battery_percent: f32,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            memory_warning: 0.75,
            memory_urgent: 0.85,
            memory_critical: 0.95,
            thermal_warm_c: 70.0,
            thermal_hot_c: 80.0,
            thermal_throttled_c: 90.0,
            thermal_critical_c: 100.0,
            low_battery_percent: 20.0,
        }
    }
}

impl TierThresholds {
    pub fn memory_tier(&self, utilization: f64) -> MemoryPressure {
        if utilization >= self.memory_critical {
            MemoryPressure::Critical
        } else if utilization >= self.memory_urgent {
            MemoryPressure::Urgent
        } else if utilization >= self.memory_warning {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        }
    }

    pub fn thermal_tier(&self, celsius: f32) -> ThermalState {
        if celsius >= self.thermal_critical_c {
            ThermalState::Critical
        } else if celsius >= self.thermal_throttled_c {
            ThermalState::Throttled
        } else if celsius >= self.thermal_hot_c {
            ThermalState::Hot
        } else if celsius >= self.thermal_warm_c {
            ThermalState::Warm
        } else {
            ThermalState::Normal
        }
    }

    pub fn power_tier(&self, reading: PowerReading) -> PowerSource {
        if reading.on_ac {
            return PowerSource::Ac;
        }
        match reading.battery_percent {
            Some(pct) if pct < self.low_battery_percent => PowerSource::LowBattery,
            _ => PowerSource::Battery,
        }
    }

    /// Highest memory utilization that still classifies as `Warning` or lower.
    pub fn warning_ceiling(&self) -> f64 {
        self.memory_urgent
    }
}

/// Raw thermal reading from a sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThermalReading {
    /// Hottest component temperature.
    Celsius(f32),
    /// The platform reports a tier directly.
    State(ThermalState),
}

/// Raw power reading from a sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub on_ac: bool,
    pub battery_percent: Option<f32>,
}

/// Platform counters sampled once per monitor tick.
///
/// Reads are blocking and run on the blocking pool. Each method fails
/// independently; the monitor omits the affected field for that tick.
pub trait SensorSource: Send {
    fn name(&self) -> &str;

    /// Refresh cached platform state before the per-field reads.
    fn refresh(&mut self) {}

    /// CPU utilization as a fraction.
    fn cpu_utilization(&mut self) -> Result<f32, SensorError>;

    /// `(used_bytes, total_bytes)`.
    fn memory(&mut self) -> Result<(u64, u64), SensorError>;

    fn thermal(&mut self) -> Result<ThermalReading, SensorError>;

    fn power(&mut self) -> Result<PowerReading, SensorError>;

    fn accelerator_utilization(&mut self) -> Result<f32, SensorError> {
        Err(SensorError::Unsupported("accelerator_utilization"))
    }

    fn gpu_utilization(&mut self) -> Result<f32, SensorError> {
        Err(SensorError::Unsupported("gpu_utilization"))
    }
}
