//! Kiln Testing Framework
//!
//! Scripted sensors, controllable engines and model-file fixtures for
//! exercising the runtime without real hardware counters or native
//! inference libraries.

pub mod engine;
pub mod fixtures;
pub mod loader;
pub mod sensors;

pub use engine::{EngineCounters, GatedEngine};
pub use loader::CountingLoader;
pub use sensors::{Reading, ScriptedSensors, SensorScript};

use kiln_foundation::EngineSet;
use kiln_kernel::hardware::{CpuFamily, GpuKind, HardwareProfile, OsClassification};
use kiln_runtime::{Runtime, RuntimeBuilder, RuntimeConfig};

pub const GIB: u64 = 1 << 30;

/// An M-series style machine: 16 accelerator cores, 10 GPU cores, 16 GiB.
pub fn apple_silicon_profile() -> HardwareProfile {
    HardwareProfile {
        os: OsClassification::MacOS,
        cpu_family: CpuFamily::AppleSilicon,
        accelerator_cores: 16,
        gpu_cores: 10,
        gpu_kind: Some(GpuKind::Metal),
        performance_cores: 8,
        efficiency_cores: 4,
        total_memory_bytes: 16 * GIB,
        memory_bandwidth_gbps: 100.0,
    }
}

/// Build a runtime on `profile` fed by scripted sensors that start idle.
///
/// The runtime is not started; drive the monitor with
/// [`kiln_foundation::HardwareMonitor::ingest`] or start it and push
/// readings through the returned script.
pub fn scripted_runtime(
    profile: HardwareProfile,
    engines: EngineSet,
    config: RuntimeConfig,
) -> (Runtime, SensorScript) {
    let (sensors, script) = ScriptedSensors::new(Reading::idle(profile.total_memory_bytes));
    let runtime = RuntimeBuilder::new()
        .with_config(config)
        .with_profile(profile)
        .with_sensors(Box::new(sensors))
        .with_engines(engines)
        .build()
        .unwrap_or_else(|report| panic!("test runtime failed to build: {report:?}"));
    (runtime, script)
}

/// Assert that an expression is `Err` matching a [`kiln_kernel::RuntimeError`] pattern.
#[macro_export]
macro_rules! assert_runtime_err {
    ($result:expr, $pattern:pat) => {
        match $result {
            Err(ref e) if matches!(e, $pattern) => {}
            Err(ref e) => panic!("expected {}, got error {e:?}", stringify!($pattern)),
            Ok(_) => panic!("expected {}, got Ok", stringify!($pattern)),
        }
    };
}
