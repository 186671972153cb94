use std::sync::Arc;
use std::time::Duration;

use kiln_foundation::controller::AxisLevels;
use kiln_foundation::{AxisLevel, EngineSet, LoadOptions};
use kiln_kernel::engine::GenerationConfig;
use kiln_kernel::hardware::{HardwareProfile, HardwareSample, MemoryPressure, PowerSource, ThermalState};
use kiln_kernel::{ComputeBackend, Directive, DirectiveSource};
use kiln_runtime::{Runtime, RuntimeConfig};
use kiln_testing::fixtures::write_gguf;
use kiln_testing::{GIB, GatedEngine, apple_silicon_profile, scripted_runtime};

const MIB: u64 = 1 << 20;

fn small_machine() -> HardwareProfile {
    HardwareProfile {
        total_memory_bytes: 4 * GIB,
        ..apple_silicon_profile()
    }
}

async fn load_in_order(runtime: &Runtime, dir: &std::path::Path, names: &[&str]) {
    for name in names {
        let path = write_gguf(dir, &format!("{name}.gguf"), 256 * MIB).unwrap();
        runtime.registry().load(&path, LoadOptions::new()).await.unwrap();
        // Keeps last-access timestamps distinct.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn critical_memory(used: u64, total: u64) -> HardwareSample {
    HardwareSample::new().with_memory(used, total, MemoryPressure::Critical)
}

#[tokio::test]
async fn memory_critical_evicts_least_recently_used_models() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, _script) = scripted_runtime(small_machine(), EngineSet::reference(None), RuntimeConfig::default());
    load_in_order(&runtime, dir.path(), &["first", "second", "third"]).await;

    runtime
        .router()
        .generate("first", "Hello", GenerationConfig::default().with_max_tokens(4))
        .await
        .unwrap();

    let total = 4 * GIB;
    let used = (total as f64 * 0.96) as u64;
    runtime.monitor().ingest(critical_memory(used, total));
    assert_eq!(runtime.controller().levels().memory, AxisLevel::Critical);

    let report = runtime.controller().settle().await.expect("eviction should have run");
    assert_eq!(report.evicted, vec!["second", "third"]);
    assert_eq!(report.forced, 0);
    // 256 MiB files carry a 20% runtime overhead.
    let footprint = (256 * MIB) as f64 * 1.2;
    assert!(report.freed_bytes as f64 >= 2.0 * footprint - 1.0);

    let remaining: Vec<String> = runtime.registry().list().into_iter().map(|m| m.id).collect();
    assert_eq!(remaining, vec!["first"]);

    // Staying critical is not a new edge.
    runtime.monitor().ingest(critical_memory(used, total));
    assert!(runtime.controller().settle().await.is_none());
}

#[tokio::test]
async fn eviction_skips_busy_models_when_idle_ones_suffice() {
    let dir = tempfile::tempdir().unwrap();
    let engine = GatedEngine::new(ComputeBackend::Cpu).gated();
    let (runtime, _script) = scripted_runtime(
        HardwareProfile::cpu_only(4, 4 * GIB),
        EngineSet::new().with_engine(Arc::new(engine.clone())),
        RuntimeConfig::default(),
    );
    load_in_order(&runtime, dir.path(), &["busy", "idle"]).await;

    let router = runtime.router().clone();
    let generation = tokio::spawn(async move { router.generate("busy", "hold", GenerationConfig::default()).await });
    engine.counters().wait_started(1).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    runtime.registry().touch("idle").unwrap();

    // `busy` is now least recently used, but holds its generation lock.
    let candidates = runtime.registry().lru_candidates();
    assert_eq!(candidates[0].id, "busy");
    assert!(candidates[0].busy);

    let total = 4 * GIB;
    let used = (total as f64 * 0.85) as u64 + 100 * MIB;
    runtime.monitor().ingest(critical_memory(used, total));
    let report = runtime.controller().settle().await.unwrap();
    assert_eq!(report.evicted, vec!["idle"]);
    assert_eq!(report.forced, 0);
    assert!(runtime.registry().contains("busy"));

    engine.open(1);
    generation.await.unwrap().unwrap();
}

#[tokio::test]
async fn recovery_rearms_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, _script) = scripted_runtime(small_machine(), EngineSet::reference(None), RuntimeConfig::default());
    load_in_order(&runtime, dir.path(), &["a", "b"]).await;
    let total = 4 * GIB;
    let used = (total as f64 * 0.85) as u64 + 10 * MIB;

    runtime.monitor().ingest(critical_memory(used, total));
    assert_eq!(runtime.controller().settle().await.unwrap().evicted, vec!["a"]);

    runtime
        .monitor()
        .ingest(HardwareSample::new().with_memory(total / 2, total, MemoryPressure::Warning));
    assert_eq!(runtime.controller().levels().memory, AxisLevel::Normal);

    runtime.monitor().ingest(critical_memory(used, total));
    assert_eq!(runtime.controller().settle().await.unwrap().evicted, vec!["b"]);
    assert!(runtime.registry().is_empty());
}

#[tokio::test]
async fn pressure_directives_follow_the_worst_axis() {
    let (runtime, _script) = scripted_runtime(apple_silicon_profile(), EngineSet::reference(None), RuntimeConfig::default());
    let dispatcher = runtime.dispatcher();
    let monitor = runtime.monitor();

    monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Hot));
    let state = dispatcher.directive_state();
    assert_eq!(state.directive, Directive::PreferAccelerator);
    assert_eq!(state.source, DirectiveSource::Thermal);

    // Thermal keeps precedence while power is also elevated.
    monitor.ingest(HardwareSample::new().with_power(PowerSource::LowBattery));
    assert_eq!(dispatcher.directive_state().source, DirectiveSource::Thermal);

    monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Normal));
    let state = dispatcher.directive_state();
    assert_eq!(state.directive, Directive::PreferAccelerator);
    assert_eq!(state.source, DirectiveSource::Power);

    monitor.ingest(HardwareSample::new().with_power(PowerSource::Ac));
    assert_eq!(dispatcher.directive_state().directive, Directive::NoPreference);
    assert_eq!(runtime.controller().levels(), AxisLevels::default());
}

#[tokio::test]
async fn operator_directives_survive_pressure_recovery() {
    let (runtime, _script) = scripted_runtime(apple_silicon_profile(), EngineSet::reference(None), RuntimeConfig::default());
    let dispatcher = runtime.dispatcher();

    dispatcher.apply_directive(Directive::PreferGpu);
    runtime
        .monitor()
        .ingest(HardwareSample::new().with_thermal(ThermalState::Critical));
    assert_eq!(dispatcher.directive_state().source, DirectiveSource::Thermal);

    dispatcher.apply_directive(Directive::PreferGpu);
    runtime
        .monitor()
        .ingest(HardwareSample::new().with_thermal(ThermalState::Warm));
    let state = dispatcher.directive_state();
    assert_eq!(state.directive, Directive::PreferGpu);
    assert_eq!(state.source, DirectiveSource::Operator);
}
