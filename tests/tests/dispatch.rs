use std::sync::Arc;

use kiln_foundation::{ComputeDispatcher, DispatchConfig, EngineSet};
use kiln_kernel::backend::{ComputeBackend, Directive, Workload, WorkloadKind};
use kiln_kernel::hardware::{HardwareProfile, HardwareSample, ThermalState};
use kiln_kernel::{BackendAvailability, RuntimeError};
use kiln_runtime::RuntimeConfig;
use kiln_testing::{GIB, apple_silicon_profile, scripted_runtime};

fn profiles() -> Vec<(&'static str, HardwareProfile)> {
    let full = apple_silicon_profile();
    let mut no_accelerator = full.clone();
    no_accelerator.accelerator_cores = 0;
    let mut no_gpu = full.clone();
    no_gpu.gpu_cores = 0;
    no_gpu.gpu_kind = None;
    vec![
        ("full", full),
        ("no-accelerator", no_accelerator),
        ("no-gpu", no_gpu),
        ("cpu-only", HardwareProfile::cpu_only(4, 8 * GIB)),
    ]
}

fn engine_sets() -> Vec<(&'static str, EngineSet)> {
    vec![
        ("reference", EngineSet::reference(None)),
        (
            "gpu-library-missing",
            EngineSet::reference(None).with_unavailable(ComputeBackend::Gpu, "libmetal not found"),
        ),
        (
            "accelerator-library-missing",
            EngineSet::reference(None).with_unavailable(ComputeBackend::Accelerator, "coreml not found"),
        ),
        (
            "cpu-library-missing",
            EngineSet::reference(None).with_unavailable(ComputeBackend::Cpu, "no cpu engine"),
        ),
        ("empty", EngineSet::new()),
    ]
}

fn configs() -> Vec<DispatchConfig> {
    let mut out = Vec::new();
    for accelerator in [true, false] {
        for gpu in [true, false] {
            out.push(
                DispatchConfig::default()
                    .with_accelerator_enabled(accelerator)
                    .with_gpu_enabled(gpu),
            );
        }
    }
    out
}

fn workloads() -> Vec<Workload> {
    let mut large = Workload::new(WorkloadKind::Chat);
    large.model_size_bytes = Some(4 * GIB);
    let mut small = Workload::new(WorkloadKind::Generation);
    small.model_size_bytes = Some(GIB / 4);
    vec![Workload::new(WorkloadKind::Embedding), small, large]
}

#[test]
fn select_never_returns_an_unavailable_backend() {
    let preferences = [
        ComputeBackend::Cpu,
        ComputeBackend::Gpu,
        ComputeBackend::Accelerator,
        ComputeBackend::Auto,
    ];
    let directives = [Directive::NoPreference, Directive::PreferGpu, Directive::PreferAccelerator];
    let mut checked = 0;

    for (profile_name, profile) in profiles() {
        for (engines_name, engines) in engine_sets() {
            for config in configs() {
                let dispatcher =
                    ComputeDispatcher::new(Arc::new(profile.clone()), Arc::new(engines.clone()), config.clone());
                let any_available = ComputeBackend::CONCRETE
                    .into_iter()
                    .any(|b| dispatcher.availability(b).is_available());

                for directive in directives {
                    dispatcher.apply_directive(directive);
                    for workload in workloads() {
                        for preference in preferences {
                            let context = format!(
                                "{profile_name}/{engines_name}/{config:?}/{directive:?}/{workload:?}/{preference:?}"
                            );
                            match dispatcher.select(&workload, preference) {
                                Ok(backend) => {
                                    assert!(backend.is_concrete(), "{context}: returned {backend:?}");
                                    assert_eq!(
                                        dispatcher.availability(backend),
                                        BackendAvailability::Available,
                                        "{context}: returned unavailable {backend:?}"
                                    );
                                }
                                Err(RuntimeError::BackendUnavailable { .. }) => {
                                    assert!(!dispatcher.availability(ComputeBackend::Cpu).is_available(), "{context}");
                                }
                                Err(e) => panic!("{context}: unexpected error {e:?}"),
                            }
                            checked += 1;
                        }
                    }
                }

                if any_available && dispatcher.availability(ComputeBackend::Cpu).is_available() {
                    dispatcher.apply_directive(Directive::NoPreference);
                    assert!(dispatcher.select(&Workload::default(), ComputeBackend::Auto).is_ok());
                }
            }
        }
    }
    assert_eq!(checked, 4 * 5 * 4 * 3 * 3 * 4);
}

#[tokio::test]
async fn critical_thermal_sample_moves_auto_to_the_accelerator() {
    let mut config = RuntimeConfig::default();
    config.dispatch = DispatchConfig::default().with_accelerator_enabled(false);
    let (runtime, _script) = scripted_runtime(apple_silicon_profile(), EngineSet::reference(None), config);
    let dispatcher = runtime.dispatcher();
    let workload = Workload::new(WorkloadKind::Chat);

    runtime
        .monitor()
        .ingest(HardwareSample::new().with_thermal(ThermalState::Normal));
    assert_eq!(dispatcher.select(&workload, ComputeBackend::Auto).unwrap(), ComputeBackend::Gpu);

    runtime
        .monitor()
        .ingest(HardwareSample::new().with_thermal(ThermalState::Critical));
    assert_eq!(
        dispatcher.select(&workload, ComputeBackend::Auto).unwrap(),
        ComputeBackend::Accelerator
    );
    // Explicit preferences still win.
    assert_eq!(dispatcher.select(&workload, ComputeBackend::Cpu).unwrap(), ComputeBackend::Cpu);

    runtime
        .monitor()
        .ingest(HardwareSample::new().with_thermal(ThermalState::Normal));
    assert_eq!(dispatcher.select(&workload, ComputeBackend::Auto).unwrap(), ComputeBackend::Gpu);
}
