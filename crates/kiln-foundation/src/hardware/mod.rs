//! Hardware profile detection and platform sensors.
//!
//! Detection uses filesystem probes and process checks (`sysctl`,
//! `system_profiler`, `nvidia-smi`, `rocm-smi`, `sycl-ls`) rather than
//! linking vendor libraries. It runs synchronously; call it from a blocking
//! context or `spawn_blocking`.

mod sensors;

pub use sensors::SystemSensors;

use std::env::consts;
use std::path::Path;
use std::process::Command;

use kiln_kernel::hardware::{CpuFamily, GpuKind, HardwareProfile, OsClassification};
use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

/// Neural Engine cores on every Apple Silicon generation shipped so far.
const APPLE_NEURAL_ENGINE_CORES: u32 = 16;

/// Operator overrides applied on top of detection.
///
/// Setting a core count to 0 disables that surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    pub accelerator_cores: Option<u32>,
    pub gpu_cores: Option<u32>,
    pub memory_bandwidth_gbps: Option<f64>,
}

impl ProfileOverrides {
    pub fn apply(&self, mut profile: HardwareProfile) -> HardwareProfile {
        if let Some(cores) = self.accelerator_cores {
            profile.accelerator_cores = cores;
        }
        if let Some(cores) = self.gpu_cores {
            profile.gpu_cores = cores;
            if cores == 0 {
                profile.gpu_kind = None;
            }
        }
        if let Some(bw) = self.memory_bandwidth_gbps {
            profile.memory_bandwidth_gbps = bw;
        }
        profile
    }
}

/// Detect the host's compute capabilities.
pub fn detect_profile() -> HardwareProfile {
    let os = match consts::OS {
        "macos" => OsClassification::MacOS,
        "windows" => OsClassification::Windows,
        "linux" => OsClassification::Linux,
        other => OsClassification::Other(other.to_string()),
    };

    let cpu_family = match consts::ARCH {
        "x86_64" => CpuFamily::X86_64,
        "aarch64" if os == OsClassification::MacOS => CpuFamily::AppleSilicon,
        "aarch64" | "arm" => CpuFamily::Arm,
        other => CpuFamily::Other(other.to_string()),
    };

    let (gpu_kind, gpu_cores) = detect_gpu(&os, &cpu_family);
    let accelerator_cores = detect_accelerator(&cpu_family);
    let (performance_cores, efficiency_cores) = detect_cpu_split(&os);

    let mut sys =
        System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()));
    sys.refresh_memory();

    let profile = HardwareProfile {
        memory_bandwidth_gbps: estimate_bandwidth(&cpu_family),
        os,
        cpu_family,
        accelerator_cores,
        gpu_cores,
        gpu_kind,
        performance_cores,
        efficiency_cores,
        total_memory_bytes: sys.total_memory(),
    };
    debug!(?profile, "hardware profile detected");
    profile
}

fn detect_gpu(os: &OsClassification, cpu: &CpuFamily) -> (Option<GpuKind>, u32) {
    match os {
        OsClassification::MacOS => {
            // Metal is present on every supported Mac.
            let cores = apple_gpu_cores().unwrap_or(if *cpu == CpuFamily::AppleSilicon { 8 } else { 1 });
            (Some(GpuKind::Metal), cores)
        }
        OsClassification::Windows | OsClassification::Linux => {
            if let Some(devices) = nvidia_devices() {
                return (Some(GpuKind::Cuda), devices);
            }
            if check_amd_gpu() {
                return (Some(GpuKind::Rocm), 1);
            }
            if check_intel_gpu() {
                return (Some(GpuKind::IntelGpu), 1);
            }
            (None, 0)
        }
        OsClassification::Other(_) => (None, 0),
    }
}

/// `Total Number of Cores` from `system_profiler SPDisplaysDataType`.
fn apple_gpu_cores() -> Option<u32> {
    let output = Command::new("system_profiler")
        .arg("SPDisplaysDataType")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("Total Number of Cores:"))
        .and_then(|v| v.trim().parse().ok())
}

/// Number of NVIDIA devices `nvidia-smi` lists; `None` when there are none.
fn nvidia_devices() -> Option<u32> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let count = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count() as u32;
    (count > 0).then_some(count)
}

fn check_amd_gpu() -> bool {
    Path::new("/dev/kfd").exists()
        && Command::new("rocm-smi")
            .arg("--showid")
            .output()
            .map(|o| o.status.success() && !o.stdout.is_empty())
            .unwrap_or(false)
}

fn check_intel_gpu() -> bool {
    Command::new("sycl-ls")
        .output()
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).contains("Intel"))
        .unwrap_or(false)
}

fn detect_accelerator(cpu: &CpuFamily) -> u32 {
    if *cpu == CpuFamily::AppleSilicon {
        return APPLE_NEURAL_ENGINE_CORES;
    }
    // Linux compute accelerators (Intel NPU, AMD XDNA) register under /dev/accel.
    std::fs::read_dir("/dev/accel")
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with("accel"))
                .count() as u32
        })
        .unwrap_or(0)
}

fn detect_cpu_split(os: &OsClassification) -> (u32, u32) {
    let logical = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);

    if *os == OsClassification::MacOS {
        let perf = sysctl_u32("hw.perflevel0.physicalcpu");
        let eff = sysctl_u32("hw.perflevel1.physicalcpu");
        if let Some(perf) = perf {
            return (perf, eff.unwrap_or(0));
        }
    }
    (logical, 0)
}

fn sysctl_u32(key: &str) -> Option<u32> {
    let output = Command::new("sysctl").args(["-n", key]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// Rough unified/system memory bandwidth in GB/s.
fn estimate_bandwidth(cpu: &CpuFamily) -> f64 {
    match cpu {
        CpuFamily::AppleSilicon => 100.0,
        CpuFamily::X86_64 => 50.0,
        CpuFamily::Arm => 30.0,
        CpuFamily::Other(_) => 20.0,
    }
}
