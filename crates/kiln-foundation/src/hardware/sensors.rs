//! Live platform counters backed by `sysinfo` and the OS power interfaces.

use std::path::{Path, PathBuf};
use std::process::Command;

use kiln_kernel::SensorError;
use kiln_kernel::hardware::{GpuKind, PowerReading, SensorSource, ThermalReading};
use sysinfo::{Components, CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// [`SensorSource`] for the machine the process runs on.
///
/// Keeps one `sysinfo::System` across ticks so CPU usage is computed from
/// the delta between consecutive refreshes.
pub struct SystemSensors {
    sys: System,
    components: Components,
    power_root: PathBuf,
    gpu_kind: Option<GpuKind>,
}

impl SystemSensors {
    pub fn new(gpu_kind: Option<GpuKind>) -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            sys,
            components: Components::new_with_refreshed_list(),
            power_root: PathBuf::from(POWER_SUPPLY_ROOT),
            gpu_kind,
        }
    }

    /// Read Linux power state from a different sysfs root.
    pub fn with_power_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.power_root = root.into();
        self
    }
}

impl SensorSource for SystemSensors {
    fn name(&self) -> &str {
        "system"
    }

    fn refresh(&mut self) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.components.refresh();
    }

    fn cpu_utilization(&mut self) -> Result<f32, SensorError> {
        let cpus = self.sys.cpus();
        if cpus.is_empty() {
            return Err(SensorError::read_failed("cpu", "no CPUs reported"));
        }
        let total: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        Ok((total / cpus.len() as f32 / 100.0).clamp(0.0, 1.0))
    }

    fn memory(&mut self) -> Result<(u64, u64), SensorError> {
        let total = self.sys.total_memory();
        if total == 0 {
            return Err(SensorError::read_failed("memory", "total memory reported as 0"));
        }
        Ok((self.sys.used_memory(), total))
    }

    fn thermal(&mut self) -> Result<ThermalReading, SensorError> {
        let hottest = (&self.components)
            .into_iter()
            .map(|c| c.temperature())
            .filter(|t| t.is_finite() && *t > 0.0)
            .fold(None, |acc: Option<f32>, t| Some(acc.map_or(t, |a| a.max(t))));
        hottest
            .map(ThermalReading::Celsius)
            .ok_or(SensorError::Unsupported("thermal"))
    }

    fn power(&mut self) -> Result<PowerReading, SensorError> {
        if cfg!(target_os = "macos") {
            return read_pmset();
        }
        read_power_supply(&self.power_root)
    }

    fn gpu_utilization(&mut self) -> Result<f32, SensorError> {
        if self.gpu_kind != Some(GpuKind::Cuda) {
            return Err(SensorError::Unsupported("gpu_utilization"));
        }
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
            .output()
            .map_err(|e| SensorError::read_failed("gpu_utilization", e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pct: f32 = stdout
            .lines()
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| SensorError::read_failed("gpu_utilization", "unparseable nvidia-smi output"))?;
        Ok((pct / 100.0).clamp(0.0, 1.0))
    }
}

/// Parse Linux `power_supply` class entries: any online `Mains` supply means
/// AC; otherwise the first `Battery` supplies capacity.
pub(crate) fn read_power_supply(root: &Path) -> Result<PowerReading, SensorError> {
    let entries = std::fs::read_dir(root).map_err(|_| SensorError::Unsupported("power"))?;

    let mut on_ac = false;
    let mut battery_percent = None;
    let mut saw_battery = false;

    for entry in entries.filter_map(Result::ok) {
        let dir = entry.path();
        let kind = read_trimmed(&dir.join("type")).unwrap_or_default();
        match kind.as_str() {
            "Mains" | "USB" => {
                if read_trimmed(&dir.join("online")).as_deref() == Some("1") {
                    on_ac = true;
                }
            }
            "Battery" => {
                saw_battery = true;
                if battery_percent.is_none() {
                    battery_percent = read_trimmed(&dir.join("capacity")).and_then(|c| c.parse().ok());
                }
                // A charging battery implies external power even without a Mains node.
                if read_trimmed(&dir.join("status")).as_deref() == Some("Charging") {
                    on_ac = true;
                }
            }
            _ => {}
        }
    }

    if !saw_battery {
        // Desktops and servers without a battery are always on mains power.
        return Ok(PowerReading { on_ac: true, battery_percent: None });
    }
    Ok(PowerReading { on_ac, battery_percent })
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_pmset() -> Result<PowerReading, SensorError> {
    let output = Command::new("pmset")
        .args(["-g", "batt"])
        .output()
        .map_err(|e| SensorError::read_failed("power", e.to_string()))?;
    if !output.status.success() {
        return Err(SensorError::read_failed("power", "pmset exited with failure"));
    }
    Ok(parse_pmset(&String::from_utf8_lossy(&output.stdout)))
}

/// `pmset -g batt` output: `Now drawing from 'AC Power'` then a line with `NN%;`.
pub(crate) fn parse_pmset(output: &str) -> PowerReading {
    let on_ac = output.contains("'AC Power'");
    let battery_percent = output
        .split(|c: char| c.is_whitespace() || c == ';')
        .find_map(|tok| tok.strip_suffix('%'))
        .and_then(|n| n.parse().ok());
    PowerReading { on_ac, battery_percent }
}
