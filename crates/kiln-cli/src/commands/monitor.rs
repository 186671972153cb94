//! `kiln monitor` command implementation

use std::path::Path;
use std::time::Duration;

use colored::Colorize;
use kiln_kernel::hardware::{EventFilter, EventKind, HardwareEvent, HardwareSample};

use crate::output::{OutputFormat, human_bytes};

/// Execute the `kiln monitor` command
pub async fn run(
    config: Option<&Path>,
    format: OutputFormat,
    count: usize,
    interval_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = super::load_config(config)?;
    if let Some(ms) = interval_ms {
        config.monitor = config
            .monitor
            .with_interval(Duration::from_millis(ms))
            .map_err(anyhow::Error::msg)?;
    }
    let runtime = super::build_runtime(config)?;
    let monitor = runtime.monitor().clone();

    if format == OutputFormat::Text {
        monitor.subscribe(EventFilter::All, print_event);
    }
    let mut samples = monitor.watch();
    runtime.start().map_err(|report| anyhow::anyhow!("{report:?}"))?;

    let mut seen = 0;
    while seen < count {
        tokio::select! {
            changed = samples.changed() => {
                if changed.is_err() {
                    break;
                }
                let sample = samples.borrow_and_update().clone();
                if let Some(sample) = sample {
                    match format {
                        OutputFormat::Json => println!("{}", serde_json::to_string(&sample)?),
                        OutputFormat::Text => print_sample(&sample),
                    }
                    seen += 1;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let health = monitor.health();
    tracing::debug!(?health, "monitor finished");
    super::shutdown(runtime).await
}

fn print_sample(sample: &HardwareSample) {
    let pct = |v: Option<f32>| v.map_or_else(|| "-".to_string(), |v| format!("{:>5.1}%", v * 100.0));
    let memory = sample.memory.map_or_else(
        || "-".to_string(),
        |m| {
            format!(
                "{} / {} ({})",
                human_bytes(m.used_bytes),
                human_bytes(m.total_bytes),
                m.pressure
            )
        },
    );
    let thermal = sample.thermal.map_or_else(|| "-".to_string(), |t| t.to_string());
    let power = sample.power.map_or_else(|| "-".to_string(), |p| p.to_string());
    println!(
        "{}  cpu {}  gpu {}  ane {}  mem {}  thermal {}  power {}",
        sample.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
        pct(sample.cpu_utilization),
        pct(sample.gpu_utilization),
        pct(sample.accelerator_utilization),
        memory,
        thermal,
        power,
    );
}

fn print_event(event: &HardwareEvent) {
    for kind in &event.changed {
        let line = match kind {
            EventKind::Thermal => format!("thermal {} -> {}", event.previous.thermal, event.current.thermal),
            EventKind::Power => format!("power {} -> {}", event.previous.power, event.current.power),
            EventKind::Memory => format!("memory {} -> {}", event.previous.memory, event.current.memory),
        };
        println!("  {} {}", "▲".yellow(), line.yellow());
    }
}
