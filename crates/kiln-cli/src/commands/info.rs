//! `kiln info` command implementation
//!
//! Prints the hardware profile the runtime would use and what each backend
//! can do on this machine.

use std::path::Path;

use colored::Colorize;
use kiln_kernel::BackendAvailability;
use kiln_kernel::hardware::HardwareProfile;
use serde_json::json;

use crate::output::{OutputFormat, human_bytes, print_json, table};

/// Execute the `kiln info` command
pub async fn run(config: Option<&Path>, format: OutputFormat) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let runtime = super::build_runtime(config)?;
    let dispatcher = runtime.dispatcher();
    let capabilities = dispatcher.capabilities();

    if format == OutputFormat::Json {
        return print_json(&json!({
            "version": env!("CARGO_PKG_VERSION"),
            "profile": runtime.profile(),
            "capabilities": capabilities,
            "directive": dispatcher.directive_state(),
        }));
    }

    println!();
    println!("  {}  {}", "Kiln".bold(), env!("CARGO_PKG_VERSION").yellow());
    println!();
    print_profile(runtime.profile());

    let mut rows = table(&["Backend", "Status", "Enabled", "Formats", "Batch"]);
    for cap in &capabilities {
        let status = match &cap.availability {
            BackendAvailability::Available => "available".green().to_string(),
            BackendAvailability::Unavailable { reason } => format!("{} ({reason})", "unavailable".red()),
        };
        let formats = cap
            .formats
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        rows.add_row(vec![
            cap.backend.to_string(),
            status,
            if cap.enabled { "yes" } else { "no" }.to_string(),
            formats,
            cap.recommended_batch_size.to_string(),
        ]);
    }
    println!("{rows}");
    println!("  Directive: {}", dispatcher.directive().to_string().cyan());
    println!();
    Ok(())
}

fn print_profile(profile: &HardwareProfile) {
    println!("  {}", "Hardware".bold());
    println!("    OS:           {:?}", profile.os);
    println!("    CPU:          {:?}", profile.cpu_family);
    println!(
        "    CPU cores:    {} performance, {} efficiency",
        profile.performance_cores.to_string().yellow(),
        profile.efficiency_cores.to_string().yellow()
    );
    let gpu = match &profile.gpu_kind {
        Some(kind) => format!("{} cores ({kind:?})", profile.gpu_cores),
        None => "none".to_string(),
    };
    println!("    GPU:          {}", gpu.yellow());
    let accelerator = if profile.accelerator_available() {
        format!("{} cores", profile.accelerator_cores)
    } else {
        "none".to_string()
    };
    println!("    Accelerator:  {}", accelerator.yellow());
    println!(
        "    Memory:       {} at {:.0} GB/s",
        human_bytes(profile.total_memory_bytes).yellow(),
        profile.memory_bandwidth_gbps
    );
    println!();
}
