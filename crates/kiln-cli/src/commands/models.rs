//! `kiln models` command implementation
//!
//! Feeds every entry of a directory to the loader registry. Bundles
//! (`.mlpackage` and friends) are directories themselves and are handed to
//! the loaders whole.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use kiln_foundation::ModelLoaderRegistry;
use kiln_foundation::loader::checksum::sha256_hex;
use kiln_kernel::model::{ModelDescriptor, ModelFormat};
use serde::Serialize;

use crate::output::{OutputFormat, human_bytes, human_count, print_json, table};

#[derive(Debug, Serialize)]
struct ScanEntry {
    path: PathBuf,
    #[serde(flatten)]
    outcome: ScanOutcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ScanOutcome {
    Ok { descriptor: ModelDescriptor },
    Failed { format: ModelFormat, error: String },
}

/// Execute the `kiln models` command
pub async fn run(dir: &Path, recursive: bool, checksum: bool, format: OutputFormat) -> anyhow::Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let loaders = Arc::new(ModelLoaderRegistry::with_builtin());
    let root = dir.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || scan(&loaders, &root, recursive, checksum)).await??;

    if format == OutputFormat::Json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No model files found in {}", dir.display().to_string().cyan());
        return Ok(());
    }

    let mut rows = table(&["Id", "Format", "Size", "Quantization", "Parameters", "Architecture", "Status"]);
    for entry in &entries {
        match &entry.outcome {
            ScanOutcome::Ok { descriptor } => {
                let status = match &descriptor.checksum {
                    Some(sum) => format!("{} sha256:{}", "ok".green(), &sum[..12.min(sum.len())]),
                    None => "ok".green().to_string(),
                };
                rows.add_row(vec![
                    descriptor.id.clone(),
                    descriptor.format.to_string(),
                    human_bytes(descriptor.size_bytes),
                    descriptor.quantization.to_string(),
                    human_count(descriptor.parameter_count),
                    descriptor.architecture.clone().unwrap_or_else(|| "-".to_string()),
                    status,
                ]);
            }
            ScanOutcome::Failed { format, error } => {
                rows.add_row(vec![
                    entry.path.display().to_string(),
                    format.to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    "-".to_string(),
                    error.red().to_string(),
                ]);
            }
        }
    }
    println!("{rows}");
    Ok(())
}

/// Describe every recognised model under `dir`, sorted by path.
fn scan(loaders: &ModelLoaderRegistry, dir: &Path, recursive: bool, checksum: bool) -> anyhow::Result<Vec<ScanEntry>> {
    let mut entries = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for item in std::fs::read_dir(&current)? {
            let path = item?.path();
            let Some(format) = loaders.detect_format(&path) else {
                if recursive && path.is_dir() {
                    pending.push(path);
                }
                continue;
            };
            let outcome = match loaders.load(&path, Some(format)) {
                Ok(loaded) => {
                    let mut descriptor = loaded.descriptor;
                    if checksum && descriptor.checksum.is_none() {
                        descriptor.checksum = loaded.payload.as_bytes().map(sha256_hex);
                    }
                    ScanOutcome::Ok { descriptor }
                }
                Err(e) => ScanOutcome::Failed {
                    format,
                    error: e.to_string(),
                },
            };
            entries.push(ScanEntry { path, outcome });
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
