//! CLI command definitions using clap

use crate::output::OutputFormat;
use clap::{Parser, Subcommand};
use kiln_kernel::ComputeBackend;
use std::path::PathBuf;

/// Kiln - hardware-adaptive local model runtime
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json)
    #[arg(short = 'o', long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Runtime configuration file (TOML, YAML or JSON)
    #[arg(short = 'c', long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Show the detected hardware profile and backend capabilities
    Info,

    /// Print live hardware samples and tier changes
    Monitor {
        /// Stop after this many samples
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Sampling interval in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },

    /// Scan a directory and describe every model file in it
    Models {
        /// Directory to scan
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Descend into subdirectories (bundles are never descended into)
        #[arg(short, long)]
        recursive: bool,

        /// Verify and print sha-256 checksums
        #[arg(long)]
        checksum: bool,
    },

    /// Load a model and run one generation
    Generate {
        /// Model file or bundle
        model: PathBuf,

        /// Prompt text
        prompt: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Load a model and run one chat completion
    Chat {
        /// Model file or bundle
        model: PathBuf,

        /// User messages, in order
        #[arg(required = true)]
        messages: Vec<String>,

        /// System message placed before the user messages
        #[arg(short, long)]
        system: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },
}

/// Options shared by `generate` and `chat`
#[derive(clap::Args)]
pub struct RunArgs {
    /// Model id (defaults to the file stem)
    #[arg(long)]
    pub id: Option<String>,

    /// Backend preference: cpu, gpu, accelerator or auto
    #[arg(short, long, default_value = "auto", value_parser = parse_backend)]
    pub backend: ComputeBackend,

    /// Maximum tokens to generate
    #[arg(short, long)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(short, long, default_value_t = 0.7)]
    pub temperature: f32,

    /// Print tokens as they are produced
    #[arg(short, long)]
    pub stream: bool,
}

fn parse_backend(value: &str) -> Result<ComputeBackend, String> {
    value.parse()
}
