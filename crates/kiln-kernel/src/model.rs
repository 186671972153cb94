//! Model descriptors and backend-ready payloads.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

/// On-disk container format of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Gguf,
    SafeTensors,
    Onnx,
    CoreMl,
}

impl ModelFormat {
    pub const ALL: [ModelFormat; 4] = [Self::Gguf, Self::SafeTensors, Self::Onnx, Self::CoreMl];
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gguf => write!(f, "gguf"),
            Self::SafeTensors => write!(f, "safetensors"),
            Self::Onnx => write!(f, "onnx"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl std::str::FromStr for ModelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gguf" => Ok(Self::Gguf),
            "safetensors" => Ok(Self::SafeTensors),
            "onnx" => Ok(Self::Onnx),
            "coreml" | "mlmodel" | "mlpackage" => Ok(Self::CoreMl),
            other => Err(format!("unknown model format '{other}'")),
        }
    }
}

/// Weight precision / quantization scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    F32,
    F16,
    Bf16,
    Int8,
    Q8_0,
    Q6K,
    Q5KM,
    Q5_0,
    Q4KM,
    Q4KS,
    Q4_0,
    Q3K,
    Q2K,
    Unknown,
}

impl Quantization {
    /// Maps the GGUF `general.file_type` value.
    pub fn from_gguf_file_type(file_type: u32) -> Self {
        match file_type {
            0 => Self::F32,
            1 => Self::F16,
            2 | 3 => Self::Q4_0,
            7 => Self::Q8_0,
            8 | 9 => Self::Q5_0,
            10 => Self::Q2K,
            11..=13 => Self::Q3K,
            14 => Self::Q4KS,
            15 => Self::Q4KM,
            16 | 17 => Self::Q5KM,
            18 => Self::Q6K,
            32 => Self::Bf16,
            _ => Self::Unknown,
        }
    }

    /// Maps a SafeTensors dtype string.
    pub fn from_dtype(dtype: &str) -> Self {
        match dtype {
            "F32" => Self::F32,
            "F16" => Self::F16,
            "BF16" => Self::Bf16,
            "I8" | "U8" | "F8_E4M3" | "F8_E5M2" => Self::Int8,
            _ => Self::Unknown,
        }
    }

    /// Average storage cost of one weight, used to estimate parameter counts.
    pub fn bits_per_weight(&self) -> f64 {
        match self {
            Self::F32 => 32.0,
            Self::F16 | Self::Bf16 | Self::Unknown => 16.0,
            Self::Int8 | Self::Q8_0 => 8.5,
            Self::Q6K => 6.56,
            Self::Q5KM | Self::Q5_0 => 5.5,
            Self::Q4KM | Self::Q4KS | Self::Q4_0 => 4.5,
            Self::Q3K => 3.44,
            Self::Q2K => 2.63,
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::Bf16 => "BF16",
            Self::Int8 => "INT8",
            Self::Q8_0 => "Q8_0",
            Self::Q6K => "Q6_K",
            Self::Q5KM => "Q5_K_M",
            Self::Q5_0 => "Q5_0",
            Self::Q4KM => "Q4_K_M",
            Self::Q4KS => "Q4_K_S",
            Self::Q4_0 => "Q4_0",
            Self::Q3K => "Q3_K",
            Self::Q2K => "Q2_K",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// What a model can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Completion,
    Embedding,
}

impl Capability {
    /// Capabilities guessed from a model's name and architecture.
    pub fn infer(name: &str, architecture: Option<&str>) -> Vec<Capability> {
        let name = name.to_ascii_lowercase();
        let arch = architecture.unwrap_or_default().to_ascii_lowercase();
        if name.contains("embed") || arch.contains("bert") || arch.contains("nomic") {
            return vec![Capability::Embedding];
        }
        vec![Capability::Completion, Capability::Chat]
    }
}

/// Share of a model's file size added on top for runtime state (KV cache,
/// activations, engine bookkeeping).
pub const RUNTIME_OVERHEAD_FRACTION: f64 = 0.2;

/// Validated, typed description of a model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub format: ModelFormat,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Estimated parameter count.
    pub parameter_count: u64,
    pub quantization: Quantization,
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    /// Hex sha-256 of the file, when it was verified on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, format: ModelFormat, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let quantization = Quantization::Unknown;
        Self {
            id: id.into(),
            format,
            path: path.into(),
            size_bytes,
            parameter_count: estimate_parameters(size_bytes, &quantization),
            quantization,
            capabilities: vec![Capability::Completion, Capability::Chat],
            architecture: None,
            context_length: None,
            checksum: None,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn memory_footprint_bytes(&self) -> u64 {
        self.size_bytes + (self.size_bytes as f64 * RUNTIME_OVERHEAD_FRACTION) as u64
    }

    /// Human-readable parameter count, e.g. `7.2B`.
    pub fn parameter_label(&self) -> String {
        let p = self.parameter_count as f64;
        if p >= 1e9 {
            format!("{:.1}B", p / 1e9)
        } else if p >= 1e6 {
            format!("{:.0}M", p / 1e6)
        } else {
            format!("{}", self.parameter_count)
        }
    }
}

/// Parameter estimate from file size and precision.
pub fn estimate_parameters(size_bytes: u64, quantization: &Quantization) -> u64 {
    ((size_bytes as f64 * 8.0) / quantization.bits_per_weight()) as u64
}

/// Default model id for a path: the file stem, or the bundle's directory name
/// without its extension.
pub fn model_id_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

/// Backend-ready bytes of a loaded model.
#[derive(Debug, Clone)]
pub enum ModelPayload {
    /// Read-only mapping of a single-file model.
    Mapped(Arc<Mmap>),
    /// Directory bundle (Core ML packages) consumed by path.
    Bundle(PathBuf),
}

impl ModelPayload {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Mapped(map) => Some(&map[..]),
            Self::Bundle(_) => None,
        }
    }

    pub fn mapped_len(&self) -> usize {
        self.as_bytes().map_or(0, <[u8]>::len)
    }
}
