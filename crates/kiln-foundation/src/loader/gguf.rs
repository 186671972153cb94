//! GGUF loader.
//!
//! Validates the header (magic, version, bounded counts) and walks the
//! metadata key/value section to pick out architecture, name, file type and
//! context length. Tensor data is never touched.

use std::path::Path;

use kiln_kernel::ModelLoadError;
use kiln_kernel::loader::{FileProbe, LoadRequest, LoadedModel, ModelLoader};
use kiln_kernel::model::{
    Capability, ModelDescriptor, ModelFormat, ModelPayload, Quantization, estimate_parameters,
};

use super::map_file;

const MAGIC: &[u8; 4] = b"GGUF";
const MAX_TENSORS: u64 = 1 << 20;
const MAX_METADATA: u64 = 1 << 16;
const MAX_STRING: u64 = 1 << 24;
const MAX_ARRAY: u64 = 1 << 28;

pub struct GgufLoader;

#[derive(Debug, Default)]
struct GgufMetadata {
    architecture: Option<String>,
    name: Option<String>,
    file_type: Option<u32>,
    context_length: Option<u64>,
}

/// Metadata value as far as the walk cares.
enum Value {
    Uint(u64),
    Str(String),
    Other,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    version: u32,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| format!("unexpected end of file at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    /// Counts and lengths are u32 in version 1, u64 afterwards.
    fn count(&mut self) -> Result<u64, String> {
        if self.version == 1 { self.u32().map(u64::from) } else { self.u64() }
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.count()?;
        if len > MAX_STRING {
            return Err(format!("string length {len} exceeds limit"));
        }
        let bytes = self.take(len as usize)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn value(&mut self, ty: u32) -> Result<Value, String> {
        let v = match ty {
            0 | 1 | 7 => Value::Uint(u64::from(self.take(1)?[0])),
            2 | 3 => {
                let b = self.take(2)?;
                Value::Uint(u64::from(u16::from_le_bytes([b[0], b[1]])))
            }
            4 => Value::Uint(u64::from(self.u32()?)),
            5 | 6 => {
                self.take(4)?;
                Value::Other
            }
            8 => Value::Str(self.string()?),
            9 => {
                let elem = self.u32()?;
                let n = self.count()?;
                if n > MAX_ARRAY {
                    return Err(format!("array length {n} exceeds limit"));
                }
                match fixed_width(elem) {
                    Some(w) => {
                        let total = (n as usize)
                            .checked_mul(w)
                            .ok_or_else(|| "array size overflow".to_string())?;
                        self.take(total)?;
                    }
                    None => {
                        for _ in 0..n {
                            self.value(elem)?;
                        }
                    }
                }
                Value::Other
            }
            10 => Value::Uint(self.u64()?),
            11 | 12 => {
                self.take(8)?;
                Value::Other
            }
            other => return Err(format!("unknown metadata value type {other}")),
        };
        Ok(v)
    }
}

fn fixed_width(ty: u32) -> Option<usize> {
    match ty {
        0 | 1 | 7 => Some(1),
        2 | 3 => Some(2),
        4..=6 => Some(4),
        10..=12 => Some(8),
        _ => None,
    }
}

fn parse(path: &Path, bytes: &[u8]) -> Result<GgufMetadata, ModelLoadError> {
    if bytes.len() < 8 || &bytes[..4] != MAGIC {
        return Err(ModelLoadError::corrupt(path, "magic", "missing GGUF magic"));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if !(1..=3).contains(&version) {
        return Err(ModelLoadError::corrupt(
            path,
            "version",
            format!("unsupported GGUF version {version}"),
        ));
    }

    let mut cur = Cursor { bytes, pos: 8, version };
    let header = |e: String| ModelLoadError::corrupt(path, "header", e);
    let tensors = cur.count().map_err(header)?;
    let kv_count = cur.count().map_err(header)?;
    if tensors > MAX_TENSORS {
        return Err(ModelLoadError::corrupt(path, "tensor_count", format!("{tensors} tensors")));
    }
    if kv_count > MAX_METADATA {
        return Err(ModelLoadError::corrupt(path, "metadata_count", format!("{kv_count} entries")));
    }

    let mut meta = GgufMetadata::default();
    let walk = |e: String| ModelLoadError::corrupt(path, "metadata", e);
    for _ in 0..kv_count {
        let key = cur.string().map_err(walk)?;
        let ty = cur.u32().map_err(walk)?;
        let value = cur.value(ty).map_err(walk)?;
        match (key.as_str(), value) {
            ("general.architecture", Value::Str(s)) => meta.architecture = Some(s),
            ("general.name", Value::Str(s)) => meta.name = Some(s),
            ("general.file_type", Value::Uint(n)) => meta.file_type = u32::try_from(n).ok(),
            (k, Value::Uint(n)) if k.ends_with(".context_length") => meta.context_length = Some(n),
            _ => {}
        }
    }
    Ok(meta)
}

impl ModelLoader for GgufLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    fn name(&self) -> &str {
        "gguf"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["gguf"]
    }

    fn sniff(&self, probe: &FileProbe) -> bool {
        !probe.is_dir && probe.head.starts_with(MAGIC)
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError> {
        let path = request.path.as_path();
        let map = map_file(path)?;
        let meta = parse(path, &map)?;

        let quantization = meta
            .file_type
            .map(Quantization::from_gguf_file_type)
            .unwrap_or(Quantization::Unknown);
        let size_bytes = map.len() as u64;
        let capabilities = Capability::infer(
            meta.name.as_deref().unwrap_or(&request.id),
            meta.architecture.as_deref(),
        );

        let descriptor = ModelDescriptor {
            id: request.id.clone(),
            format: ModelFormat::Gguf,
            path: path.to_path_buf(),
            size_bytes,
            parameter_count: estimate_parameters(size_bytes, &quantization),
            quantization,
            capabilities,
            architecture: meta.architecture,
            context_length: meta.context_length,
            checksum: None,
        };
        Ok(LoadedModel {
            descriptor,
            payload: ModelPayload::Mapped(map),
        })
    }
}
