//! Model file fixtures.
//!
//! Files are padded with `set_len`, so large fixtures are sparse and cost
//! almost nothing on disk.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// GGUF `general.file_type` for Q4_K_M.
pub const GGUF_Q4_K_M: u32 = 15;

/// Write a GGUF v3 llama file quantized as Q4_K_M, zero-padded up to
/// `size_bytes`.
pub fn write_gguf(dir: &Path, file_name: &str, size_bytes: u64) -> io::Result<PathBuf> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"GGUF");
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // tensors
    buf.extend_from_slice(&3u64.to_le_bytes()); // metadata entries
    kv_string(&mut buf, "general.architecture", "llama");
    kv_u32(&mut buf, "general.file_type", GGUF_Q4_K_M);
    kv_u32(&mut buf, "llama.context_length", 4096);
    write_padded(dir, file_name, &buf, size_bytes)
}

/// Header bytes reserved by [`write_safetensors`]; JSON allows the
/// trailing-space padding.
const SAFETENSORS_HEADER_WIDTH: usize = 256;

/// Write a SafeTensors file holding one F16 tensor that fills the file up to
/// `size_bytes` (rounded down to an even data length).
pub fn write_safetensors(dir: &Path, file_name: &str, size_bytes: u64) -> io::Result<PathBuf> {
    let reserved = 8 + SAFETENSORS_HEADER_WIDTH as u64;
    let data = size_bytes.saturating_sub(reserved) & !1;
    let json = serde_json::json!({
        "__metadata__": {"architecture": "mistral"},
        "weight": {"dtype": "F16", "shape": [data / 2], "data_offsets": [0, data]},
    })
    .to_string();
    let header = format!("{json:<SAFETENSORS_HEADER_WIDTH$}");

    let mut buf = Vec::with_capacity(8 + header.len());
    buf.extend_from_slice(&(header.len() as u64).to_le_bytes());
    buf.extend_from_slice(header.as_bytes());
    write_padded(dir, file_name, &buf, reserved + data)
}

/// Write arbitrary bytes that no loader recognises.
pub fn write_garbage(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    write_padded(dir, file_name, b"definitely not a model", 0)
}

fn write_padded(dir: &Path, file_name: &str, head: &[u8], size_bytes: u64) -> io::Result<PathBuf> {
    let path = dir.join(file_name);
    let mut file = File::create(&path)?;
    file.write_all(head)?;
    if size_bytes > head.len() as u64 {
        file.set_len(size_bytes)?;
    }
    file.sync_all()?;
    Ok(path)
}

fn kv_key(buf: &mut Vec<u8>, key: &str, ty: u32) {
    buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&ty.to_le_bytes());
}

fn kv_string(buf: &mut Vec<u8>, key: &str, value: &str) {
    kv_key(buf, key, 8);
    buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn kv_u32(buf: &mut Vec<u8>, key: &str, value: u32) {
    kv_key(buf, key, 4);
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_foundation::ModelLoaderRegistry;
    use kiln_kernel::model::{ModelFormat, Quantization};

    #[test]
    fn gguf_fixture_loads_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_gguf(dir.path(), "tiny.gguf", 1 << 20).unwrap();
        let loaded = ModelLoaderRegistry::with_builtin().load(&path, None).unwrap();
        assert_eq!(loaded.descriptor.format, ModelFormat::Gguf);
        assert_eq!(loaded.descriptor.size_bytes, 1 << 20);
        assert_eq!(loaded.descriptor.quantization, Quantization::Q4KM);
        assert_eq!(loaded.descriptor.architecture.as_deref(), Some("llama"));
        assert_eq!(loaded.descriptor.context_length, Some(4096));
    }

    #[test]
    fn safetensors_fixture_fills_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_safetensors(dir.path(), "model.safetensors", 4096).unwrap();
        let loaded = ModelLoaderRegistry::with_builtin().load(&path, None).unwrap();
        assert_eq!(loaded.descriptor.format, ModelFormat::SafeTensors);
        assert_eq!(loaded.descriptor.size_bytes, 4096);
        assert_eq!(loaded.descriptor.quantization, Quantization::F16);
        assert_eq!(loaded.descriptor.architecture.as_deref(), Some("mistral"));
    }
}
