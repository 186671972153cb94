//! SafeTensors loader.
//!
//! File layout: 8-byte little-endian header length, a JSON header mapping
//! tensor names to `{dtype, shape, data_offsets}`, then the raw tensor data.
//! Every tensor's offsets must fall inside the data section.

use std::collections::HashMap;
use std::path::Path;

use kiln_kernel::ModelLoadError;
use kiln_kernel::loader::{FileProbe, LoadRequest, LoadedModel, ModelLoader};
use kiln_kernel::model::{Capability, ModelDescriptor, ModelFormat, ModelPayload, Quantization};
use serde::Deserialize;

use super::map_file;

const MAX_HEADER: u64 = 100 << 20;

pub struct SafeTensorsLoader;

#[derive(Debug, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: [u64; 2],
}

struct Summary {
    parameters: u64,
    dominant_dtype: Option<String>,
    architecture: Option<String>,
}

fn header_len(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

fn parse(path: &Path, bytes: &[u8]) -> Result<Summary, ModelLoadError> {
    let file_len = bytes.len() as u64;
    let len = header_len(bytes)
        .ok_or_else(|| ModelLoadError::corrupt(path, "header_length", "file shorter than 8 bytes"))?;
    if len > MAX_HEADER || len + 8 > file_len {
        return Err(ModelLoadError::corrupt(
            path,
            "header_length",
            format!("header length {len} exceeds file size {file_len}"),
        ));
    }

    let header_end = 8 + len as usize;
    let mut header: HashMap<String, serde_json::Value> = serde_json::from_slice(&bytes[8..header_end])
        .map_err(|e| ModelLoadError::corrupt(path, "header_json", e.to_string()))?;

    let architecture = header
        .remove("__metadata__")
        .and_then(|m| m.get("architecture").and_then(|a| a.as_str()).map(str::to_owned));

    if header.is_empty() {
        return Err(ModelLoadError::corrupt(path, "tensors", "header lists no tensors"));
    }

    let data_len = file_len - header_end as u64;
    let mut parameters = 0u64;
    let mut bytes_by_dtype: HashMap<String, u64> = HashMap::new();

    for (name, value) in header {
        let info: TensorInfo = serde_json::from_value(value)
            .map_err(|e| ModelLoadError::corrupt(path, "tensor_info", format!("{name}: {e}")))?;
        let [start, end] = info.data_offsets;
        if start > end || end > data_len {
            return Err(ModelLoadError::corrupt(
                path,
                "data_offsets",
                format!("{name}: [{start}, {end}) outside data section of {data_len} bytes"),
            ));
        }
        let elements = info
            .shape
            .iter()
            .try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| ModelLoadError::corrupt(path, "shape", format!("{name}: element count overflows")))?;
        parameters = parameters
            .checked_add(elements)
            .ok_or_else(|| ModelLoadError::corrupt(path, "shape", "parameter count overflows"))?;
        *bytes_by_dtype.entry(info.dtype).or_default() += end - start;
    }

    let dominant_dtype = bytes_by_dtype
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(dtype, _)| dtype);

    Ok(Summary {
        parameters,
        dominant_dtype,
        architecture,
    })
}

impl ModelLoader for SafeTensorsLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::SafeTensors
    }

    fn name(&self) -> &str {
        "safetensors"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["safetensors"]
    }

    /// Plausible header length followed by a JSON object.
    fn sniff(&self, probe: &FileProbe) -> bool {
        if probe.is_dir {
            return false;
        }
        match header_len(&probe.head) {
            Some(len) => {
                len >= 2
                    && len.checked_add(8).is_some_and(|end| end <= probe.len)
                    && probe.head.get(8) == Some(&b'{')
            }
            None => false,
        }
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError> {
        let path = request.path.as_path();
        let map = map_file(path)?;
        let summary = parse(path, &map)?;

        let quantization = summary
            .dominant_dtype
            .as_deref()
            .map(Quantization::from_dtype)
            .unwrap_or(Quantization::Unknown);

        let descriptor = ModelDescriptor {
            id: request.id.clone(),
            format: ModelFormat::SafeTensors,
            path: path.to_path_buf(),
            size_bytes: map.len() as u64,
            parameter_count: summary.parameters,
            quantization,
            capabilities: Capability::infer(&request.id, summary.architecture.as_deref()),
            architecture: summary.architecture,
            context_length: None,
            checksum: None,
        };
        Ok(LoadedModel {
            descriptor,
            payload: ModelPayload::Mapped(map),
        })
    }
}
