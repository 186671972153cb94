//! ONNX loader.
//!
//! An ONNX `ModelProto` starts with field 1 (`ir_version`, a small varint)
//! followed by a length-delimited field. That prefix is the content sniff;
//! Core ML specs share it, so `.mlmodel` files are left to the Core ML loader.

use kiln_kernel::ModelLoadError;
use kiln_kernel::loader::{FileProbe, LoadRequest, LoadedModel, ModelLoader};
use kiln_kernel::model::{
    Capability, ModelDescriptor, ModelFormat, ModelPayload, Quantization, estimate_parameters,
};

use super::map_file;

/// Highest IR version accepted by the sniff.
const MAX_IR_VERSION: u8 = 12;

pub struct OnnxLoader;

pub(crate) fn looks_like_model_proto(head: &[u8]) -> bool {
    match head {
        [0x08, ir, tag, ..] => {
            (1..=MAX_IR_VERSION).contains(ir) && (*tag & 0x07) == 2 && (2..=16).contains(&(*tag >> 3))
        }
        _ => false,
    }
}

impl ModelLoader for OnnxLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    fn name(&self) -> &str {
        "onnx"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["onnx"]
    }

    fn sniff(&self, probe: &FileProbe) -> bool {
        !probe.is_dir && probe.extension().as_deref() != Some("mlmodel") && looks_like_model_proto(&probe.head)
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError> {
        let path = request.path.as_path();
        let map = map_file(path)?;
        if !looks_like_model_proto(&map) {
            return Err(ModelLoadError::corrupt(path, "protobuf", "not an ONNX ModelProto"));
        }

        // Exported ONNX graphs are typically float32.
        let quantization = Quantization::F32;
        let size_bytes = map.len() as u64;
        let descriptor = ModelDescriptor {
            id: request.id.clone(),
            format: ModelFormat::Onnx,
            path: path.to_path_buf(),
            size_bytes,
            parameter_count: estimate_parameters(size_bytes, &quantization),
            quantization,
            capabilities: Capability::infer(&request.id, None),
            architecture: None,
            context_length: None,
            checksum: None,
        };
        Ok(LoadedModel {
            descriptor,
            payload: ModelPayload::Mapped(map),
        })
    }
}
