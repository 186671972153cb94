//! Core ML loader: `.mlmodel` spec files and compiled or packaged bundles.
//!
//! Bundles are directories; their payload is the bundle path, handed to the
//! engine as-is.

use std::path::Path;

use kiln_kernel::ModelLoadError;
use kiln_kernel::loader::{FileProbe, LoadRequest, LoadedModel, ModelLoader};
use kiln_kernel::model::{
    Capability, ModelDescriptor, ModelFormat, ModelPayload, Quantization, estimate_parameters,
};

use super::map_file;
use super::onnx::looks_like_model_proto;

pub struct CoreMlLoader;

/// Files whose presence marks a directory as a Core ML bundle.
fn bundle_marker(dir: &Path) -> Option<&'static str> {
    ["Manifest.json", "coremldata.bin", "model.mil"]
        .into_iter()
        .find(|m| dir.join(m).exists())
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() { dir_size(&entry.path())? } else { meta.len() };
    }
    Ok(total)
}

impl CoreMlLoader {
    fn load_bundle(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError> {
        let path = request.path.as_path();
        if bundle_marker(path).is_none() {
            return Err(ModelLoadError::corrupt(
                path,
                "bundle_manifest",
                "no Manifest.json, coremldata.bin or model.mil in bundle",
            ));
        }
        let size_bytes = dir_size(path).map_err(|e| ModelLoadError::io(path, e))?;
        if size_bytes == 0 {
            return Err(ModelLoadError::corrupt(path, "size", "bundle is empty"));
        }
        Ok(LoadedModel {
            descriptor: descriptor(request, size_bytes),
            payload: ModelPayload::Bundle(path.to_path_buf()),
        })
    }

    fn load_spec(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError> {
        let path = request.path.as_path();
        let map = map_file(path)?;
        if !looks_like_model_proto(&map) {
            return Err(ModelLoadError::corrupt(path, "protobuf", "not a Core ML model spec"));
        }
        Ok(LoadedModel {
            descriptor: descriptor(request, map.len() as u64),
            payload: ModelPayload::Mapped(map),
        })
    }
}

fn descriptor(request: &LoadRequest, size_bytes: u64) -> ModelDescriptor {
    // Core ML weights are stored as float16 by default since iOS 16 tooling.
    let quantization = Quantization::F16;
    ModelDescriptor {
        id: request.id.clone(),
        format: ModelFormat::CoreMl,
        path: request.path.clone(),
        size_bytes,
        parameter_count: estimate_parameters(size_bytes, &quantization),
        quantization,
        capabilities: Capability::infer(&request.id, None),
        architecture: None,
        context_length: None,
        checksum: None,
    }
}

impl ModelLoader for CoreMlLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::CoreMl
    }

    fn name(&self) -> &str {
        "coreml"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["mlmodel", "mlpackage", "mlmodelc"]
    }

    fn sniff(&self, probe: &FileProbe) -> bool {
        probe.is_dir && bundle_marker(&probe.path).is_some()
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError> {
        if request.path.is_dir() {
            self.load_bundle(request)
        } else {
            self.load_spec(request)
        }
    }
}
