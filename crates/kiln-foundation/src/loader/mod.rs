//! Model loader registry and the built-in per-format loaders.
//!
//! Format resolution: a caller hint skips detection; otherwise every loader
//! sniffs the file's leading bytes, then extensions are consulted. A file no
//! loader claims is `UnknownFormat`.

pub mod checksum;
mod coreml;
mod gguf;
mod onnx;
mod safetensors;

pub use coreml::CoreMlLoader;
pub use gguf::GgufLoader;
pub use onnx::OnnxLoader;
pub use safetensors::SafeTensorsLoader;

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use kiln_kernel::ModelLoadError;
use kiln_kernel::loader::{FileProbe, LoadRequest, LoadedModel, ModelLoader};
use kiln_kernel::model::{ModelFormat, model_id_from_path};
use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Polymorphic collection of per-format loaders
pub struct ModelLoaderRegistry {
    loaders: RwLock<Vec<Arc<dyn ModelLoader>>>,
}

impl Default for ModelLoaderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ModelLoaderRegistry {
    /// A registry with no loaders.
    pub fn empty() -> Self {
        Self {
            loaders: RwLock::new(Vec::new()),
        }
    }

    /// GGUF, SafeTensors, ONNX and Core ML.
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        registry.register_loader(Arc::new(GgufLoader));
        registry.register_loader(Arc::new(SafeTensorsLoader));
        registry.register_loader(Arc::new(OnnxLoader));
        registry.register_loader(Arc::new(CoreMlLoader));
        registry
    }

    /// Add a loader. A loader for an already-registered format replaces it.
    pub fn register_loader(&self, loader: Arc<dyn ModelLoader>) {
        let mut loaders = self.loaders.write();
        let format = loader.format();
        if let Some(slot) = loaders.iter_mut().find(|l| l.format() == format) {
            warn!(%format, replaced = slot.name(), by = loader.name(), "replacing model loader");
            *slot = loader;
        } else {
            debug!(%format, loader = loader.name(), "model loader registered");
            loaders.push(loader);
        }
    }

    pub fn formats(&self) -> Vec<ModelFormat> {
        self.loaders.read().iter().map(|l| l.format()).collect()
    }

    pub fn loader_for(&self, format: ModelFormat) -> Option<Arc<dyn ModelLoader>> {
        self.loaders
            .read()
            .iter()
            .find(|l| l.format() == format)
            .cloned()
    }

    /// Content sniff across all loaders, then extension.
    pub fn detect_format(&self, path: &Path) -> Option<ModelFormat> {
        let loaders = self.loaders.read();
        if let Ok(probe) = FileProbe::read(path) {
            if let Some(l) = loaders.iter().find(|l| l.sniff(&probe)) {
                return Some(l.format());
            }
        }
        loaders
            .iter()
            .find(|l| l.matches_extension(path))
            .map(|l| l.format())
    }

    /// Load with an id derived from the file name.
    pub fn load(&self, path: &Path, hint: Option<ModelFormat>) -> Result<LoadedModel, ModelLoadError> {
        let id = model_id_from_path(path).unwrap_or_else(|| "model".to_string());
        self.load_request(&LoadRequest::new(path, id), hint)
    }

    /// Resolve the format, run its loader and verify the checksum when one
    /// is expected (from the request or a `<file>.sha256` sidecar).
    pub fn load_request(
        &self,
        request: &LoadRequest,
        hint: Option<ModelFormat>,
    ) -> Result<LoadedModel, ModelLoadError> {
        let path = request.path.as_path();
        check_exists(path)?;

        let format = match hint {
            Some(format) => format,
            None => self
                .detect_format(path)
                .ok_or_else(|| ModelLoadError::UnknownFormat { path: path.to_path_buf() })?,
        };
        let loader = self
            .loader_for(format)
            .ok_or_else(|| ModelLoadError::UnknownFormat { path: path.to_path_buf() })?;

        let mut loaded = loader.load(request)?;

        let expected = request
            .expected_checksum
            .clone()
            .or_else(|| checksum::read_sidecar(path));
        if let Some(expected) = expected {
            match loaded.payload.as_bytes() {
                Some(bytes) => {
                    loaded.descriptor.checksum = Some(checksum::verify(path, bytes, &expected)?);
                }
                None => warn!(path = %path.display(), "checksum verification is not supported for bundles"),
            }
        }

        info!(
            model_id = %loaded.descriptor.id,
            format = %loaded.descriptor.format,
            size_bytes = loaded.descriptor.size_bytes,
            quantization = %loaded.descriptor.quantization,
            loader = loader.name(),
            "model file loaded"
        );
        Ok(loaded)
    }
}

fn check_exists(path: &Path) -> Result<(), ModelLoadError> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ModelLoadError::corrupt(path, "exists", "no such file or directory"))
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            Err(ModelLoadError::corrupt(path, "readable", e.to_string()))
        }
        Err(e) => Err(ModelLoadError::io(path, e)),
    }
}

/// Open and map a single-file model read-only.
pub(crate) fn map_file(path: &Path) -> Result<Arc<Mmap>, ModelLoadError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ModelLoadError::corrupt(path, "exists", "no such file"),
        ErrorKind::PermissionDenied => ModelLoadError::corrupt(path, "readable", e.to_string()),
        _ => ModelLoadError::io(path, e),
    })?;
    let len = file.metadata().map_err(|e| ModelLoadError::io(path, e))?.len();
    if len == 0 {
        return Err(ModelLoadError::corrupt(path, "size", "file is empty"));
    }
    // SAFETY: the map is read-only and shared through an Arc; the file is
    // not modified by this process while the model is loaded.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| ModelLoadError::io(path, e))?;
    Ok(Arc::new(map))
}
