//! Loader wrapper that counts calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use kiln_kernel::ModelLoadError;
use kiln_kernel::loader::{FileProbe, LoadRequest, LoadedModel, ModelLoader};
use kiln_kernel::model::ModelFormat;

/// Delegates to an inner loader and counts `load` calls.
///
/// Registering it replaces the built-in loader for the same format.
pub struct CountingLoader {
    inner: Arc<dyn ModelLoader>,
    loads: Arc<AtomicUsize>,
}

impl CountingLoader {
    pub fn new(inner: Arc<dyn ModelLoader>) -> Self {
        Self {
            inner,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter that stays valid after the loader is registered.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn format(&self) -> ModelFormat {
        self.inner.format()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn extensions(&self) -> &'static [&'static str] {
        self.inner.extensions()
    }

    fn sniff(&self, probe: &FileProbe) -> bool {
        self.inner.sniff(probe)
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(request)
    }
}
