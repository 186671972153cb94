//! Per-format model loader contract.
//!
//! Loaders are synchronous: they touch the filesystem and map files, so the
//! registry runs them on the blocking pool.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::ModelLoadError;
use crate::model::{ModelDescriptor, ModelFormat, ModelPayload};

/// Bytes read from the start of a file for content sniffing.
pub const PROBE_LEN: usize = 64;

/// What a loader gets to look at when sniffing.
#[derive(Debug, Clone)]
pub struct FileProbe {
    pub path: PathBuf,
    pub is_dir: bool,
    pub len: u64,
    /// Up to [`PROBE_LEN`] leading bytes; empty for directories.
    pub head: Vec<u8>,
}

impl FileProbe {
    pub fn read(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            return Ok(Self {
                path: path.to_path_buf(),
                is_dir: true,
                len: 0,
                head: Vec::new(),
            });
        }

        let mut head = Vec::with_capacity(PROBE_LEN);
        File::open(path)?
            .take(PROBE_LEN as u64)
            .read_to_end(&mut head)?;
        Ok(Self {
            path: path.to_path_buf(),
            is_dir: false,
            len: meta.len(),
            head,
        })
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
    }
}

/// Input to [`ModelLoader::load`].
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub path: PathBuf,
    /// Id the resulting descriptor carries.
    pub id: String,
    /// Lowercase hex sha-256 the file must hash to.
    pub expected_checksum: Option<String>,
}

impl LoadRequest {
    pub fn new(path: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: id.into(),
            expected_checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }
}

/// A validated descriptor plus the payload engines consume.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub descriptor: ModelDescriptor,
    pub payload: ModelPayload,
}

/// Turns files of one format into [`LoadedModel`]s.
pub trait ModelLoader: Send + Sync {
    fn format(&self) -> ModelFormat;

    fn name(&self) -> &str;

    /// Lowercase file extensions this loader claims, without the dot.
    fn extensions(&self) -> &'static [&'static str];

    /// Content check against the leading bytes of a file.
    fn sniff(&self, probe: &FileProbe) -> bool;

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                self.extensions().iter().any(|x| *x == e)
            })
            .unwrap_or(false)
    }

    fn can_handle(&self, path: &Path) -> bool {
        FileProbe::read(path)
            .map(|probe| self.sniff(&probe))
            .unwrap_or(false)
            || self.matches_extension(path)
    }

    /// Validate existence, readability and structure, then produce the
    /// descriptor and payload. Failures name the check that failed.
    fn load(&self, request: &LoadRequest) -> Result<LoadedModel, ModelLoadError>;
}
