//! Persisted per-model metadata.
//!
//! One JSON file per model id under the store directory. The file name is
//! the sanitized id followed by a short digest of the raw id, so ids that
//! sanitize alike still get their own record. Every write goes to a uniquely
//! named temporary sibling, is fsynced, then renamed over the record.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_kernel::model::{ModelFormat, Quantization};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::loader::checksum::sha256_hex;

const ID_DIGEST_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: String,
    pub format: ModelFormat,
    pub size_bytes: u64,
    pub quantization: Quantization,
    pub memory_footprint: u64,
    pub checksum: Option<String>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, model_id: &str) -> PathBuf {
        let name: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        let digest = sha256_hex(model_id.as_bytes());
        self.dir.join(format!("{name}-{}.json", &digest[..ID_DIGEST_LEN]))
    }

    /// Write `record`, replacing any previous version atomically.
    pub fn save(&self, record: &ModelRecord) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&record.model_id);
        let buf = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn get(&self, model_id: &str) -> io::Result<Option<ModelRecord>> {
        match std::fs::read(self.record_path(model_id)) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(io::Error::other),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All readable records, sorted by model id. Unparseable files are skipped.
    pub fn list(&self) -> io::Result<Vec<ModelRecord>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(record) = serde_json::from_slice::<ModelRecord>(&std::fs::read(&path)?) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(records)
    }
}
