//! sha-256 verification of mapped model files.

use std::path::{Path, PathBuf};

use kiln_kernel::ModelLoadError;
use sha2::{Digest, Sha256};
use tracing::warn;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `<file>.sha256` next to the model file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Expected digest from a `sha256sum`-style sidecar, if one exists.
///
/// Only the first token is read, so both a bare digest and
/// `<digest>  <filename>` lines are accepted.
pub fn read_sidecar(path: &Path) -> Option<String> {
    let sidecar = sidecar_path(path);
    let content = std::fs::read_to_string(&sidecar).ok()?;
    let digest = content.split_whitespace().next()?.to_ascii_lowercase();
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        warn!(sidecar = %sidecar.display(), "ignoring malformed checksum sidecar");
        return None;
    }
    Some(digest)
}

/// Hash `bytes` and compare against `expected` (case-insensitive hex).
/// Returns the actual digest on success.
pub fn verify(path: &Path, bytes: &[u8], expected: &str) -> Result<String, ModelLoadError> {
    let actual = sha256_hex(bytes);
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(ModelLoadError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        });
    }
    Ok(actual)
}
