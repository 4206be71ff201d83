use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::source::VerificationToken;

pub(crate) const SIDECAR_SUFFIX: &str = ".meta.json";

/// Public view of one cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CachedAsset {
    pub identity: String,
    pub path: PathBuf,
    pub expected_length: Option<u64>,
    pub received_length: u64,
    pub finished: bool,
    pub failed: bool,
    /// Live [`super::ProviderLease`]s on this entry.
    pub open_refs: usize,
    /// Unix milliseconds at which the download completed.
    pub completed_at_ms: Option<u64>,
    pub last_used_ms: u64,
    /// Removal was requested while the entry was open.
    pub pending_removal: bool,
    /// Lives outside the cache directory (local file or search path); never deleted.
    pub external: bool,
    pub token: Option<VerificationToken>,
}

/// Metadata persisted next to every managed cache file.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub(crate) struct Sidecar {
    pub(crate) identity: String,
    pub(crate) file_name: String,
    pub(crate) expected_length: Option<u64>,
    pub(crate) finished: bool,
    pub(crate) completed_at_ms: Option<u64>,
    pub(crate) token: Option<VerificationToken>,
}

impl CachedAsset {
    pub(crate) fn new(identity: String, path: PathBuf) -> Self {
        Self {
            identity,
            path,
            expected_length: None,
            received_length: 0,
            finished: false,
            failed: false,
            open_refs: 0,
            completed_at_ms: None,
            last_used_ms: now_ms(),
            pending_removal: false,
            external: false,
            token: None,
        }
    }

    pub(crate) fn sidecar(&self) -> Sidecar {
        Sidecar {
            identity: self.identity.clone(),
            file_name: file_name(&self.path),
            expected_length: self.expected_length,
            finished: self.finished,
            completed_at_ms: self.completed_at_ms,
            token: self.token.clone(),
        }
    }

    pub(crate) fn sidecar_path(&self) -> PathBuf {
        sidecar_path_for(&self.path)
    }

    /// Whether eviction may delete this entry.
    pub(crate) fn evictable(&self) -> bool {
        self.finished && self.open_refs == 0 && !self.external
    }
}

impl Sidecar {
    pub(crate) fn load(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(io::Error::other)
    }

    pub(crate) fn store(&self, path: &Path) -> io::Result<()> {
        let raw = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, raw)
    }
}

/// `<sha256(identity)>.<ext>`; the hash keeps names filesystem-safe and collision free.
pub(crate) fn cache_file_name(identity: &str, ext: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    match ext {
        Some(ext) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("{hash}.{ext}")
        }
        _ => format!("{hash}.bin"),
    }
}

pub(crate) fn sidecar_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(SIDECAR_SUFFIX);
    path.with_file_name(name)
}

/// Names created by the store start with a 64-character hex digest.
pub(crate) fn is_managed_name(name: &str) -> bool {
    name.len() > 64 && name.as_bytes()[..64].iter().all(|b| b.is_ascii_hexdigit()) && name.as_bytes()[64] == b'.'
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_millis(0))
        .as_millis() as u64
}
