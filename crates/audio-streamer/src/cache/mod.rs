//! On-disk cache of downloaded assets.
//!
//! The store maps an asset identity (its URL) to a file in the cache directory plus a JSON
//! sidecar with the verification token and completion time. It owns the [`FileProvider`] of
//! every open entry; consumers hold a [`ProviderLease`] whose drop releases the open
//! reference. Eviction, removal and promotion all happen under the store mutex and never
//! touch an entry that is open.

mod entry;
mod lease;

pub use entry::CachedAsset;
pub use lease::ProviderLease;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use entry::{
    Sidecar, SIDECAR_SUFFIX, cache_file_name, file_name, is_managed_name, now_ms,
    sidecar_path_for,
};

use crate::config::{CacheConfig, StreamerConfig};
use crate::error::{Result, StreamerError};
use crate::provider::{DownloadJob, FileProvider, file_sha256};
use crate::source::{AudioSource, SourceLocation, VerificationToken};
use crate::transport::HttpTransport;

/// Accepts or rejects cached bytes; receives the file contents and the caller's token.
pub type VerifyFn = Arc<dyn Fn(&[u8], Option<&VerificationToken>) -> bool + Send + Sync>;

/// Where an identity's bytes live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// A cache directory entry, complete or partial.
    Managed { path: PathBuf, finished: bool },
    /// A file found in one of the additional search paths.
    External(PathBuf),
    /// Nothing cached yet; the path a new download should use.
    Fresh(PathBuf),
}

impl Resolved {
    pub fn path(&self) -> &Path {
        match self {
            Resolved::Managed { path, .. } | Resolved::External(path) | Resolved::Fresh(path) => {
                path
            }
        }
    }
}

struct Slot {
    asset: CachedAsset,
    provider: Option<Arc<FileProvider>>,
}

struct StoreInner {
    entries: HashMap<String, Slot>,
    search_paths: Vec<PathBuf>,
}

/// Cache directory, entry table and provider ownership.
pub struct CacheStore {
    dir: PathBuf,
    max_files: Option<usize>,
    inner: Mutex<StoreInner>,
    verifier: Mutex<Option<VerifyFn>>,
}

impl CacheStore {
    /// Create the cache directory if needed and rebuild the entry table from sidecars.
    pub fn open(cfg: &CacheConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(&cfg.dir)
            .map_err(|e| StreamerError::cache(format!("create {:?}: {e}", cfg.dir)))?;
        let mut entries = HashMap::new();
        let listing = fs::read_dir(&cfg.dir)
            .map_err(|e| StreamerError::cache(format!("read {:?}: {e}", cfg.dir)))?;
        for item in listing.flatten() {
            let name = item.file_name().to_string_lossy().into_owned();
            if !name.ends_with(SIDECAR_SUFFIX) || !is_managed_name(&name) {
                continue;
            }
            let sidecar = match Sidecar::load(&item.path()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(path = ?item.path(), "unreadable cache sidecar: {e}");
                    continue;
                }
            };
            let path = cfg.dir.join(&sidecar.file_name);
            let Ok(meta) = fs::metadata(&path) else {
                let _ = fs::remove_file(item.path());
                continue;
            };
            let mut asset = CachedAsset::new(sidecar.identity.clone(), path);
            asset.received_length = meta.len();
            asset.expected_length = sidecar.expected_length;
            asset.finished =
                sidecar.finished && sidecar.expected_length.is_none_or(|e| e == meta.len());
            if sidecar.finished && !asset.finished {
                tracing::warn!(identity = %sidecar.identity, "cached file truncated; will resume");
            }
            asset.completed_at_ms = sidecar.completed_at_ms;
            asset.token = sidecar.token;
            entries.insert(
                sidecar.identity,
                Slot {
                    asset,
                    provider: None,
                },
            );
        }
        tracing::info!(dir = ?cfg.dir, entries = entries.len(), "cache store opened");

        Ok(Arc::new(Self {
            dir: cfg.dir.clone(),
            max_files: cfg.max_files,
            inner: Mutex::new(StoreInner {
                entries,
                search_paths: cfg.search_paths.clone(),
            }),
            verifier: Mutex::new(None),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Managed mode: the store evicts beyond this many finished files on its own.
    pub fn max_files(&self) -> Option<usize> {
        self.max_files
    }

    /// Install the predicate used by [`CacheStore::verify`] and when reopening cached files.
    pub fn set_verifier<F>(&self, verify: F)
    where
        F: Fn(&[u8], Option<&VerificationToken>) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut v) = self.verifier.lock() {
            *v = Some(Arc::new(verify));
        }
    }

    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut inner = self.lock();
        if !inner.search_paths.contains(&path) {
            inner.search_paths.push(path);
        }
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.lock().search_paths.clone()
    }

    pub fn entries(&self) -> Vec<CachedAsset> {
        let mut out: Vec<_> = self
            .lock()
            .entries
            .values()
            .map(|s| s.asset.clone())
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    pub fn entry(&self, identity: &str) -> Option<CachedAsset> {
        self.lock().entries.get(identity).map(|s| s.asset.clone())
    }

    /// Locate the bytes for `identity`. A token that no longer matches the managed entry
    /// invalidates it so the caller re-fetches.
    pub fn resolve(
        &self,
        identity: &str,
        ext: Option<&str>,
        token: Option<&VerificationToken>,
    ) -> Resolved {
        let mut inner = self.lock();
        self.resolve_locked(&mut inner, identity, ext, token)
    }

    fn resolve_locked(
        &self,
        inner: &mut StoreInner,
        identity: &str,
        ext: Option<&str>,
        token: Option<&VerificationToken>,
    ) -> Resolved {
        let name = cache_file_name(identity, ext);
        for dir in &inner.search_paths {
            let candidate = dir.join(&name);
            if !candidate.is_file() {
                continue;
            }
            let stored = Sidecar::load(&sidecar_path_for(&candidate))
                .ok()
                .and_then(|s| s.token);
            if tokens_agree(stored.as_ref(), token) {
                return Resolved::External(candidate);
            }
        }

        if let Some(slot) = inner.entries.get(identity) {
            if slot.asset.external {
                return Resolved::External(slot.asset.path.clone());
            }
            if tokens_agree(slot.asset.token.as_ref(), token) || slot.asset.open_refs > 0 {
                return Resolved::Managed {
                    path: slot.asset.path.clone(),
                    finished: slot.asset.finished,
                };
            }
            tracing::info!(identity, "verification token changed; invalidating cache entry");
            self.delete_locked(inner, identity);
        }
        Resolved::Fresh(self.dir.join(name))
    }

    /// Check the cached file for `identity` against `token`. A failed check invalidates the
    /// entry so the next open downloads it again.
    pub fn verify(&self, identity: &str, token: Option<&VerificationToken>) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.entries.get(identity) else {
            return false;
        };
        let ok = self.verify_asset(&slot.asset, token);
        if !ok && !slot.asset.external {
            tracing::info!(identity, "cache verification failed; invalidating");
            self.delete_locked(&mut inner, identity);
        }
        ok
    }

    fn verify_asset(&self, asset: &CachedAsset, token: Option<&VerificationToken>) -> bool {
        let verifier = self.verifier.lock().ok().and_then(|v| v.clone());
        match verifier {
            Some(verify) => match fs::read(&asset.path) {
                Ok(bytes) => verify(&bytes, token),
                Err(e) => {
                    tracing::warn!(path = ?asset.path, "read for verification failed: {e}");
                    false
                }
            },
            None => tokens_agree(asset.token.as_ref(), token),
        }
    }

    /// Remove finished, non-open entries (oldest completion first) until at most `max_count`
    /// remain. Returns how many were removed.
    pub fn evict(&self, max_count: usize) -> usize {
        let mut inner = self.lock();
        let mut candidates: Vec<(u64, u64, String)> = inner
            .entries
            .values()
            .filter(|s| s.asset.evictable())
            .map(|s| {
                (
                    s.asset.completed_at_ms.unwrap_or(0),
                    s.asset.last_used_ms,
                    s.asset.identity.clone(),
                )
            })
            .collect();
        if candidates.len() <= max_count {
            return 0;
        }
        candidates.sort();
        let excess = candidates.len() - max_count;
        for (_, _, identity) in candidates.iter().take(excess) {
            self.delete_locked(&mut inner, identity);
        }
        tracing::info!(removed = excess, max_count, "cache eviction");
        excess
    }

    /// Invalidate one entry. Returns `false` when the entry is open and removal was deferred
    /// until its last lease is released (or when there is no such entry).
    pub fn remove(&self, identity: &str) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.entries.get_mut(identity) else {
            return false;
        };
        if slot.asset.open_refs > 0 {
            slot.asset.pending_removal = true;
            tracing::debug!(identity, "cache removal deferred while open");
            return false;
        }
        self.delete_locked(&mut inner, identity)
    }

    /// Invalidate every entry; returns how many were removed immediately.
    pub fn remove_all(&self) -> usize {
        let ids: Vec<String> = self.lock().entries.keys().cloned().collect();
        ids.iter().filter(|id| self.remove(id)).count()
    }

    /// Move a finished, closed file into the first additional search path, taking it out of
    /// the eviction pool.
    pub fn move_to_additional_path(&self, identity: &str) -> Result<PathBuf> {
        let mut inner = self.lock();
        let target_dir = inner
            .search_paths
            .first()
            .cloned()
            .ok_or_else(|| StreamerError::cache("no additional search path configured"))?;
        let slot = inner
            .entries
            .get(identity)
            .ok_or_else(|| StreamerError::cache(format!("{identity} is not cached")))?;
        if !slot.asset.evictable() {
            return Err(StreamerError::cache(format!(
                "{identity} is open, unfinished or external"
            )));
        }
        let src = slot.asset.path.clone();
        let sidecar = slot.asset.sidecar();
        fs::create_dir_all(&target_dir)
            .map_err(|e| StreamerError::cache(format!("create {:?}: {e}", target_dir)))?;
        let dest = target_dir.join(file_name(&src));
        move_file(&src, &dest)?;
        if let Err(e) = sidecar.store(&sidecar_path_for(&dest)) {
            tracing::warn!(path = ?dest, "write sidecar failed: {e}");
        }
        let _ = fs::remove_file(sidecar_path_for(&src));
        inner.entries.remove(identity);
        tracing::info!(identity, dest = ?dest, "cache file promoted");
        Ok(dest)
    }

    /// Delete partial downloads nobody has open and stray files left in the cache directory.
    pub fn clean_useless(&self) -> Result<usize> {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .entries
            .values()
            .filter(|s| !s.asset.external && !s.asset.finished && s.asset.open_refs == 0)
            .map(|s| s.asset.identity.clone())
            .collect();
        let mut removed = 0usize;
        for identity in &stale {
            if self.delete_locked(&mut inner, identity) {
                removed += 1;
            }
        }

        let mut keep = HashSet::new();
        for slot in inner.entries.values().filter(|s| !s.asset.external) {
            keep.insert(file_name(&slot.asset.path));
            keep.insert(file_name(&slot.asset.sidecar_path()));
        }
        let listing = fs::read_dir(&self.dir)
            .map_err(|e| StreamerError::cache(format!("read {:?}: {e}", self.dir)))?;
        for item in listing.flatten() {
            let name = item.file_name().to_string_lossy().into_owned();
            if !is_managed_name(&name) || keep.contains(&name) {
                continue;
            }
            if fs::remove_file(item.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(count = removed, "cleaned up stale cache files");
        }
        Ok(removed)
    }

    /// Mark an entry finished when its file already holds the expected number of bytes.
    pub fn check_file_completion(&self, identity: &str) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.entries.get_mut(identity) else {
            return false;
        };
        if slot.asset.finished {
            return true;
        }
        let Some(expected) = slot.asset.expected_length else {
            return false;
        };
        let len = fs::metadata(&slot.asset.path).map(|m| m.len()).unwrap_or(0);
        if len != expected || slot.asset.open_refs > 0 {
            return false;
        }
        slot.asset.received_length = len;
        slot.asset.finished = true;
        slot.asset.failed = false;
        slot.asset.completed_at_ms.get_or_insert_with(now_ms);
        persist(&slot.asset);
        true
    }

    /// Open (or join) the provider for `source` and take an open reference on its entry.
    pub fn open_provider(
        self: &Arc<Self>,
        source: &AudioSource,
        transport: Arc<dyn HttpTransport>,
        cfg: &StreamerConfig,
    ) -> Result<ProviderLease> {
        let identity = source.identity();
        let mut inner = self.lock();

        if let Some(slot) = inner.entries.get_mut(&identity) {
            if let Some(provider) = &slot.provider {
                slot.asset.open_refs += 1;
                slot.asset.last_used_ms = now_ms();
                let weak = Arc::downgrade(provider);
                return Ok(ProviderLease::new(self.clone(), identity, weak));
            }
        }

        let (provider, external) = match &source.location {
            SourceLocation::Local(path) => (open_existing(&identity, path, None), true),
            SourceLocation::Remote(url) => {
                let ext = source.extension();
                match self.resolve_locked(&mut inner, &identity, ext.as_deref(), source.token.as_ref()) {
                    Resolved::External(path) => {
                        tracing::debug!(identity = %identity, path = ?path, "serving from search path");
                        (open_existing(&identity, &path, source.token.clone()), true)
                    }
                    Resolved::Managed { path, finished: true }
                        if self.accept_cached(&inner, &identity, source, cfg) =>
                    {
                        let token = inner
                            .entries
                            .get(&identity)
                            .and_then(|s| s.asset.token.clone());
                        tracing::debug!(identity = %identity, "serving finished cache entry");
                        (open_existing(&identity, &path, token), false)
                    }
                    Resolved::Managed { path, finished } => {
                        let (resume_from, resume_token) = if finished {
                            tracing::info!(identity = %identity, "cached file rejected; re-fetching");
                            (0, None)
                        } else {
                            let slot = inner.entries.get(&identity);
                            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                            let expected = slot.and_then(|s| s.asset.expected_length);
                            let resume = if expected.is_some_and(|e| len >= e) { 0 } else { len };
                            (resume, slot.and_then(|s| s.asset.token.clone()))
                        };
                        if let Some(slot) = inner.entries.get_mut(&identity) {
                            slot.asset.finished = false;
                            slot.asset.completed_at_ms = None;
                        }
                        let job = self.job(url, source, transport, cfg, resume_from, resume_token);
                        (
                            FileProvider::download(identity.clone(), path, cfg.speed_window(), job),
                            false,
                        )
                    }
                    Resolved::Fresh(path) => {
                        let job = self.job(url, source, transport, cfg, 0, None);
                        (
                            FileProvider::download(identity.clone(), path, cfg.speed_window(), job),
                            false,
                        )
                    }
                }
            }
        };

        let slot = inner.entries.entry(identity.clone()).or_insert_with(|| Slot {
            asset: CachedAsset::new(identity.clone(), provider.cached_path().to_path_buf()),
            provider: None,
        });
        slot.asset.path = provider.cached_path().to_path_buf();
        slot.asset.external = external;
        slot.asset.open_refs += 1;
        slot.asset.last_used_ms = now_ms();
        slot.asset.received_length = provider.received_length();
        slot.asset.failed = provider.is_failed();
        if provider.is_finished() {
            slot.asset.finished = true;
            slot.asset.expected_length = provider.expected_length();
        }
        slot.provider = Some(provider.clone());
        drop(inner);

        Ok(ProviderLease::new(
            self.clone(),
            identity,
            Arc::downgrade(&provider),
        ))
    }

    fn job(
        self: &Arc<Self>,
        url: &str,
        source: &AudioSource,
        transport: Arc<dyn HttpTransport>,
        cfg: &StreamerConfig,
        resume_from: u64,
        resume_token: Option<VerificationToken>,
    ) -> DownloadJob {
        DownloadJob {
            url: url.to_string(),
            transport,
            store: Arc::downgrade(self),
            resume_from,
            resume_token,
            sha256: source
                .sha256
                .clone()
                .filter(|_| cfg.options.require_sha256),
            read_chunk_bytes: cfg.transport.read_chunk_bytes,
        }
    }

    /// Whether a finished cache file may be served without touching the network.
    fn accept_cached(
        &self,
        inner: &StoreInner,
        identity: &str,
        source: &AudioSource,
        cfg: &StreamerConfig,
    ) -> bool {
        let Some(slot) = inner.entries.get(identity) else {
            return false;
        };
        if !self.verify_asset(&slot.asset, source.token.as_ref()) {
            return false;
        }
        match (&source.sha256, cfg.options.require_sha256) {
            (Some(want), true) => {
                let recorded = slot.asset.token.as_ref().and_then(|t| t.sha256.as_ref());
                if recorded.is_some_and(|got| got.eq_ignore_ascii_case(want)) {
                    return true;
                }
                file_sha256(&slot.asset.path)
                    .map(|got| got.eq_ignore_ascii_case(want))
                    .unwrap_or(false)
            }
            _ => true,
        }
    }

    pub(crate) fn record_headers(&self, identity: &str, received: u64, token: VerificationToken) {
        let mut inner = self.lock();
        if let Some(slot) = inner.entries.get_mut(identity) {
            slot.asset.received_length = received;
            slot.asset.expected_length = token.content_length;
            slot.asset.failed = false;
            slot.asset.token = Some(token);
            persist(&slot.asset);
        }
    }

    pub(crate) fn record_finished(&self, identity: &str, received: u64, token: VerificationToken) {
        {
            let mut inner = self.lock();
            let Some(slot) = inner.entries.get_mut(identity) else {
                return;
            };
            slot.asset.received_length = received;
            slot.asset.expected_length = Some(received);
            slot.asset.finished = true;
            slot.asset.failed = false;
            slot.asset.completed_at_ms.get_or_insert_with(now_ms);
            slot.asset.token = Some(token);
            persist(&slot.asset);
        }
        if let Some(max) = self.max_files {
            self.evict(max);
        }
    }

    pub(crate) fn record_failed(&self, identity: &str, received: u64) {
        let mut inner = self.lock();
        if let Some(slot) = inner.entries.get_mut(identity) {
            slot.asset.received_length = received;
            slot.asset.failed = true;
        }
    }

    /// Drop one open reference; the last one cancels an unfinished download and applies a
    /// deferred removal.
    pub(crate) fn release(&self, identity: &str) {
        let mut inner = self.lock();
        let Some(slot) = inner.entries.get_mut(identity) else {
            return;
        };
        slot.asset.open_refs = slot.asset.open_refs.saturating_sub(1);
        if slot.asset.open_refs > 0 {
            return;
        }
        slot.asset.last_used_ms = now_ms();
        if let Some(provider) = slot.provider.take() {
            slot.asset.received_length = provider.received_length();
            if provider.is_finished() {
                if !slot.asset.finished && !slot.asset.external {
                    slot.asset.finished = true;
                    slot.asset.failed = false;
                    slot.asset.expected_length = provider.expected_length();
                    slot.asset.completed_at_ms = Some(now_ms());
                    slot.asset.token = Some(provider.token());
                    persist(&slot.asset);
                }
            } else {
                provider.cancel();
            }
        }
        if slot.asset.pending_removal {
            self.delete_locked(&mut inner, identity);
        } else if slot.asset.external {
            inner.entries.remove(identity);
        }
        drop(inner);
        if let Some(max) = self.max_files {
            self.evict(max);
        }
    }

    /// Remove the entry and, for managed entries, its file and sidecar.
    fn delete_locked(&self, inner: &mut StoreInner, identity: &str) -> bool {
        let Some(slot) = inner.entries.remove(identity) else {
            return false;
        };
        if let Some(provider) = &slot.provider {
            provider.cancel();
        }
        if !slot.asset.external {
            remove_if_present(&slot.asset.path);
            remove_if_present(&slot.asset.sidecar_path());
        }
        tracing::debug!(identity, "cache entry removed");
        true
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn tokens_agree(stored: Option<&VerificationToken>, wanted: Option<&VerificationToken>) -> bool {
    match (stored, wanted) {
        (Some(stored), Some(wanted)) => stored.matches(wanted),
        _ => true,
    }
}

fn open_existing(identity: &str, path: &Path, token: Option<VerificationToken>) -> Arc<FileProvider> {
    match FileProvider::completed(identity.to_string(), path.to_path_buf(), token) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(path = ?path, "open {:?}: {e}", path);
            FileProvider::failed(
                identity.to_string(),
                path.to_path_buf(),
                format!("open {}: {e}", path.display()),
            )
        }
    }
}

fn persist(asset: &CachedAsset) {
    if asset.external {
        return;
    }
    if let Err(e) = asset.sidecar().store(&asset.sidecar_path()) {
        tracing::warn!(path = ?asset.sidecar_path(), "write sidecar failed: {e}");
    }
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = ?path, "cache cleanup warning: {e}");
        }
    }
}

fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)
        .map_err(|e| StreamerError::cache(format!("copy {:?} -> {:?}: {e}", src, dest)))?;
    fs::remove_file(src).map_err(|e| StreamerError::cache(format!("remove {:?}: {e}", src)))
}
