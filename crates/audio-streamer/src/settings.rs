//! Settings shared by every streamer of a context: volume and analyzers.
//!
//! The volume is an `f32` stored as bits in an `AtomicU32` so the render callback can read it
//! without locking. With `keep_persistent_volume` it is written to a small JSON file on every
//! change and read back on load.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerHub;
use crate::config::StreamerConfig;

#[derive(Debug, Deserialize, Serialize)]
struct VolumeFile {
    volume: f32,
}

pub struct StreamerSettings {
    volume: Arc<AtomicU32>,
    persist_to: Option<PathBuf>,
    analyzers: Arc<AnalyzerHub>,
}

impl StreamerSettings {
    /// Volume 1.0, nothing persisted.
    pub fn in_memory() -> Self {
        Self {
            volume: Arc::new(AtomicU32::new(1f32.to_bits())),
            persist_to: None,
            analyzers: Arc::new(AnalyzerHub::new()),
        }
    }

    /// Restore the persisted volume when the config asks for it. A missing or unreadable file
    /// falls back to 1.0.
    pub fn load(config: &StreamerConfig) -> Self {
        let mut settings = Self::in_memory();
        if !config.options.keep_persistent_volume {
            return settings;
        }
        let path = config.volume_path();
        match read_volume(&path) {
            Ok(Some(v)) => {
                settings.volume.store(clamp_volume(v).to_bits(), Ordering::Relaxed);
                tracing::info!(path = ?path, volume = v, "volume restored");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(path = ?path, "ignoring volume file: {e:#}"),
        }
        settings.persist_to = Some(path);
        settings
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Clamp to `[0, 1]`, apply immediately, and persist if enabled.
    pub fn set_volume(&self, volume: f32) {
        let volume = clamp_volume(volume);
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
        if let Some(path) = &self.persist_to {
            if let Err(e) = write_volume(path, volume) {
                tracing::warn!(path = ?path, "failed to persist volume: {e:#}");
            }
        }
    }

    pub(crate) fn volume_handle(&self) -> Arc<AtomicU32> {
        self.volume.clone()
    }

    pub fn analyzers(&self) -> &Arc<AnalyzerHub> {
        &self.analyzers
    }
}

fn clamp_volume(v: f32) -> f32 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 1.0 }
}

fn read_volume(path: &Path) -> Result<Option<f32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file: VolumeFile =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(file.volume))
}

fn write_volume(path: &Path, volume: f32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let raw = serde_json::to_string(&VolumeFile { volume })?;
    fs::write(path, raw).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path, persist: bool) -> StreamerConfig {
        let mut config = StreamerConfig::default();
        config.cache.dir = dir.to_path_buf();
        config.options.keep_persistent_volume = persist;
        config
    }

    #[test]
    fn volume_survives_reload_when_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), true);
        StreamerSettings::load(&config).set_volume(0.25);
        assert_eq!(StreamerSettings::load(&config).volume(), 0.25);
    }

    #[test]
    fn volume_is_not_written_without_the_option() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), false);
        StreamerSettings::load(&config).set_volume(0.3);
        assert!(!config.volume_path().exists());
        assert_eq!(StreamerSettings::load(&config).volume(), 1.0);
    }

    #[test]
    fn volume_is_clamped() {
        let settings = StreamerSettings::in_memory();
        settings.set_volume(4.0);
        assert_eq!(settings.volume(), 1.0);
        settings.set_volume(-1.0);
        assert_eq!(settings.volume(), 0.0);
        settings.set_volume(f32::NAN);
        assert_eq!(settings.volume(), 1.0);
    }

    #[test]
    fn corrupt_volume_file_falls_back_to_full_volume() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), true);
        fs::write(config.volume_path(), "not json").unwrap();
        assert_eq!(StreamerSettings::load(&config).volume(), 1.0);
    }
}
