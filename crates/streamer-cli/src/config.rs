//! Config file loading and flag overrides.

use std::path::Path;

use anyhow::{Context, Result};
use audio_streamer::StreamerConfig;

use crate::cli::{Args, Command};

/// Load `path` (all fields optional) or fall back to defaults.
pub fn load(path: Option<&Path>) -> Result<StreamerConfig> {
    let Some(path) = path else {
        return Ok(StreamerConfig::default());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
    let cfg = toml::from_str::<StreamerConfig>(&raw)
        .with_context(|| format!("parse config {:?}", path))?;
    Ok(cfg)
}

/// Apply command-line flags on top of the file configuration.
pub fn apply_args(cfg: &mut StreamerConfig, args: &Args) {
    if let Some(dir) = &args.cache_dir {
        cfg.cache.dir = dir.clone();
    }
    if let Some(max) = args.max_cached {
        cfg.cache.max_files = Some(max);
    }
    if let Command::Play {
        buffer_ms: Some(ms),
        ..
    } = &args.cmd
    {
        cfg.buffer_time_ms = *ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn file_values_are_overridden_by_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamer.toml");
        std::fs::write(
            &path,
            "buffer_time_ms = 800\nready_threshold = 0.25\n[cache]\ndir = \"/var/cache/a\"\nmax_files = 10\n",
        )
        .unwrap();
        let mut cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.buffer_time_ms, 800);
        assert_eq!(cfg.ready_threshold, 0.25);
        assert_eq!(cfg.decode_chunk_frames, 2048);

        let args = Args::parse_from([
            "streamer",
            "--cache-dir",
            "/tmp/override",
            "play",
            "a.flac",
            "--buffer-ms",
            "3000",
        ]);
        apply_args(&mut cfg, &args);
        assert_eq!(cfg.cache.dir, std::path::PathBuf::from("/tmp/override"));
        assert_eq!(cfg.cache.max_files, Some(10));
        assert_eq!(cfg.buffer_time_ms, 3000);
    }

    #[test]
    fn unparsable_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "buffer_time_ms = \"soon\"").unwrap();
        let err = load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("bad.toml"));
    }
}
