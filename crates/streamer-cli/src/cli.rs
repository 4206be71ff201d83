use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "streamer", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML config file; flags below override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Keep at most this many finished files in the cache (managed mode)
    #[arg(long, global = true)]
    pub max_cached: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream a URL or play a local file
    Play {
        /// http(s) URL or filesystem path
        source: String,

        /// Start position in milliseconds
        #[arg(long)]
        seek_ms: Option<u64>,

        /// Volume in [0, 1]
        #[arg(long)]
        volume: Option<f32>,

        /// Use a specific output device by substring match
        #[arg(long)]
        device: Option<String>,

        /// Ring buffer length in milliseconds
        #[arg(long)]
        buffer_ms: Option<u64>,

        /// Expected SHA-256 of the downloaded file
        #[arg(long)]
        sha256: Option<String>,

        /// Container extension hint when the URL has none (e.g. mp3, flac)
        #[arg(long)]
        ext: Option<String>,
    },

    /// List output devices and exit
    Devices,

    /// Inspect or maintain the download cache
    Cache {
        #[command(subcommand)]
        cmd: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Print cached entries as JSON
    List,
    /// Delete partial downloads and stray files
    Clean,
    /// Delete every cached file
    Clear,
    /// Delete the cached copy of one URL
    Remove { url: String },
    /// Move a finished download into a permanent directory outside the eviction pool
    Promote {
        url: String,
        /// Destination directory
        #[arg(long)]
        to: PathBuf,
    },
}
