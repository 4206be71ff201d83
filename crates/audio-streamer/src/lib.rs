//! Streaming audio playback: progressive download into a disk cache, incremental decode, and
//! a timed ring buffer feeding a real-time output callback, tied together by a per-stream
//! worker with a play/pause/stop/seek control surface.

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod error;
mod event_loop;
pub mod header;
pub mod item;
pub mod output;
pub mod pcm;
pub mod provider;
pub mod renderer;
pub mod resample;
mod ring;
pub mod settings;
pub mod source;
pub mod status;
pub mod streamer;
pub mod transport;

pub use cache::{CacheStore, CachedAsset, ProviderLease};
pub use config::{CacheConfig, StreamerConfig, StreamerOptions, TransportConfig};
pub use error::{ErrorKind, StreamerError};
pub use output::{CpalOutput, ManualOutput, OutputBackend, OutputFormat};
pub use source::{AudioSource, VerificationToken};
pub use status::{StatusSnapshot, StreamerEvent, StreamerStatus};
pub use streamer::{AudioStreamer, StreamerContext};
pub use transport::{HttpTransport, UreqTransport};
