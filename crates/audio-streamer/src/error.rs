//! Error taxonomy surfaced by the streamer.
//!
//! Components fail locally; the event loop turns the first terminal failure into the single
//! public error reported alongside `StreamerStatus::Error`.

use serde::Serialize;
use thiserror::Error;

/// Terminal playback failure.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StreamerError {
    /// Transport failed, the asset is unavailable, or downloaded bytes failed verification.
    #[error("network error: {0}")]
    Network(String),
    /// Malformed container or codec failure.
    #[error("decoding error: {0}")]
    Decoding(String),
    /// The audio output device could not be opened or driven.
    #[error("output error: {0}")]
    Output(String),
    /// Cache directory or sidecar I/O failed.
    #[error("cache error: {0}")]
    Cache(String),
}

/// Coarse classification of a [`StreamerError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkError,
    DecodingError,
    OutputError,
    CacheError,
}

impl StreamerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamerError::Network(_) => ErrorKind::NetworkError,
            StreamerError::Decoding(_) => ErrorKind::DecodingError,
            StreamerError::Output(_) => ErrorKind::OutputError,
            StreamerError::Cache(_) => ErrorKind::CacheError,
        }
    }

    pub(crate) fn network(err: impl std::fmt::Display) -> Self {
        StreamerError::Network(err.to_string())
    }

    pub(crate) fn decoding(err: impl std::fmt::Display) -> Self {
        StreamerError::Decoding(err.to_string())
    }

    /// Wrap an adapter error, keeping the full `anyhow` context chain.
    pub(crate) fn output(err: anyhow::Error) -> Self {
        StreamerError::Output(format!("{err:#}"))
    }

    pub(crate) fn cache(err: impl std::fmt::Display) -> Self {
        StreamerError::Cache(err.to_string())
    }
}

pub type Result<T, E = StreamerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(StreamerError::network("x").kind(), ErrorKind::NetworkError);
        assert_eq!(StreamerError::decoding("x").kind(), ErrorKind::DecodingError);
        assert_eq!(
            StreamerError::output(anyhow::anyhow!("gone")).kind(),
            ErrorKind::OutputError
        );
    }

    #[test]
    fn output_keeps_context_chain() {
        let err = anyhow::anyhow!("device lost").context("open stream");
        let mapped = StreamerError::output(err);
        assert_eq!(mapped.to_string(), "output error: open stream: device lost");
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_string(&StreamerError::network("timed out")).unwrap();
        assert_eq!(json, r#"{"kind":"network","message":"timed out"}"#);
    }
}
