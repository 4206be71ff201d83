//! Description of what to play.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where the asset bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocation {
    Remote(String),
    Local(PathBuf),
}

/// Data used to confirm that a cached file still matches its remote asset.
///
/// Two tokens match when every field present on both sides is equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct VerificationToken {
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub sha256: Option<String>,
}

impl VerificationToken {
    pub fn matches(&self, other: &VerificationToken) -> bool {
        fn field<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        field(&self.etag, &other.etag)
            && field(&self.content_length, &other.content_length)
            && field(
                &self.sha256.as_ref().map(|s| s.to_ascii_lowercase()),
                &other.sha256.as_ref().map(|s| s.to_ascii_lowercase()),
            )
    }
}

/// A playable asset: location plus optional verification data.
#[derive(Clone, Debug)]
pub struct AudioSource {
    pub location: SourceLocation,
    pub token: Option<VerificationToken>,
    /// Expected SHA-256 of the full file (lowercase hex).
    pub sha256: Option<String>,
    /// Container extension used as a probe hint when the location has none.
    pub extension_hint: Option<String>,
}

impl AudioSource {
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            location: SourceLocation::Remote(url.into()),
            token: None,
            sha256: None,
            extension_hint: None,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            location: SourceLocation::Local(path.into()),
            token: None,
            sha256: None,
            extension_hint: None,
        }
    }

    /// Parse a CLI-style argument: anything with a URL scheme is remote.
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            Self::remote(input)
        } else if let Some(path) = input.strip_prefix("file://") {
            Self::local(path)
        } else {
            Self::local(input)
        }
    }

    pub fn with_token(mut self, token: VerificationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    pub fn with_extension_hint(mut self, ext: impl Into<String>) -> Self {
        self.extension_hint = Some(ext.into());
        self
    }

    /// Cache identity: the URL for remote assets, `file://<path>` for local ones.
    pub fn identity(&self) -> String {
        match &self.location {
            SourceLocation::Remote(url) => url.clone(),
            SourceLocation::Local(path) => format!("file://{}", path.display()),
        }
    }

    pub fn url(&self) -> String {
        self.identity()
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.location {
            SourceLocation::Local(path) => Some(path),
            SourceLocation::Remote(_) => None,
        }
    }

    /// Container extension: explicit hint first, then the location's own extension.
    pub fn extension(&self) -> Option<String> {
        if let Some(ext) = self.extension_hint.as_deref().filter(|s| !s.is_empty()) {
            return Some(ext.to_ascii_lowercase());
        }
        match &self.location {
            SourceLocation::Remote(url) => infer_ext_from_url(url),
            SourceLocation::Local(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase()),
        }
    }
}

/// Infer a file extension from the URL path if present.
pub(crate) fn infer_ext_from_url(url: &str) -> Option<String> {
    let tail = url.split(['?', '#']).next().unwrap_or(url);
    let tail = tail.split_once("://").map(|(_, rest)| rest).unwrap_or(tail);
    let (_, path) = tail.split_once('/')?;
    let file = path.rsplit('/').next().unwrap_or(path);
    let mut parts = file.rsplit('.');
    let ext = parts.next()?;
    if parts.next().is_some() && !ext.is_empty() {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}
