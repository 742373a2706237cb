use std::fmt;
use std::path::PathBuf;

use snafu::Snafu;
use tokio::task::JoinError;

use crate::models::Platform;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("failed to interact with tar archive: {source}"))]
    Archive { source: std::io::Error },
    #[snafu(display("expected blob {digest} never appeared in the archive"))]
    BlobMissing { digest: String },
    #[snafu(display("no catalog entry for {image}:{tag}"))]
    CatalogEntry { image: String, tag: String },
    #[snafu(display("failed to deserialize image configuration: {source}"))]
    ConfigDeserialize { source: serde_json::Error },
    #[snafu(display("archive stream ended before an image configuration was seen"))]
    ConfigMissing,
    #[snafu(display("failed to talk to the container daemon: {source}"))]
    Daemon { source: bollard::errors::Error },
    #[snafu(display("container daemon does not know image {reference}"))]
    DaemonImageNotFound { reference: String },
    #[snafu(display("digest mismatch for {resource}: expected {expected}, computed {actual}"))]
    DigestMismatch {
        resource: String,
        expected: String,
        actual: String,
    },
    #[snafu(display("failed to perform operation with directory: {source}"))]
    Directory { source: std::io::Error },
    #[snafu(display("invalid exclusion pattern '{pattern}': {source}"))]
    ExcludePattern {
        pattern: String,
        source: glob::PatternError,
    },
    #[snafu(display("failed to fetch blob {digest}: registry returned {status}"))]
    FetchBlob { digest: String, status: u16 },
    #[snafu(display("failed to fetch manifest {reference}: registry returned {status}"))]
    FetchManifest { reference: String, status: u16 },
    #[snafu(display("failed to interact with local file: {source}"))]
    File { source: std::io::Error },
    #[snafu(display("no image {image}:{tag} on the registry"))]
    ImageNotFound { image: String, tag: String },
    #[snafu(display("mid-stream failure while fetching layer {digest}: {source}"))]
    LayerStream {
        digest: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to wait for worker task: {source}"))]
    LayerWait { source: JoinError },
    #[snafu(display("failed to deserialize manifest: {source}"))]
    ManifestDeserialize { source: serde_json::Error },
    #[snafu(display("archive contains no manifest.json"))]
    ManifestMissing,
    #[snafu(display("mount of overlay filesystem failed: {stderr}"))]
    Mount { stderr: String },
    #[snafu(display("failed to create whiteout device node at {}: {source}", path.display()))]
    Mknod {
        path: PathBuf,
        source: rustix::io::Errno,
    },
    #[snafu(display("index has no manifest for platform {platform}"))]
    NoMatchingPlatform { platform: Platform },
    #[snafu(display("archive predates image format 1.10 and cannot be read"))]
    PreManifestTarball,
    #[snafu(display("failed to push manifest {reference}: registry returned {status} ({body})"))]
    PushManifest {
        reference: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to make request to registry: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("invalid search pattern '{pattern}': {source}"))]
    SearchPattern {
        pattern: String,
        source: glob::PatternError,
    },
    #[snafu(display("invalid search pattern '{pattern}': {source}"))]
    SearchRegex {
        pattern: String,
        source: regex::Error,
    },
    #[snafu(display("failed to serialize to json: {source}"))]
    Serialize { source: serde_json::Error },
    #[snafu(display("source tarball does not exist: {}", path.display()))]
    SourceMissing { path: PathBuf },
    #[snafu(display("failed to start blob upload: registry returned {status}"))]
    StartUpload { status: u16 },
    #[snafu(display("registry did not provide a location for the blob upload"))]
    StartUploadNoLocation,
    #[snafu(display("failed to create temporary file: {source}"))]
    TempFile { source: std::io::Error },
    #[snafu(display("registry refused authorization for {repository}"))]
    TokenRejected { repository: String },
    #[snafu(display("unrecognised compression magic in blob {resource}"))]
    UnknownCompression { resource: String },
    #[snafu(display("unknown manifest content type {content_type}"))]
    UnknownManifestType { content_type: String },
    #[snafu(display("failed to upload blob {digest}: registry returned {status}"))]
    UploadBlob { digest: String, status: u16 },
    #[snafu(display("one or more layer uploads failed:\n{}", reasons.join("\n")))]
    UploadsFailed { reasons: Vec<String> },
    #[snafu(display("invalid url detected: {source}"))]
    Url { source: url::ParseError },
    #[snafu(display("failed to set overlay xattr on {}: {source}", path.display()))]
    Xattr {
        path: PathBuf,
        source: rustix::io::Errno,
    },
}

/// Coarse classification of an [`Error`], used for the one-line report the
/// binary prints on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Unauthorized,
    Protocol,
    Integrity,
    Transport,
    Io,
    UnsupportedFormat,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidInput => "invalid input",
            Self::NotFound => "not found",
            Self::Unauthorized => "unauthorized",
            Self::Protocol => "protocol error",
            Self::Integrity => "integrity error",
            Self::Transport => "transport error",
            Self::Io => "io error",
            Self::UnsupportedFormat => "unsupported format",
        })
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExcludePattern { .. }
            | Self::SearchPattern { .. }
            | Self::SearchRegex { .. }
            | Self::SourceMissing { .. }
            | Self::PreManifestTarball => ErrorKind::InvalidInput,
            Self::ImageNotFound { .. }
            | Self::DaemonImageNotFound { .. }
            | Self::CatalogEntry { .. } => ErrorKind::NotFound,
            Self::TokenRejected { .. } => ErrorKind::Unauthorized,
            Self::UnknownManifestType { .. }
            | Self::NoMatchingPlatform { .. }
            | Self::ManifestDeserialize { .. }
            | Self::ConfigDeserialize { .. }
            | Self::Serialize { .. }
            | Self::Url { .. }
            | Self::BlobMissing { .. }
            | Self::ConfigMissing
            | Self::ManifestMissing
            | Self::FetchBlob { .. }
            | Self::FetchManifest { .. }
            | Self::StartUpload { .. }
            | Self::StartUploadNoLocation
            | Self::UploadBlob { .. }
            | Self::UploadsFailed { .. }
            | Self::PushManifest { .. } => ErrorKind::Protocol,
            Self::DigestMismatch { .. } => ErrorKind::Integrity,
            Self::Request { .. } | Self::Daemon { .. } | Self::LayerStream { .. } => {
                ErrorKind::Transport
            }
            Self::Archive { .. }
            | Self::File { .. }
            | Self::TempFile { .. }
            | Self::Directory { .. }
            | Self::LayerWait { .. }
            | Self::Mount { .. }
            | Self::Mknod { .. }
            | Self::Xattr { .. } => ErrorKind::Io,
            Self::UnknownCompression { .. } => ErrorKind::UnsupportedFormat,
        }
    }

    /// Whether a layer download is worth retrying after seeing this error.
    /// Only mid-transfer transport failures qualify; integrity failures and
    /// registry error responses never do.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::LayerStream { .. } => true,
            Self::Request { source } => {
                source.is_connect() || source.is_timeout() || source.is_body()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = Error::DigestMismatch {
            resource: "layer abc".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(!err.is_transient());

        let err = Error::PreManifestTarball;
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = Error::UnknownCompression {
            resource: "layer abc".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
    }

    #[test]
    fn test_transient_layer_stream() {
        let err = Error::LayerStream {
            digest: "abc".to_string(),
            source: std::io::Error::other("connection reset"),
        };
        assert!(err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
