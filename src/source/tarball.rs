//! Reads an image from a saved tarball on disk, in either the legacy v1.2
//! layout or the OCI-in-tar layout.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use snafu::ResultExt;
use tokio::io::AsyncReadExt;
use tokio_tar::Archive;

use crate::element::ElementSink;
use crate::models::TarballManifest;
use crate::source::savetar::SaveTarStreamer;
use crate::source::ImageSource;
use crate::{error, Result};

/// A saved image tarball, readable as an element stream. The archive is
/// scanned once up front for its `manifest.json`, then streamed in a second
/// pass with out-of-order members spooled as needed.
#[derive(Debug)]
pub struct TarballSource {
    path: PathBuf,
    manifest: TarballManifest,
    image: String,
    tag: String,
    temp_dir: Option<PathBuf>,
}

impl TarballSource {
    pub async fn open(path: impl Into<PathBuf>, temp_dir: Option<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !tokio::fs::try_exists(&path)
            .await
            .context(error::FileSnafu)?
        {
            return error::SourceMissingSnafu { path }.fail();
        }

        let manifest = Self::scan_manifest(&path).await?;
        let (image, tag) = match manifest.repo_tags.first() {
            Some(repo_tag) => match repo_tag.rsplit_once(':') {
                Some((image, tag)) => (image.to_string(), tag.to_string()),
                None => (repo_tag.clone(), "latest".to_string()),
            },
            None => ("unknown".to_string(), "unknown".to_string()),
        };
        Ok(Self {
            path,
            manifest,
            image,
            tag,
            temp_dir,
        })
    }

    /// First pass: find and parse `manifest.json`, skipping member data. A
    /// tarball with a `repositories` file but no manifest is the pre-1.10
    /// format and is rejected.
    async fn scan_manifest(path: &std::path::Path) -> Result<TarballManifest> {
        let file = tokio::fs::File::open(path).await.context(error::FileSnafu)?;
        let mut archive = Archive::new(file);
        let mut entries = archive.entries().context(error::ArchiveSnafu)?;
        let mut saw_repositories = false;
        while let Some(entry) = entries.next().await {
            let mut entry = entry.context(error::ArchiveSnafu)?;
            let member = entry
                .path()
                .context(error::ArchiveSnafu)?
                .to_string_lossy()
                .to_string();
            if member == "repositories" {
                saw_repositories = true;
            }
            if member != "manifest.json" {
                continue;
            }
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .await
                .context(error::ArchiveSnafu)?;
            let mut documents: Vec<TarballManifest> =
                serde_json::from_slice(data.as_slice()).context(error::ManifestDeserializeSnafu)?;
            if documents.is_empty() {
                use serde::de::Error as _;
                return Err(error::Error::ManifestDeserialize {
                    source: serde_json::Error::custom("manifest.json holds no images"),
                });
            }
            return Ok(documents.remove(0));
        }
        if saw_repositories {
            error::PreManifestTarballSnafu.fail()
        } else {
            error::ManifestMissingSnafu.fail()
        }
    }
}

#[async_trait]
impl ImageSource for TarballSource {
    fn image(&self) -> &str {
        &self.image
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn stream_to(&mut self, sink: &mut dyn ElementSink) -> Result<()> {
        info!("reading image from tarball {}", self.path.display());
        let file = tokio::fs::File::open(&self.path)
            .await
            .context(error::FileSnafu)?;
        SaveTarStreamer::with_manifest(self.manifest.clone(), self.temp_dir.clone())
            .stream(file, sink)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{build_tar, CollectSink, TarEntry};

    async fn write_save_tar(dir: &std::path::Path) -> PathBuf {
        let layer = build_tar(&[TarEntry::file("hello", b"world")]).await;
        let manifest = serde_json::to_vec(&vec![TarballManifest {
            config: "abc.json".to_string(),
            repo_tags: vec!["example/app:v2".to_string()],
            layers: vec!["aaa/layer.tar".to_string()],
        }])
        .unwrap();
        let save = build_tar(&[
            TarEntry::file("abc.json", b"{\"os\":\"linux\"}"),
            TarEntry::file("aaa/layer.tar", layer.as_slice()),
            TarEntry::file("manifest.json", manifest.as_slice()),
        ])
        .await;
        let path = dir.join("image.tar");
        tokio::fs::write(&path, save).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_open_parses_repo_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_save_tar(dir.path()).await;
        let source = TarballSource::open(&path, None).await.unwrap();
        assert_eq!(source.image(), "example/app");
        assert_eq!(source.tag(), "v2");
    }

    #[tokio::test]
    async fn test_stream_yields_config_then_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_save_tar(dir.path()).await;
        let mut source = TarballSource::open(&path, None).await.unwrap();
        let mut sink = CollectSink::default();
        source.stream_to(&mut sink).await.unwrap();
        assert_eq!(sink.config().unwrap().0, "abc.json");
        assert_eq!(sink.layer_digests(), vec!["aaa"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_invalid_input() {
        let err = TarballSource::open("/does/not/exist.tar", None)
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::SourceMissing { .. }));
    }

    #[tokio::test]
    async fn test_pre_manifest_format_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let save = build_tar(&[
            TarEntry::file("repositories", b"{}"),
            TarEntry::file("aaa/layer.tar", b"x"),
        ])
        .await;
        let path = dir.path().join("old.tar");
        tokio::fs::write(&path, save).await.unwrap();
        let err = TarballSource::open(&path, None).await.unwrap_err();
        assert!(matches!(err, error::Error::PreManifestTarball));
    }
}
