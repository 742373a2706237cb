//! Writes elements to a v1.2 save-tarball, loadable with `docker load`.

use std::path::PathBuf;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio_tar::{Builder as ArchiveBuilder, Header};

use crate::element::{Element, ElementSink};
use crate::models::TarballManifest;
use crate::{error, Result};

/// Shared v1.2 archive authoring: config at `<hex>.json`, layers at
/// `<hex>/layer.tar`, `manifest.json` appended last. Paths in this layout
/// are short hex names, so plain USTAR headers always suffice.
pub(crate) struct V12TarWriter {
    builder: ArchiveBuilder<tokio::fs::File>,
    manifest: TarballManifest,
}

impl V12TarWriter {
    pub fn new(file: tokio::fs::File, image: &str, tag: &str) -> Self {
        let short_name = image.rsplit('/').next().unwrap_or(image);
        let manifest = TarballManifest {
            config: String::new(),
            repo_tags: vec![format!("{short_name}:{tag}")],
            layers: Vec::new(),
        };
        Self {
            builder: ArchiveBuilder::new(file),
            manifest,
        }
    }

    fn member_header(size: u64) -> Header {
        let mut header = Header::new_ustar();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);
        header
    }

    pub async fn add_config(&mut self, name: &str, data: &[u8]) -> Result<()> {
        debug!("writing config file to tarball");
        let mut header = Self::member_header(data.len() as u64);
        self.builder
            .append_data(&mut header, name, std::io::Cursor::new(data.to_vec()))
            .await
            .context(error::ArchiveSnafu)?;
        self.manifest.config = name.to_string();
        Ok(())
    }

    pub async fn add_layer(&mut self, digest: &str, blob: &crate::element::Blob) -> Result<()> {
        debug!("writing layer {digest} to tarball");
        let member = format!("{digest}/layer.tar");
        let mut header = Self::member_header(blob.size());
        let reader = blob.reader().await?;
        self.builder
            .append_data(&mut header, member.as_str(), reader)
            .await
            .context(error::ArchiveSnafu)?;
        self.manifest.layers.push(member);
        Ok(())
    }

    /// Append `manifest.json` and flush the archive, returning the inner
    /// file.
    pub async fn finish(mut self) -> Result<tokio::fs::File> {
        debug!("writing manifest file to tarball");
        let encoded =
            serde_json::to_vec(&vec![self.manifest.clone()]).context(error::SerializeSnafu)?;
        let mut header = Self::member_header(encoded.len() as u64);
        self.builder
            .append_data(&mut header, "manifest.json", std::io::Cursor::new(encoded))
            .await
            .context(error::ArchiveSnafu)?;
        let mut file = self.builder.into_inner().await.context(error::ArchiveSnafu)?;
        use tokio::io::AsyncWriteExt;
        file.flush().await.context(error::FileSnafu)?;
        Ok(file)
    }
}

/// Writes the element stream to a save-tarball at a caller-supplied path.
pub struct TarballSink {
    path: PathBuf,
    writer: Option<V12TarWriter>,
}

impl TarballSink {
    pub async fn create(path: impl Into<PathBuf>, image: &str, tag: &str) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::File::create(&path)
            .await
            .context(error::FileSnafu)?;
        Ok(Self {
            path,
            writer: Some(V12TarWriter::new(file, image, tag)),
        })
    }

    fn writer(&mut self) -> Result<&mut V12TarWriter> {
        self.writer
            .as_mut()
            .ok_or(error::Error::ConfigMissing)
    }
}

#[async_trait]
impl ElementSink for TarballSink {
    async fn process(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data } => {
                self.writer()?.add_config(name.as_str(), data.as_ref()).await
            }
            Element::Layer {
                digest,
                blob: Some(blob),
            } => self.writer()?.add_layer(digest.as_str(), &blob).await,
            Element::Layer { digest, blob: None } => {
                error::BlobMissingSnafu { digest }.fail()
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let writer = self.writer.take().ok_or(error::Error::ConfigMissing)?;
        writer.finish().await?;
        info!("wrote image tarball {}", self.path.display());
        Ok(())
    }

    async fn abort(&mut self) {
        self.writer = None;
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            debug!("could not remove partial tarball: {err}");
        }
    }
}
