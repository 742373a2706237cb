//! Loads the element stream into a local Docker or Podman daemon.
//!
//! Elements are collected into a v1.2 save-tarball in a temporary file,
//! which `finalize` posts to the daemon's `/images/load` endpoint. The
//! temporary is released on success and failure alike.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::image::ImportImageOptions;
use bollard::Docker;
use futures::TryStreamExt;
use snafu::ResultExt;
use bytes::Bytes;
use tempfile::TempPath;

use super::tarball::V12TarWriter;
use crate::element::{Element, ElementSink};
use crate::source::daemon::DEFAULT_SOCKET_PATH;
use crate::{error, Result};

const DAEMON_TIMEOUT: u64 = 120;

pub struct DaemonSink {
    docker: Docker,
    image: String,
    tag: String,
    spool: Option<(TempPath, V12TarWriter)>,
}

impl DaemonSink {
    pub async fn connect(
        image: &str,
        tag: &str,
        socket_path: Option<&str>,
        temp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let socket = socket_path.unwrap_or(DEFAULT_SOCKET_PATH);
        let docker = Docker::connect_with_unix(socket, DAEMON_TIMEOUT, bollard::API_DEFAULT_VERSION)
            .context(error::DaemonSnafu)?;

        let tmp = match temp_dir.as_deref() {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new(),
        }
        .context(error::TempFileSnafu)?;
        let path = tmp.into_temp_path();
        let file = tokio::fs::File::create(&path)
            .await
            .context(error::TempFileSnafu)?;

        Ok(Self {
            docker,
            image: image.to_string(),
            tag: tag.to_string(),
            spool: Some((path, V12TarWriter::new(file, image, tag))),
        })
    }

    fn writer(&mut self) -> Result<&mut V12TarWriter> {
        self.spool
            .as_mut()
            .map(|(_, writer)| writer)
            .ok_or(error::Error::ConfigMissing)
    }
}

#[async_trait]
impl ElementSink for DaemonSink {
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
        let (path, writer) = self.spool.take().ok_or(error::Error::ConfigMissing)?;
        writer.finish().await?;

        info!(
            "loading image {}:{} into the daemon",
            self.image, self.tag
        );
        let data = tokio::fs::read(&path).await.context(error::TempFileSnafu)?;
        let body = Bytes::from(data);
        self.docker
            .import_image(ImportImageOptions { quiet: true }, body, None)
            .try_collect::<Vec<_>>()
            .await
            .context(error::DaemonSnafu)?;
        info!("image loaded successfully: {}:{}", self.image, self.tag);
        // `path` drops here, releasing the spool file.
        Ok(())
    }

    async fn abort(&mut self) {
        self.spool = None;
    }
}
