//! Reads images back out of an exploded directory written by the directory
//! sink, located through its `catalog.json`.

use std::path::PathBuf;

use async_trait::async_trait;
use snafu::ResultExt;

use crate::element::{Blob, Element, ElementSink};
use crate::models::TarballManifest;
use crate::source::ImageSource;
use crate::{error, Result};

#[derive(Debug)]
pub struct DirectorySource {
    path: PathBuf,
    image: String,
    tag: String,
    manifest: TarballManifest,
}

impl DirectorySource {
    pub async fn open(path: impl Into<PathBuf>, image: &str, tag: &str) -> Result<Self> {
        let path = path.into();
        let catalog_path = path.join("catalog.json");
        let catalog: serde_json::Value = match tokio::fs::read(&catalog_path).await {
            Ok(raw) => serde_json::from_slice(raw.as_slice())
                .context(error::ManifestDeserializeSnafu)?,
            Err(_) => {
                return error::CatalogEntrySnafu {
                    image: image.to_string(),
                    tag: tag.to_string(),
                }
                .fail()
            }
        };
        let Some(manifest_filename) = catalog
            .get(image)
            .and_then(|tags| tags.get(tag))
            .and_then(|name| name.as_str())
        else {
            return error::CatalogEntrySnafu {
                image: image.to_string(),
                tag: tag.to_string(),
            }
            .fail();
        };

        let raw = tokio::fs::read(path.join(manifest_filename))
            .await
            .context(error::FileSnafu)?;
        let mut documents: Vec<TarballManifest> =
            serde_json::from_slice(raw.as_slice()).context(error::ManifestDeserializeSnafu)?;
        if documents.is_empty() {
            use serde::de::Error as _;
            return Err(error::Error::ManifestDeserialize {
                source: serde_json::Error::custom("manifest holds no images"),
            });
        }
        Ok(Self {
            path,
            image: image.to_string(),
            tag: tag.to_string(),
            manifest: documents.remove(0),
        })
    }
}

#[async_trait]
impl ImageSource for DirectorySource {
    fn image(&self) -> &str {
        &self.image
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn stream_to(&mut self, sink: &mut dyn ElementSink) -> Result<()> {
        let config_path = self.path.join(&self.manifest.config);
        let data = tokio::fs::read(&config_path)
            .await
            .context(error::FileSnafu)?;
        sink.process(Element::config(self.manifest.config.clone(), data))
            .await?;

        for layer in self.manifest.layers.clone() {
            let digest = TarballManifest::layer_digest(layer.as_str());
            if !sink.should_fetch(digest.as_str()) {
                sink.process(Element::layer(digest, None)).await?;
                continue;
            }
            let blob = Blob::from_path(self.path.join(layer.as_str())).await?;
            sink.process(Element::layer(digest, Some(blob))).await?;
        }
        Ok(())
    }
}
