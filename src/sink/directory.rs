//! Writes images to an exploded directory: one subdirectory per layer blob,
//! the configuration alongside, a per-image manifest, and a `catalog.json`
//! naming every image/tag the directory holds.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use snafu::ResultExt;
use tokio_tar::Archive;

use crate::element::{Blob, Element, ElementSink, COPY_CHUNK};
use crate::models::TarballManifest;
use crate::rootfs::BundleMap;
use crate::{error, Result};

/// Parse-and-rewrite a JSON document with stable key order and indentation.
pub(crate) async fn write_pretty_json(path: &Path, raw: &[u8]) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).context(error::ConfigDeserializeSnafu)?;
    let pretty = serde_json::to_vec_pretty(&value).context(error::SerializeSnafu)?;
    tokio::fs::write(path, pretty)
        .await
        .context(error::FileSnafu)?;
    Ok(())
}

/// Read-modify-write the directory catalog, pointing `image:tag` at its
/// manifest file.
pub(crate) async fn update_catalog(
    root: &Path,
    image: &str,
    tag: &str,
    manifest_filename: &str,
) -> Result<()> {
    let catalog_path = root.join("catalog.json");
    let mut catalog: serde_json::Value = match tokio::fs::read(&catalog_path).await {
        Ok(raw) => serde_json::from_slice(raw.as_slice())
            .context(error::ManifestDeserializeSnafu)?,
        Err(_) => serde_json::json!({}),
    };
    catalog[image][tag] = serde_json::Value::String(manifest_filename.to_string());
    let pretty = serde_json::to_vec_pretty(&catalog).context(error::SerializeSnafu)?;
    tokio::fs::write(&catalog_path, pretty)
        .await
        .context(error::FileSnafu)?;
    Ok(())
}

/// Serialize and write the per-image manifest document.
pub(crate) async fn write_manifest_file(
    path: &Path,
    manifest: &TarballManifest,
    image_name: Option<&str>,
) -> Result<()> {
    let mut document =
        serde_json::to_value(manifest).context(error::SerializeSnafu)?;
    if let Some(image_name) = image_name {
        document["ImageName"] = serde_json::Value::String(image_name.to_string());
    }
    let pretty = serde_json::to_vec_pretty(&serde_json::Value::Array(vec![document]))
        .context(error::SerializeSnafu)?;
    tokio::fs::write(path, pretty)
        .await
        .context(error::FileSnafu)?;
    Ok(())
}

/// Copy a blob to a file in chunks.
pub(crate) async fn copy_blob_to(blob: &Blob, dest: &Path) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut reader = blob.reader().await?;
    let mut file = tokio::fs::File::create(dest)
        .await
        .context(error::FileSnafu)?;
    let mut buffer = vec![0u8; COPY_CHUNK];
    loop {
        let n = reader.read(&mut buffer).await.context(error::FileSnafu)?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).await.context(error::FileSnafu)?;
    }
    file.flush().await.context(error::FileSnafu)?;
    Ok(())
}

pub struct DirectorySink {
    image: String,
    tag: String,
    path: PathBuf,
    unique_names: bool,
    expand: bool,
    extract: bool,
    pub(crate) manifest: TarballManifest,
    pub(crate) bundle: BundleMap,
}

impl DirectorySink {
    pub async fn create(
        path: impl Into<PathBuf>,
        image: &str,
        tag: &str,
        unique_names: bool,
        expand: bool,
        extract: bool,
    ) -> Result<Self> {
        let path = path.into();
        tokio::fs::create_dir_all(&path)
            .await
            .context(error::DirectorySnafu)?;
        let short_name = image.rsplit('/').next().unwrap_or(image);
        Ok(Self {
            image: image.to_string(),
            tag: tag.to_string(),
            path,
            unique_names,
            expand,
            extract,
            manifest: TarballManifest {
                config: String::new(),
                repo_tags: vec![format!("{short_name}:{tag}")],
                layers: Vec::new(),
            },
            bundle: BundleMap::default(),
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.path
    }

    fn manifest_filename(&self) -> String {
        if self.unique_names {
            format!(
                "manifest-{}-{}.json",
                self.image.replace('/', "_"),
                self.tag.replace('/', "_")
            )
        } else {
            "manifest.json".to_string()
        }
    }

    async fn extract_layer_tree(&self, digest: &str, blob: &Blob) -> Result<()> {
        let dest = self.path.join(digest).join("extracted");
        tokio::fs::create_dir_all(&dest)
            .await
            .context(error::DirectorySnafu)?;
        let reader = blob.reader().await?;
        let mut archive = Archive::new(reader);
        let mut entries = archive.entries().context(error::ArchiveSnafu)?;
        while let Some(entry) = entries.next().await {
            let mut entry = entry.context(error::ArchiveSnafu)?;
            entry.unpack_in(&dest).await.context(error::ArchiveSnafu)?;
        }
        Ok(())
    }

    async fn store_layer(&mut self, digest: &str, blob: Option<Blob>) -> Result<()> {
        let layer_rel = format!("{digest}/layer.tar");
        self.manifest.layers.push(layer_rel.clone());

        let layer_dir = self.path.join(digest);
        tokio::fs::create_dir_all(&layer_dir)
            .await
            .context(error::DirectorySnafu)?;
        let layer_path = self.path.join(layer_rel.as_str());

        let blob = match blob {
            Some(blob) => {
                if tokio::fs::try_exists(&layer_path)
                    .await
                    .context(error::FileSnafu)?
                {
                    info!("skipping layer already in output directory");
                } else {
                    copy_blob_to(&blob, &layer_path).await?;
                }
                blob
            }
            // The fetch was declined because the blob is already on disk.
            None => Blob::from_path(layer_path.clone()).await?,
        };

        if self.extract {
            self.extract_layer_tree(digest, &blob).await?;
        }
        if self.expand {
            self.bundle.record_layer(layer_rel.as_str(), &blob).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ElementSink for DirectorySink {
    fn should_fetch(&self, digest: &str) -> bool {
        let layer_path = self.path.join(digest).join("layer.tar");
        !layer_path.exists()
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data } => {
                write_pretty_json(&self.path.join(name.as_str()), data.as_ref()).await?;
                self.manifest.config = name;
                Ok(())
            }
            Element::Layer { digest, blob } => self.store_layer(digest.as_str(), blob).await,
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.expand {
            self.bundle.log_savings();
        }

        let manifest_filename = self.manifest_filename();
        write_manifest_file(
            &self.path.join(manifest_filename.as_str()),
            &self.manifest,
            self.unique_names.then_some(self.image.as_str()),
        )
        .await?;
        update_catalog(
            &self.path,
            self.image.as_str(),
            self.tag.as_str(),
            manifest_filename.as_str(),
        )
        .await?;

        if self.expand {
            let dest = self
                .path
                .join(manifest_filename.trim_end_matches(".json"));
            info!("writing merged image tree to {}", dest.display());
            self.bundle.extract_merged(&self.path, &dest).await?;
        }
        Ok(())
    }
}
