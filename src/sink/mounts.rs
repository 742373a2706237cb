//! Writes images as overlay-mount layouts: every layer extracted to its own
//! directory with whiteouts translated to overlayfs conventions, composed
//! into a rootfs with `mount -t overlay`.
//!
//! Whiteout translation follows what overlayfs expects on disk: a deleted
//! path becomes a 0:0 character device node, an opaque directory gets the
//! `trusted.overlay.opaque` xattr. Mounting requires privilege; the mount
//! itself is delegated to `mount(8)`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use snafu::ResultExt;
use tokio_tar::Archive;

use super::bundle::write_runtime_config;
use super::directory::{copy_blob_to, update_catalog, write_manifest_file, write_pretty_json};
use crate::element::{Blob, Element, ElementSink};
use crate::models::TarballManifest;
use crate::rootfs::{whiteout_of, Whiteout};
use crate::{error, Result};

pub struct MountsSink {
    image: String,
    tag: String,
    path: PathBuf,
    manifest: TarballManifest,
    config_name: Option<String>,
    config_data: Option<Bytes>,
}

impl MountsSink {
    pub async fn create(path: impl Into<PathBuf>, image: &str, tag: &str) -> Result<Self> {
        let path = path.into();
        tokio::fs::create_dir_all(&path)
            .await
            .context(error::DirectorySnafu)?;
        let short_name = image.rsplit('/').next().unwrap_or(image);
        Ok(Self {
            image: image.to_string(),
            tag: tag.to_string(),
            path,
            manifest: TarballManifest {
                config: String::new(),
                repo_tags: vec![format!("{short_name}:{tag}")],
                layers: Vec::new(),
            },
            config_name: None,
            config_data: None,
        })
    }

    /// Extract one layer into its overlay lowerdir, translating whiteouts.
    async fn extract_overlay_tree(&self, digest: &str, blob: &Blob) -> Result<()> {
        let dest = self.path.join(digest).join("extracted");
        tokio::fs::create_dir_all(&dest)
            .await
            .context(error::DirectorySnafu)?;

        let reader = blob.reader().await?;
        let mut archive = Archive::new(reader);
        let mut entries = archive.entries().context(error::ArchiveSnafu)?;
        while let Some(entry) = entries.next().await {
            let mut entry = entry.context(error::ArchiveSnafu)?;
            let member = entry
                .path()
                .context(error::ArchiveSnafu)?
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string();
            match overlay_whiteout(&dest, member.as_str()) {
                Some((target, Whiteout::Opaque { .. })) => {
                    rustix::fs::setxattr(
                        &target,
                        "trusted.overlay.opaque",
                        b"y",
                        rustix::fs::XattrFlags::empty(),
                    )
                    .map_err(|source| error::Error::Xattr {
                        path: target.clone(),
                        source,
                    })?;
                }
                Some((target, Whiteout::Single { .. })) => {
                    rustix::fs::mknodat(
                        rustix::fs::CWD,
                        &target,
                        rustix::fs::FileType::CharacterDevice,
                        rustix::fs::Mode::empty(),
                        0,
                    )
                    .map_err(|source| error::Error::Mknod {
                        path: target.clone(),
                        source,
                    })?;
                }
                None => {
                    entry.unpack_in(&dest).await.context(error::ArchiveSnafu)?;
                }
            }
        }
        Ok(())
    }

    /// Compose the per-layer trees into `rootfs/` with an overlay mount.
    /// The newest layer is listed first in lowerdir.
    async fn mount_rootfs(&self) -> Result<()> {
        let rootfs = self.path.join("rootfs");
        let working = self.path.join("working");
        let delta = self.path.join("delta");
        for dir in [&rootfs, &working, &delta] {
            tokio::fs::create_dir_all(dir)
                .await
                .context(error::DirectorySnafu)?;
        }

        let lowerdirs: Vec<String> = self
            .manifest
            .layers
            .iter()
            .rev()
            .map(|layer| {
                self.path
                    .join(layer.trim_end_matches("/layer.tar"))
                    .join("extracted")
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdirs.join(":"),
            delta.display(),
            working.display()
        );

        info!("mounting overlay rootfs at {}", rootfs.display());
        let output = tokio::process::Command::new("mount")
            .args(["-t", "overlay", "overlay", "-o", options.as_str()])
            .arg(&rootfs)
            .output()
            .await
            .context(error::FileSnafu)?;
        if !output.status.success() {
            return error::MountSnafu {
                stderr: String::from_utf8_lossy(output.stderr.as_slice()).to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

#[async_trait]
impl ElementSink for MountsSink {
    fn should_fetch(&self, digest: &str) -> bool {
        !self.path.join(digest).join("layer.tar").exists()
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { name, data } => {
                write_pretty_json(&self.path.join(name.as_str()), data.as_ref()).await?;
                self.config_name = Some(name.clone());
                self.config_data = Some(data);
                self.manifest.config = name;
                Ok(())
            }
            Element::Layer { digest, blob } => {
                let layer_rel = format!("{digest}/layer.tar");
                self.manifest.layers.push(layer_rel.clone());

                let layer_path = self.path.join(layer_rel.as_str());
                let exists = tokio::fs::try_exists(&layer_path)
                    .await
                    .context(error::FileSnafu)?;
                let Some(blob) = blob else {
                    // Declined fetch: the layer and its tree are on disk.
                    return Ok(());
                };
                tokio::fs::create_dir_all(self.path.join(digest.as_str()))
                    .await
                    .context(error::DirectorySnafu)?;
                if exists {
                    info!("skipping layer already in output directory");
                } else {
                    copy_blob_to(&blob, &layer_path).await?;
                    self.extract_overlay_tree(digest.as_str(), &blob).await?;
                }
                Ok(())
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        write_manifest_file(&self.path.join("manifest.json"), &self.manifest, None).await?;
        update_catalog(
            &self.path,
            self.image.as_str(),
            self.tag.as_str(),
            "manifest.json",
        )
        .await?;

        self.mount_rootfs().await?;

        let config_name = self.config_name.clone().ok_or(error::Error::ConfigMissing)?;
        let config_data = self.config_data.clone().ok_or(error::Error::ConfigMissing)?;
        tokio::fs::rename(
            self.path.join(config_name.as_str()),
            self.path.join("container-config.json"),
        )
        .await
        .context(error::FileSnafu)?;
        write_runtime_config(
            config_data.as_ref(),
            &self.path.join("config.json"),
            "ocistream",
        )
        .await
    }
}

/// Resolve a whiteout member to the on-disk path its overlay translation
/// targets.
fn overlay_whiteout(dest_root: &Path, member_path: &str) -> Option<(PathBuf, Whiteout)> {
    whiteout_of(member_path).map(|whiteout| {
        let target = match &whiteout {
            Whiteout::Opaque { dir } => dest_root.join(dir),
            Whiteout::Single { path } => dest_root.join(path),
        };
        (target, whiteout)
    })
}
