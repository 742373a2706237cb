//! Ordered streaming of `docker save` style tarballs.
//!
//! Both tarball layouts put `manifest.json` last in the stream, while the
//! pipeline needs the configuration first and layers in manifest order. This
//! module walks the tar sequentially without seeking, spools only
//! out-of-order members to temporary files, and emits elements the moment
//! order allows. The daemon source feeds it a manifest pre-computed from the
//! daemon's inspect data so OCI-layout exports stream with no buffering at
//! all; the tarball source pre-scans the archive for its manifest instead.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::Bytes;
use futures::StreamExt;
use serde::de::Error as _;
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tar::Archive;

use crate::compression::{self, Decompress, DETECT_PROBE_LEN};
use crate::element::{Blob, Element, ElementSink};
use crate::models::{Compression, TarballManifest};
use crate::{error, Result};

const MANIFEST_MEMBER: &str = "manifest.json";
const LEGACY_REPOSITORIES_MEMBER: &str = "repositories";

/// Image identity extracted from a daemon inspect call: the config digest
/// (image id) and the layer DiffIDs, all bare hex. Enough to pre-compute the
/// whole manifest for an OCI layout export, and the config filename for a
/// legacy one.
#[derive(Debug, Clone)]
pub(crate) struct InspectHint {
    pub image_id: String,
    pub diff_ids: Vec<String>,
    pub repo_tag: String,
}

impl InspectHint {
    fn oci_manifest(&self) -> TarballManifest {
        TarballManifest {
            config: format!("blobs/sha256/{}", self.image_id),
            repo_tags: vec![self.repo_tag.clone()],
            layers: self
                .diff_ids
                .iter()
                .map(|diff_id| format!("blobs/sha256/{diff_id}"))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Legacy,
    Oci,
}

pub(crate) struct SaveTarStreamer {
    temp_dir: Option<PathBuf>,
    hint: Option<InspectHint>,
    layout: Option<Layout>,
    manifest: Option<TarballManifest>,
    /// True once the manifest came from the archive itself rather than the
    /// inspect pre-computation.
    manifest_confirmed: bool,
    config_emitted: bool,
    next_index: usize,
    buffered: HashMap<String, Blob>,
    saw_repositories: bool,
}

impl SaveTarStreamer {
    /// Stream with the manifest already in hand (pre-scanned from a file).
    pub fn with_manifest(manifest: TarballManifest, temp_dir: Option<PathBuf>) -> Self {
        Self {
            temp_dir,
            hint: None,
            layout: None,
            manifest: Some(manifest),
            manifest_confirmed: true,
            config_emitted: false,
            next_index: 0,
            buffered: HashMap::new(),
            saw_repositories: false,
        }
    }

    /// Stream with inspect data only; the manifest is pre-computed once the
    /// layout is known (OCI) or read off the archive (legacy).
    pub fn with_hint(hint: InspectHint, temp_dir: Option<PathBuf>) -> Self {
        Self {
            temp_dir,
            hint: Some(hint),
            layout: None,
            manifest: None,
            manifest_confirmed: false,
            config_emitted: false,
            next_index: 0,
            buffered: HashMap::new(),
            saw_repositories: false,
        }
    }

    /// The member path holding the configuration, as far as it is known.
    fn config_member(&self) -> Option<String> {
        if let Some(manifest) = self.manifest.as_ref() {
            return Some(manifest.config.clone());
        }
        let hint = self.hint.as_ref()?;
        match self.layout? {
            Layout::Legacy => Some(format!("{}.json", hint.image_id)),
            Layout::Oci => Some(format!("blobs/sha256/{}", hint.image_id)),
        }
    }

    fn expected_layer(&self) -> Option<&str> {
        self.manifest
            .as_ref()
            .and_then(|manifest| manifest.layers.get(self.next_index))
            .map(String::as_str)
    }

    fn is_pending_layer(&self, path: &str) -> bool {
        self.manifest
            .as_ref()
            .map(|manifest| {
                manifest.layers[self.next_index..]
                    .iter()
                    .any(|layer| layer == path)
            })
            .unwrap_or(false)
    }

    fn referenced_again(&self, path: &str) -> bool {
        self.manifest
            .as_ref()
            .map(|manifest| {
                manifest
                    .layers
                    .get(self.next_index + 1..)
                    .unwrap_or_default()
                    .iter()
                    .any(|layer| layer == path)
            })
            .unwrap_or(false)
    }

    /// Decide the archive layout from the first concrete file member.
    fn decide_layout(&mut self, path: &str) {
        if self.layout.is_some() {
            return;
        }
        if matches!(
            path,
            MANIFEST_MEMBER | LEGACY_REPOSITORIES_MEMBER | "oci-layout" | "index.json"
        ) {
            return;
        }
        let layout = if path.starts_with("blobs/") {
            Layout::Oci
        } else {
            Layout::Legacy
        };
        debug!("archive layout is {layout:?}");
        self.layout = Some(layout);

        if layout == Layout::Oci && self.manifest.is_none() {
            if let Some(hint) = self.hint.as_ref() {
                debug!("pre-computed manifest from inspect data");
                self.manifest = Some(hint.oci_manifest());
            }
        }
    }

    async fn emit_config(&mut self, sink: &mut dyn ElementSink, data: Bytes) -> Result<()> {
        let hex = match self.manifest.as_ref() {
            Some(manifest) => manifest.config_hex(),
            None => self
                .hint
                .as_ref()
                .map(|hint| hint.image_id.clone())
                .unwrap_or_default(),
        };
        info!("emitting config {hex}.json");
        sink.process(Element::config(format!("{hex}.json"), data))
            .await?;
        self.config_emitted = true;
        Ok(())
    }

    /// Decompress an OCI blob if its magic says so. Legacy layer members are
    /// always plain tar. An all-zero prefix is an empty tar archive and
    /// passes through untouched.
    async fn into_layer_blob(&self, path: &str, blob: Blob) -> Result<Blob> {
        if self.layout != Some(Layout::Oci) {
            return Ok(blob);
        }
        let mut reader = blob.reader().await?;
        let mut probe = vec![0u8; DETECT_PROBE_LEN.min(blob.size() as usize)];
        reader
            .read_exact(&mut probe)
            .await
            .context(error::FileSnafu)?;
        let detected = match compression::detect(probe.as_slice()) {
            Some(compression) => compression,
            None if probe.iter().all(|byte| *byte == 0) => Compression::None,
            None => {
                return error::UnknownCompressionSnafu {
                    resource: path.to_string(),
                }
                .fail()
            }
        };
        if detected == Compression::None {
            return Ok(blob);
        }
        debug!("decompressing {detected} blob {path}");
        let reader = blob.reader().await?;
        let (decompressed, _) =
            Blob::spool(Decompress::new(detected, reader), self.temp_dir.as_deref()).await?;
        Ok(decompressed)
    }

    async fn emit_layer(
        &mut self,
        sink: &mut dyn ElementSink,
        path: &str,
        blob: Option<Blob>,
    ) -> Result<()> {
        let digest = TarballManifest::layer_digest(path);
        match blob {
            Some(blob) => {
                let blob = self.into_layer_blob(path, blob).await?;
                sink.process(Element::layer(digest, Some(blob))).await?;
            }
            None => {
                sink.process(Element::layer(digest, None)).await?;
            }
        }
        self.next_index += 1;
        Ok(())
    }

    /// Emit every buffered member that has become next-expected.
    async fn flush_buffered(&mut self, sink: &mut dyn ElementSink) -> Result<()> {
        if !self.config_emitted {
            return Ok(());
        }
        while let Some(expected) = self.expected_layer().map(str::to_string) {
            let Some(blob) = self.buffered.get(expected.as_str()).cloned() else {
                break;
            };
            let digest = TarballManifest::layer_digest(expected.as_str());
            let blob = sink.should_fetch(digest.as_str()).then_some(blob);
            self.emit_layer(sink, expected.as_str(), blob).await?;
        }
        Ok(())
    }

    fn resolve_manifest(&mut self, data: &[u8]) -> Result<()> {
        let mut documents: Vec<TarballManifest> =
            serde_json::from_slice(data).context(error::ManifestDeserializeSnafu)?;
        if documents.is_empty() {
            return Err(error::Error::ManifestDeserialize {
                source: serde_json::Error::custom("manifest.json holds no images"),
            });
        }
        let actual = documents.remove(0);

        match self.manifest.as_ref() {
            Some(expected) if !self.manifest_confirmed => {
                if expected.config != actual.config || expected.layers != actual.layers {
                    warn!(
                        "archive manifest disagrees with inspect data, \
                         following the archive"
                    );
                    self.manifest = Some(actual);
                } else {
                    debug!("archive manifest matches pre-computed manifest");
                }
            }
            Some(_) => {}
            None => {
                if self.config_emitted {
                    if let Some(hint) = self.hint.as_ref() {
                        let expected = format!("{}.json", hint.image_id);
                        if actual.config != expected {
                            warn!(
                                "archive config filename {} disagrees with inspect data",
                                actual.config
                            );
                        }
                    }
                }
                self.manifest = Some(actual);
            }
        }
        self.manifest_confirmed = true;
        Ok(())
    }

    /// Walk the archive and push its elements into the sink in manifest
    /// order. Temporary files spooled along the way are released whether the
    /// stream completes or fails.
    pub async fn stream<R>(mut self, reader: R, sink: &mut dyn ElementSink) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut archive = Archive::new(reader);
        let mut entries = archive.entries().context(error::ArchiveSnafu)?;

        while let Some(entry) = entries.next().await {
            let mut entry = entry.context(error::ArchiveSnafu)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry
                .path()
                .context(error::ArchiveSnafu)?
                .to_string_lossy()
                .to_string();
            trace!("archive member {path}");
            self.decide_layout(path.as_str());

            if path == LEGACY_REPOSITORIES_MEMBER {
                self.saw_repositories = true;
                continue;
            }

            if path == MANIFEST_MEMBER {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .await
                    .context(error::ArchiveSnafu)?;
                self.resolve_manifest(data.as_slice())?;
                if !self.config_emitted {
                    if let Some(member) = self.config_member() {
                        if let Some(blob) = self.buffered.get(member.as_str()).cloned() {
                            let data = blob.to_bytes().await?;
                            self.emit_config(sink, data).await?;
                        }
                    }
                }
                self.flush_buffered(sink).await?;
                continue;
            }

            if !self.config_emitted && self.config_member().as_deref() == Some(path.as_str()) {
                let mut data = Vec::new();
                entry
                    .read_to_end(&mut data)
                    .await
                    .context(error::ArchiveSnafu)?;
                self.emit_config(sink, Bytes::from(data)).await?;
                self.flush_buffered(sink).await?;
                continue;
            }

            if self.manifest.is_some() {
                if self.config_emitted && self.expected_layer() == Some(path.as_str()) {
                    let digest = TarballManifest::layer_digest(path.as_str());
                    let again = self.referenced_again(path.as_str());
                    if !sink.should_fetch(digest.as_str()) && !again {
                        info!("sink declined layer {digest}");
                        self.emit_layer(sink, path.as_str(), None).await?;
                    } else {
                        let (blob, _) =
                            Blob::spool(&mut entry, self.temp_dir.as_deref()).await?;
                        if again {
                            self.buffered.insert(path.clone(), blob.clone());
                        }
                        let blob = sink.should_fetch(digest.as_str()).then_some(blob);
                        self.emit_layer(sink, path.as_str(), blob).await?;
                    }
                    self.flush_buffered(sink).await?;
                } else if self.is_pending_layer(path.as_str()) {
                    debug!("buffering out-of-order member {path}");
                    let (blob, _) = Blob::spool(&mut entry, self.temp_dir.as_deref()).await?;
                    self.buffered.insert(path, blob);
                    self.flush_buffered(sink).await?;
                } else {
                    trace!("ignoring member {path}");
                }
            } else {
                // The manifest is still unknown; anything could turn out to
                // be a layer or the configuration.
                debug!("buffering member {path} until the manifest is known");
                let (blob, _) = Blob::spool(&mut entry, self.temp_dir.as_deref()).await?;
                self.buffered.insert(path, blob);
            }
        }

        let Some(manifest) = self.manifest.clone() else {
            return if self.saw_repositories {
                error::PreManifestTarballSnafu.fail()
            } else {
                error::ManifestMissingSnafu.fail()
            };
        };

        if !self.config_emitted {
            return error::ConfigMissingSnafu.fail();
        }

        // Anything still owed to the manifest must be sitting in the buffer.
        while self.next_index < manifest.layers.len() {
            let expected = manifest.layers[self.next_index].clone();
            let digest = TarballManifest::layer_digest(expected.as_str());
            let Some(blob) = self.buffered.get(expected.as_str()).cloned() else {
                return error::BlobMissingSnafu { digest }.fail();
            };
            let blob = sink.should_fetch(digest.as_str()).then_some(blob);
            self.emit_layer(sink, expected.as_str(), blob).await?;
        }

        info!("archive stream complete");
        Ok(())
    }
}
