//! Pushes the element stream to a registry: each layer is compressed and
//! uploaded by an independent worker task while the stream keeps flowing,
//! and the manifest is authored in `finalize` from the futures in submission
//! order, preserving stream order whatever the completion order was.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::client::{BodySource, RegistryHttp, Scope};
use crate::compression::Compress;
use crate::element::{sha256_hex, Blob, Element, ElementSink};
use crate::models::{
    Compression, Descriptor, MediaType, RegistryEndpoint, RegistryManifest,
};
use crate::{error, Result};

pub const DEFAULT_WORKERS: usize = 4;

/// How often the push reports progress.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Progress {
    submitted: AtomicUsize,
    completed: AtomicUsize,
}

/// Upload one blob unless the registry already has it: HEAD the digest, and
/// on a miss POST for an upload location then PUT the bytes.
async fn upload_blob(
    http: &RegistryHttp,
    wire_digest: &str,
    size: u64,
    body: BodySource,
) -> Result<()> {
    let probe = http
        .execute(
            Method::HEAD,
            http.blob_url(wire_digest)?,
            None,
            None,
            BodySource::None,
        )
        .await?;
    if probe.status().is_success() {
        info!("blob {wire_digest} already exists, skipping upload");
        return Ok(());
    }

    info!("uploading blob {wire_digest} ({size} bytes)");
    let started = http
        .execute(
            Method::POST,
            http.upload_url()?,
            None,
            None,
            BodySource::None,
        )
        .await?;
    let status = started.status();
    if status != StatusCode::OK && status != StatusCode::ACCEPTED && status != StatusCode::CREATED {
        return error::StartUploadSnafu {
            status: status.as_u16(),
        }
        .fail();
    }
    let location = started
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(error::Error::StartUploadNoLocation)?;
    let mut upload_url = http.location_url(location)?;
    upload_url
        .query_pairs_mut()
        .append_pair("digest", wire_digest);

    let finished = http
        .execute(
            Method::PUT,
            upload_url,
            None,
            Some("application/octet-stream"),
            body,
        )
        .await?;
    if !finished.status().is_success() {
        return error::UploadBlobSnafu {
            digest: wire_digest.to_string(),
            status: finished.status().as_u16(),
        }
        .fail();
    }
    debug!("blob {wire_digest} uploaded");
    Ok(())
}

/// Compress a layer to a spooled temporary, then upload it under the digest
/// of its compressed bytes. Returns the descriptor the manifest will carry.
async fn push_layer(
    http: Arc<RegistryHttp>,
    blob: Blob,
    compression: Compression,
    temp_dir: Option<PathBuf>,
) -> Result<Descriptor> {
    let reader = blob.reader().await?;
    let (compressed, wire_hex) =
        Blob::spool(Compress::new(compression, reader), temp_dir.as_deref()).await?;
    let wire_digest = format!("sha256:{wire_hex}");

    let body = match compressed.backing_path() {
        Some(path) => BodySource::File(path.to_path_buf()),
        None => BodySource::Bytes(compressed.to_bytes().await?),
    };
    upload_blob(&http, wire_digest.as_str(), compressed.size(), body).await?;
    Ok(Descriptor {
        media_type: MediaType::for_layer(compression, false),
        size: compressed.size(),
        digest: wire_digest,
    })
}

/// Pushes an image to a registry over the Docker Registry HTTP API v2.
pub struct RegistrySink {
    http: Arc<RegistryHttp>,
    image: String,
    tag: String,
    compression: Compression,
    temp_dir: Option<PathBuf>,
    semaphore: Arc<Semaphore>,
    progress: Arc<Progress>,
    reporter: Option<JoinHandle<()>>,
    config: Option<Descriptor>,
    uploads: Vec<JoinHandle<Result<Descriptor>>>,
}

impl RegistrySink {
    pub async fn connect(
        endpoint: RegistryEndpoint,
        compression: Compression,
        workers: usize,
        temp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let http = RegistryHttp::connect(
            endpoint.host.as_str(),
            endpoint.image.as_str(),
            endpoint.secure,
            Scope::PullPush,
            endpoint.username,
            endpoint.password,
        )
        .await?;
        Ok(Self {
            http: Arc::new(http),
            image: endpoint.image,
            tag: endpoint.tag,
            compression,
            temp_dir,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            progress: Arc::new(Progress::default()),
            reporter: None,
            config: None,
            uploads: Vec::new(),
        })
    }

    fn start_reporter(&mut self) {
        if self.reporter.is_some() {
            return;
        }
        let progress = self.progress.clone();
        self.reporter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let submitted = progress.submitted.load(Ordering::Relaxed);
                let completed = progress.completed.load(Ordering::Relaxed);
                info!(
                    "pushed {completed}/{submitted} layers, {} remaining",
                    submitted.saturating_sub(completed)
                );
            }
        }));
    }

    fn stop_reporter(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
    }

    async fn push_config(&mut self, data: Bytes) -> Result<()> {
        let digest = format!("sha256:{}", sha256_hex(data.as_ref()));
        info!("pushing config {digest}");
        upload_blob(
            &self.http,
            digest.as_str(),
            data.len() as u64,
            BodySource::Bytes(data.clone()),
        )
        .await?;
        self.config = Some(Descriptor {
            media_type: MediaType::DockerContainerImage,
            size: data.len() as u64,
            digest,
        });
        Ok(())
    }

    async fn push_manifest(&self, layers: Vec<Descriptor>) -> Result<()> {
        let config = self.config.clone().ok_or(error::Error::ConfigMissing)?;
        let manifest = RegistryManifest {
            schema_version: 2,
            media_type: Some(MediaType::DockerManifest),
            config,
            layers,
        };
        let body = serde_json::to_vec(&manifest).context(error::SerializeSnafu)?;

        info!("pushing manifest for {}:{}", self.image, self.tag);
        let response = self
            .http
            .execute(
                Method::PUT,
                self.http.manifest_url(self.tag.as_str())?,
                None,
                Some(MediaType::DockerManifest.to_string().as_str()),
                BodySource::Bytes(Bytes::from(body)),
            )
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return error::PushManifestSnafu {
                reference: self.tag.clone(),
                status,
                body,
            }
            .fail();
        }
        info!("image pushed successfully: {}:{}", self.image, self.tag);
        Ok(())
    }
}

#[async_trait]
impl ElementSink for RegistrySink {
    async fn process(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Config { data, .. } => self.push_config(data).await,
            Element::Layer {
                digest,
                blob: Some(blob),
            } => {
                debug!("scheduling upload of layer {digest}");
                self.start_reporter();
                self.progress.submitted.fetch_add(1, Ordering::Relaxed);

                let http = self.http.clone();
                let compression = self.compression;
                let temp_dir = self.temp_dir.clone();
                let semaphore = self.semaphore.clone();
                let progress = self.progress.clone();
                self.uploads.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    let result = push_layer(http, blob, compression, temp_dir).await;
                    progress.completed.fetch_add(1, Ordering::Relaxed);
                    result
                }));
                Ok(())
            }
            Element::Layer { digest, blob: None } => {
                error::BlobMissingSnafu { digest }.fail()
            }
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        let uploads = std::mem::take(&mut self.uploads);
        let mut layers = Vec::with_capacity(uploads.len());
        let mut failures = Vec::new();
        for upload in uploads {
            match upload.await {
                Ok(Ok(descriptor)) => layers.push(descriptor),
                Ok(Err(err)) => failures.push(err.to_string()),
                Err(err) => failures.push(format!("worker task failed: {err}")),
            }
        }
        self.stop_reporter();

        if !failures.is_empty() {
            return error::UploadsFailedSnafu { reasons: failures }.fail();
        }
        self.push_manifest(layers).await
    }

    async fn abort(&mut self) {
        for upload in self.uploads.drain(..) {
            upload.abort();
        }
        self.stop_reporter();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layer_media_types_follow_compression() {
        assert_eq!(
            MediaType::for_layer(Compression::Gzip, false).to_string(),
            "application/vnd.docker.image.rootfs.diff.tar.gzip"
        );
        assert_eq!(
            MediaType::for_layer(Compression::Zstd, false).to_string(),
            "application/vnd.docker.image.rootfs.diff.tar.zstd"
        );
        assert_eq!(
            MediaType::for_layer(Compression::Gzip, true).to_string(),
            "application/vnd.oci.image.layer.v1.tar+gzip"
        );
    }

    #[tokio::test]
    async fn test_wire_digest_is_hash_of_compressed_bytes() {
        let payload = b"layer payload".repeat(50);
        let blob = Blob::from_bytes(payload.clone());
        let reader = blob.reader().await.unwrap();
        let (compressed, wire_hex) = Blob::spool(
            Compress::new(Compression::Gzip, reader),
            None,
        )
        .await
        .unwrap();
        let bytes = compressed.to_bytes().await.unwrap();
        assert_eq!(wire_hex, sha256_hex(bytes.as_ref()));
        // Compressed bytes decompress back to the layer.
        let restored =
            crate::compression::decompress_bytes(Compression::Gzip, bytes.as_ref())
                .await
                .unwrap();
        assert_eq!(restored, payload);
    }

    #[tokio::test]
    async fn test_identical_content_has_identical_wire_digest() {
        // The dedup HEAD probe relies on compression being deterministic for
        // identical input.
        let payload = b"identical bytes".repeat(100);
        let mut digests = Vec::new();
        for _ in 0..2 {
            let blob = Blob::from_bytes(payload.clone());
            let reader = blob.reader().await.unwrap();
            let (_, hex) = Blob::spool(Compress::new(Compression::Gzip, reader), None)
                .await
                .unwrap();
            digests.push(hex);
        }
        assert_eq!(digests[0], digests[1]);
    }

    use crate::testutil::FakeRegistry;

    const CONFIG: &[u8] = b"{\"os\":\"linux\",\"architecture\":\"amd64\"}";

    fn test_layers(count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| format!("layer {i} content ").repeat(50 + i * 120).into_bytes())
            .collect()
    }

    async fn push_image(server: &FakeRegistry, tag: &str, workers: usize, layers: &[Vec<u8>]) {
        let endpoint = RegistryEndpoint {
            host: server.host(),
            image: "test/image".to_string(),
            tag: tag.to_string(),
            secure: false,
            username: None,
            password: None,
        };
        let mut sink = RegistrySink::connect(endpoint, Compression::Gzip, workers, None)
            .await
            .unwrap();
        sink.process(Element::config("cfg.json", CONFIG)).await.unwrap();
        for (i, content) in layers.iter().enumerate() {
            sink.process(Element::layer(
                format!("diff{i}"),
                Some(Blob::from_bytes(content.clone())),
            ))
            .await
            .unwrap();
        }
        sink.finalize().await.unwrap();
    }

    async fn expected_wire_digests(layers: &[Vec<u8>]) -> Vec<String> {
        let mut digests = Vec::new();
        for content in layers {
            let compressed =
                crate::compression::compress_bytes(Compression::Gzip, content.as_slice())
                    .await
                    .unwrap();
            digests.push(format!("sha256:{}", sha256_hex(compressed.as_slice())));
        }
        digests
    }

    #[tokio::test]
    async fn test_second_push_uploads_no_blobs() {
        let server = FakeRegistry::start().await;
        let layers = test_layers(2);

        push_image(&server, "v1", 4, layers.as_slice()).await;
        let (heads_first, uploads_first, blob_puts_first, manifest_puts_first) = server.counts();
        // Config plus both layers were absent and had to be uploaded.
        assert_eq!(blob_puts_first, 3);
        assert_eq!(uploads_first, 3);
        assert_eq!(manifest_puts_first, 1);

        // The identical content under a second tag dedups on the HEAD probe;
        // no POST or PUT reaches the blob store.
        push_image(&server, "v2", 4, layers.as_slice()).await;
        let (heads_second, uploads_second, blob_puts_second, manifest_puts_second) =
            server.counts();
        assert_eq!(blob_puts_second, blob_puts_first);
        assert_eq!(uploads_second, uploads_first);
        assert_eq!(manifest_puts_second, manifest_puts_first + 1);
        assert!(heads_second > heads_first);

        // Same content, same manifest: layer and config digests match.
        assert_eq!(server.manifest("v1").unwrap(), server.manifest("v2").unwrap());
    }

    #[tokio::test]
    async fn test_concurrency_levels_author_identical_manifests() {
        let server = FakeRegistry::start().await;
        let layers = test_layers(5);

        push_image(&server, "one", 1, layers.as_slice()).await;
        push_image(&server, "many", 4, layers.as_slice()).await;

        let sequential = server.manifest("one").unwrap();
        let concurrent = server.manifest("many").unwrap();
        assert_eq!(sequential, concurrent);
        assert_eq!(
            sequential["config"]["digest"],
            concurrent["config"]["digest"]
        );

        // The manifest lists layers in submission order whatever order the
        // workers finished in.
        let expected = expected_wire_digests(layers.as_slice()).await;
        let listed: Vec<String> = sequential["layers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|layer| layer["digest"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(listed, expected);
        for digest in &listed {
            assert!(digest.starts_with("sha256:"));
        }
    }
}
