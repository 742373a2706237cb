//! Pulls images from a Docker Registry HTTP API v2 / OCI distribution
//! registry, fetching layers on a worker pool while emitting them in
//! manifest order.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use crate::client::{BodySource, RegistryHttp, Scope};
use crate::compression::Decompress;
use crate::element::{Blob, Element, ElementSink, COPY_CHUNK};
use crate::models::{
    Descriptor, ManifestIndex, Platform, RegistryEndpoint, RegistryManifest, MANIFEST_ACCEPT,
};
use crate::source::ImageSource;
use crate::{error, Result};

/// Attempts after the first, with exponential backoff between them.
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE: u64 = 2;

pub const DEFAULT_WORKERS: usize = 4;

/// Counts the compressed bytes flowing through a download so the wire digest
/// can be verified while the decompressed stream goes to disk.
struct HashingReader<R> {
    inner: R,
    hasher: Arc<Mutex<Sha256>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.hasher
                    .lock()
                    .unwrap()
                    .update(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// An image on a registry, readable as an element stream.
pub struct RegistrySource {
    http: Arc<RegistryHttp>,
    image: String,
    tag: String,
    platform: Platform,
    workers: usize,
    temp_dir: Option<PathBuf>,
}

impl RegistrySource {
    pub async fn connect(
        endpoint: RegistryEndpoint,
        platform: Platform,
        workers: usize,
        temp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let http = RegistryHttp::connect(
            endpoint.host.as_str(),
            endpoint.image.as_str(),
            endpoint.secure,
            Scope::Pull,
            endpoint.username,
            endpoint.password,
        )
        .await?;
        Ok(Self {
            http: Arc::new(http),
            image: endpoint.image,
            tag: endpoint.tag,
            platform,
            workers: workers.max(1),
            temp_dir,
        })
    }

    /// Resolve the tag to a single-platform image manifest. Indexes are
    /// walked for the first entry matching the configured platform exactly.
    async fn resolve_manifest(&self) -> Result<RegistryManifest> {
        info!("fetching manifest for {}:{}", self.image, self.tag);
        let response = self
            .http
            .execute(
                Method::GET,
                self.http.manifest_url(self.tag.as_str())?,
                Some(MANIFEST_ACCEPT),
                None,
                BodySource::None,
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return error::ImageNotFoundSnafu {
                image: self.image.clone(),
                tag: self.tag.clone(),
            }
            .fail();
        }
        if !response.status().is_success() {
            return error::FetchManifestSnafu {
                reference: self.tag.clone(),
                status: response.status().as_u16(),
            }
            .fail();
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await.context(error::RequestSnafu)?;

        match content_type.as_str() {
            "application/vnd.docker.distribution.manifest.v2+json"
            | "application/vnd.oci.image.manifest.v1+json" => {
                serde_json::from_slice(body.as_ref()).context(error::ManifestDeserializeSnafu)
            }
            "application/vnd.docker.distribution.manifest.list.v2+json"
            | "application/vnd.oci.image.index.v1+json" => {
                let index: ManifestIndex =
                    serde_json::from_slice(body.as_ref()).context(error::ManifestDeserializeSnafu)?;
                self.resolve_from_index(index).await
            }
            other => error::UnknownManifestTypeSnafu {
                content_type: other.to_string(),
            }
            .fail(),
        }
    }

    async fn resolve_from_index(&self, index: ManifestIndex) -> Result<RegistryManifest> {
        for entry in &index.manifests {
            if let Some(platform) = entry.platform.as_ref() {
                info!("index has manifest for {platform}");
            }
        }
        let matched = index
            .manifests
            .iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .map(|platform| self.platform.matches(platform))
                    .unwrap_or(false)
            })
            .ok_or_else(|| error::Error::NoMatchingPlatform {
                platform: self.platform.clone(),
            })?;

        info!("fetching matching manifest {}", matched.digest);
        let response = self
            .http
            .execute(
                Method::GET,
                self.http.manifest_url(matched.digest.as_str())?,
                Some(MANIFEST_ACCEPT),
                None,
                BodySource::None,
            )
            .await?;
        if !response.status().is_success() {
            return error::FetchManifestSnafu {
                reference: matched.digest.clone(),
                status: response.status().as_u16(),
            }
            .fail();
        }
        response
            .json::<RegistryManifest>()
            .await
            .context(error::RequestSnafu)
    }

    /// Fetch and verify the configuration blob.
    async fn fetch_config(&self, descriptor: &Descriptor) -> Result<bytes::Bytes> {
        info!("fetching config {}", descriptor.digest);
        let response = self
            .http
            .execute(
                Method::GET,
                self.http.blob_url(descriptor.digest.as_str())?,
                None,
                None,
                BodySource::None,
            )
            .await?;
        if !response.status().is_success() {
            return error::FetchBlobSnafu {
                digest: descriptor.digest.clone(),
                status: response.status().as_u16(),
            }
            .fail();
        }
        let body = response.bytes().await.context(error::RequestSnafu)?;
        let actual = crate::element::sha256_hex(body.as_ref());
        if actual != descriptor.hex() {
            return error::DigestMismatchSnafu {
                resource: format!("config {}", descriptor.digest),
                expected: descriptor.hex().to_string(),
                actual,
            }
            .fail();
        }
        Ok(body)
    }
}

/// One download attempt: stream the blob, hash the compressed bytes, write
/// the decompressed tar to a spooled blob, and verify the wire digest.
async fn download_attempt(
    http: &RegistryHttp,
    descriptor: &Descriptor,
    temp_dir: Option<&std::path::Path>,
) -> Result<Blob> {
    let response = http
        .execute(
            Method::GET,
            http.blob_url(descriptor.digest.as_str())?,
            None,
            None,
            BodySource::None,
        )
        .await?;
    if !response.status().is_success() {
        return error::FetchBlobSnafu {
            digest: descriptor.digest.clone(),
            status: response.status().as_u16(),
        }
        .fail();
    }

    let hasher = Arc::new(Mutex::new(Sha256::new()));
    let compressed = HashingReader {
        inner: StreamReader::new(futures::TryStreamExt::map_err(
            response.bytes_stream(),
            std::io::Error::other,
        )),
        hasher: hasher.clone(),
    };
    let mut decompressed = Decompress::new(descriptor.media_type.compression(), compressed);

    let tmp = match temp_dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir),
        None => tempfile::NamedTempFile::new(),
    }
    .context(error::TempFileSnafu)?;
    let path = tmp.into_temp_path();
    trace!("temporary file for layer is {}", path.display());
    let mut file = tokio::fs::File::create(&path)
        .await
        .context(error::TempFileSnafu)?;

    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut size = 0u64;
    loop {
        let n = decompressed
            .read(&mut buffer)
            .await
            .map_err(|source| error::Error::LayerStream {
                digest: descriptor.digest.clone(),
                source,
            })?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])
            .await
            .context(error::TempFileSnafu)?;
        size += n as u64;
    }
    file.flush().await.context(error::TempFileSnafu)?;
    drop(file);

    let actual = base16::encode_lower(hasher.lock().unwrap().clone().finalize().as_slice());
    if actual != descriptor.hex() {
        return error::DigestMismatchSnafu {
            resource: format!("layer {}", descriptor.digest),
            expected: descriptor.hex().to_string(),
            actual,
        }
        .fail();
    }
    Ok(Blob::from_spooled(path, size))
}

/// Download with retries. Only transient transport failures retry; the
/// spooled temporary from a failed attempt is dropped before the next one.
async fn download_layer(
    http: Arc<RegistryHttp>,
    descriptor: Descriptor,
    temp_dir: Option<PathBuf>,
) -> Result<Blob> {
    info!(
        "fetching layer {} ({} bytes, {})",
        descriptor.digest,
        descriptor.size,
        descriptor.media_type.compression()
    );
    let mut attempt = 0u32;
    loop {
        match download_attempt(&http, &descriptor, temp_dir.as_deref()).await {
            Ok(blob) => return Ok(blob),
            Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                let wait = RETRY_BACKOFF_BASE.pow(attempt);
                warn!(
                    "layer download failed (attempt {}/{}): {err}; retrying in {wait}s",
                    attempt + 1,
                    MAX_RETRIES + 1,
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                attempt += 1;
            }
            Err(err) => {
                error!(
                    "layer download failed after {} attempts: {err}",
                    attempt + 1
                );
                return Err(err);
            }
        }
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn image(&self) -> &str {
        &self.image
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn stream_to(&mut self, sink: &mut dyn ElementSink) -> Result<()> {
        let manifest = self.resolve_manifest().await?;

        let config = self.fetch_config(&manifest.config).await?;
        sink.process(Element::config(
            format!("{}.json", manifest.config.hex()),
            config,
        ))
        .await?;

        info!("there are {} image layers", manifest.layers.len());

        // Submit every approved layer up front; the semaphore holds actual
        // concurrency at the worker count.
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut pending: Vec<(String, Option<JoinHandle<Result<Blob>>>)> = Vec::new();
        for descriptor in &manifest.layers {
            let hex = descriptor.hex().to_string();
            if !sink.should_fetch(hex.as_str()) {
                info!("sink declined layer {}", descriptor.digest);
                pending.push((hex, None));
                continue;
            }
            let http = self.http.clone();
            let descriptor = descriptor.clone();
            let temp_dir = self.temp_dir.clone();
            let semaphore = semaphore.clone();
            pending.push((
                hex,
                Some(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    download_layer(http, descriptor, temp_dir).await
                })),
            ));
        }

        // Consume completions in submission order so layer-emit order equals
        // manifest order regardless of which worker finishes first.
        let mut pending = pending.into_iter();
        while let Some((hex, handle)) = pending.next() {
            let result = match handle {
                None => sink.process(Element::layer(hex, None)).await,
                Some(handle) => match handle.await {
                    Ok(Ok(blob)) => sink.process(Element::layer(hex, Some(blob))).await,
                    Ok(Err(err)) => Err(err),
                    Err(source) => Err(error::Error::LayerWait { source }),
                },
            };
            if let Err(err) = result {
                for (_, remaining) in pending {
                    if let Some(remaining) = remaining {
                        remaining.abort();
                    }
                }
                return Err(err);
            }
        }

        info!("done");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_index_platform_selection_is_first_match() {
        let raw = r#"{
            "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:first",
                 "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:second",
                 "platform": {"os": "linux", "architecture": "amd64"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json",
                 "digest": "sha256:third",
                 "platform": {"os": "linux", "architecture": "amd64"}}
            ]
        }"#;
        let index: ManifestIndex = serde_json::from_str(raw).unwrap();
        let target = Platform::new("linux", "amd64", "");
        let matched = index
            .manifests
            .iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .map(|platform| target.matches(platform))
                    .unwrap_or(false)
            })
            .unwrap();
        assert_eq!(matched.digest, "sha256:second");
    }

    #[tokio::test]
    async fn test_hashing_reader_sees_all_bytes() {
        let payload = b"some compressed bytes".to_vec();
        let hasher = Arc::new(Mutex::new(Sha256::new()));
        let mut reader = HashingReader {
            inner: std::io::Cursor::new(payload.clone()),
            hasher: hasher.clone(),
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
        let digest = base16::encode_lower(hasher.lock().unwrap().clone().finalize().as_slice());
        assert_eq!(digest, crate::element::sha256_hex(payload.as_slice()));
    }

    #[test]
    fn test_backoff_schedule() {
        let waits: Vec<u64> = (0..MAX_RETRIES).map(|a| RETRY_BACKOFF_BASE.pow(a)).collect();
        assert_eq!(waits, vec![1, 2, 4]);
    }

    use crate::compression::compress_bytes;
    use crate::element::sha256_hex;
    use crate::models::Compression;
    use crate::testutil::{CollectSink, FakeRegistry};

    async fn seed_image(server: &FakeRegistry, layer_count: usize) -> (String, Vec<String>, Vec<Vec<u8>>) {
        let config = b"{\"os\":\"linux\"}".to_vec();
        let config_hex = sha256_hex(config.as_slice());
        server.seed_blob(format!("sha256:{config_hex}").as_str(), config.as_slice());

        let mut descriptors = Vec::new();
        let mut wire_hexes = Vec::new();
        let mut contents = Vec::new();
        for i in 0..layer_count {
            let content = format!("layer {i} body ").repeat(20 + i * 200).into_bytes();
            let compressed = compress_bytes(Compression::Gzip, content.as_slice())
                .await
                .unwrap();
            let hex = sha256_hex(compressed.as_slice());
            server.seed_blob(format!("sha256:{hex}").as_str(), compressed.as_slice());
            descriptors.push(serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": compressed.len(),
                "digest": format!("sha256:{hex}"),
            }));
            wire_hexes.push(hex);
            contents.push(content);
        }
        server.seed_manifest(
            "latest",
            serde_json::json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "config": {
                    "mediaType": "application/vnd.docker.container.image.v1+json",
                    "size": config.len(),
                    "digest": format!("sha256:{config_hex}"),
                },
                "layers": descriptors,
            }),
        );
        (config_hex, wire_hexes, contents)
    }

    async fn pull(server: &FakeRegistry, workers: usize) -> CollectSink {
        let endpoint = RegistryEndpoint {
            host: server.host(),
            image: "test/image".to_string(),
            tag: "latest".to_string(),
            secure: false,
            username: None,
            password: None,
        };
        let mut source = RegistrySource::connect(endpoint, Platform::default(), workers, None)
            .await
            .unwrap();
        let mut sink = CollectSink::default();
        source.stream_to(&mut sink).await.unwrap();
        sink
    }

    #[tokio::test]
    async fn test_parallel_fetch_emits_in_manifest_order() {
        let server = FakeRegistry::start().await;
        let (config_hex, wire_hexes, contents) = seed_image(&server, 4).await;

        let sink = pull(&server, 4).await;

        // Config first, verified, then layers in manifest order with their
        // decompressed content, whatever order the workers finished in.
        let (config_name, _) = sink.config().unwrap();
        assert_eq!(config_name, format!("{config_hex}.json"));
        assert!(matches!(sink.elements[0], Element::Config { .. }));
        assert_eq!(sink.layer_digests(), wire_hexes);
        for (hex, content) in wire_hexes.iter().zip(contents.iter()) {
            let blob = sink.layer_blob(hex.as_str()).unwrap();
            assert_eq!(blob.to_bytes().await.unwrap(), *content);
        }
    }

    #[tokio::test]
    async fn test_single_worker_pull_matches_parallel() {
        let server = FakeRegistry::start().await;
        let (_, wire_hexes, _) = seed_image(&server, 3).await;

        let sequential = pull(&server, 1).await;
        let concurrent = pull(&server, 4).await;
        assert_eq!(sequential.layer_digests(), wire_hexes);
        assert_eq!(sequential.layer_digests(), concurrent.layer_digests());
    }

    #[tokio::test]
    async fn test_declined_layers_skip_the_network() {
        let server = FakeRegistry::start().await;
        let (_, wire_hexes, _) = seed_image(&server, 2).await;

        let endpoint = RegistryEndpoint {
            host: server.host(),
            image: "test/image".to_string(),
            tag: "latest".to_string(),
            secure: false,
            username: None,
            password: None,
        };
        let mut source = RegistrySource::connect(endpoint, Platform::default(), 4, None)
            .await
            .unwrap();
        let mut sink = CollectSink::declining([wire_hexes[0].clone()]);
        source.stream_to(&mut sink).await.unwrap();

        assert_eq!(sink.layer_digests(), wire_hexes);
        assert!(sink.layer_blob(wire_hexes[0].as_str()).is_none());
        assert!(sink.layer_blob(wire_hexes[1].as_str()).is_some());
    }
}
