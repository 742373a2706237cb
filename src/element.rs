use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncWriteExt, ReadBuf};

use crate::{error, Result};

/// Copy granularity for spooling blobs through temporary files. Large enough
/// that layer copies are not syscall bound, small enough that whole layers
/// never sit in memory.
pub(crate) const COPY_CHUNK: usize = 1024 * 1024;

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    base16::encode_lower(Sha256::digest(data).as_slice())
}

/// One element of the image stream: the configuration document, or a layer.
///
/// Layer digests are bare sha256 hex strings. A layer with no blob means the
/// sink declined the fetch via [`ElementSink::should_fetch`] and already
/// holds the content.
#[derive(Debug, Clone)]
pub enum Element {
    Config { name: String, data: Bytes },
    Layer { digest: String, blob: Option<Blob> },
}

impl Element {
    pub fn config(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Config {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn layer(digest: impl Into<String>, blob: Option<Blob>) -> Self {
        Self::Layer {
            digest: digest.into(),
            blob,
        }
    }
}

/// A byte blob travelling through the pipeline, backed by memory or by a
/// spooled temporary file. Handles are cheap to clone; every call to
/// [`Blob::reader`] opens a fresh reader positioned at the start, so
/// consumers never observe another stage's read position. Temporary storage
/// is released when the last handle drops, on success and failure paths
/// alike.
#[derive(Debug, Clone)]
pub struct Blob {
    storage: Storage,
    size: u64,
}

#[derive(Debug, Clone)]
enum Storage {
    Memory(Bytes),
    Spooled(Arc<TempPath>),
    External(Arc<std::path::PathBuf>),
}

impl Blob {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            storage: Storage::Memory(data),
        }
    }

    /// Drain `reader` into a temporary file, hashing as it goes. Returns the
    /// blob and the sha256 hex of its content.
    pub async fn spool<R>(mut reader: R, temp_dir: Option<&Path>) -> Result<(Self, String)>
    where
        R: AsyncRead + Unpin,
    {
        let tmp = match temp_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir),
            None => tempfile::NamedTempFile::new(),
        }
        .context(error::TempFileSnafu)?;
        let path = tmp.into_temp_path();
        trace!("spooling blob to {}", path.display());

        let mut file = tokio::fs::File::create(&path)
            .await
            .context(error::TempFileSnafu)?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buffer = vec![0u8; COPY_CHUNK];
        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .context(error::TempFileSnafu)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            file.write_all(&buffer[..n])
                .await
                .context(error::TempFileSnafu)?;
            size += n as u64;
        }
        file.flush().await.context(error::TempFileSnafu)?;
        drop(file);

        Ok((
            Self {
                storage: Storage::Spooled(Arc::new(path)),
                size,
            },
            base16::encode_lower(hasher.finalize().as_slice()),
        ))
    }

    /// Wrap an already-spooled temporary file.
    pub(crate) fn from_spooled(path: TempPath, size: u64) -> Self {
        Self {
            storage: Storage::Spooled(Arc::new(path)),
            size,
        }
    }

    /// Reference a stable file on disk without taking ownership of it.
    pub async fn from_path(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let size = tokio::fs::metadata(&path)
            .await
            .context(error::FileSnafu)?
            .len();
        Ok(Self {
            storage: Storage::External(Arc::new(path)),
            size,
        })
    }

    /// Size of the blob content in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The file backing this blob, when there is one. Request replay needs a
    /// path it can reopen.
    pub(crate) fn backing_path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Memory(_) => None,
            Storage::Spooled(path) => Some(path.as_ref()),
            Storage::External(path) => Some(path.as_path()),
        }
    }

    /// Open a fresh reader over the blob, positioned at byte zero.
    pub async fn reader(&self) -> Result<BlobReader> {
        match &self.storage {
            Storage::Memory(data) => Ok(BlobReader::Memory(std::io::Cursor::new(data.clone()))),
            Storage::Spooled(path) => Ok(BlobReader::File(
                tokio::fs::File::open(path.as_ref())
                    .await
                    .context(error::TempFileSnafu)?,
            )),
            Storage::External(path) => Ok(BlobReader::File(
                tokio::fs::File::open(path.as_ref())
                    .await
                    .context(error::FileSnafu)?,
            )),
        }
    }

    /// Read the whole blob into memory. Reserved for small blobs like
    /// configuration documents.
    pub async fn to_bytes(&self) -> Result<Bytes> {
        match &self.storage {
            Storage::Memory(data) => Ok(data.clone()),
            _ => {
                let mut reader = self.reader().await?;
                let mut out = Vec::with_capacity(self.size as usize);
                reader
                    .read_to_end(&mut out)
                    .await
                    .context(error::TempFileSnafu)?;
                Ok(Bytes::from(out))
            }
        }
    }

    /// Recompute the sha256 hex of the blob content.
    pub async fn digest(&self) -> Result<String> {
        let mut reader = self.reader().await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_CHUNK];
        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .context(error::TempFileSnafu)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(base16::encode_lower(hasher.finalize().as_slice()))
    }
}

/// Reader over a [`Blob`], seekable for format probing.
pub enum BlobReader {
    Memory(std::io::Cursor<Bytes>),
    File(tokio::fs::File),
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            Self::File(file) => Pin::new(file).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for BlobReader {
    fn start_seek(self: Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        match self.get_mut() {
            Self::Memory(cursor) => Pin::new(cursor).start_seek(position),
            Self::File(file) => Pin::new(file).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        match self.get_mut() {
            Self::Memory(cursor) => Pin::new(cursor).poll_complete(cx),
            Self::File(file) => Pin::new(file).poll_complete(cx),
        }
    }
}

/// The sink half of the element stream. Terminal outputs and filters both
/// implement this; filters wrap another sink and forward.
#[async_trait]
pub trait ElementSink: Send + Sync {
    /// Consulted by sources before fetching each layer. Returning false asks
    /// the source to yield the layer without a blob.
    fn should_fetch(&self, _digest: &str) -> bool {
        true
    }

    /// Handle one element of the stream.
    async fn process(&mut self, element: Element) -> Result<()>;

    /// Complete the output. Sinks author their manifests here, after stream
    /// order has been fully observed.
    async fn finalize(&mut self) -> Result<()>;

    /// Transactional cleanup hook, invoked by the driver instead of
    /// [`ElementSink::finalize`] when the stream failed. No side effects may
    /// escape; in particular no manifest may be published.
    async fn abort(&mut self) {}
}
