use std::io::SeekFrom;
use std::pin::Pin;

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use async_compression::Level;
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, BufReader};

use crate::error;
use crate::models::Compression;
use crate::Result;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Offset and value of the ustar magic inside a tar header, used to
/// recognise an uncompressed tar stream.
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8; 5] = b"ustar";

/// How many bytes of a blob [`detect`] wants to look at. Enough to cover the
/// tar magic probe.
pub const DETECT_PROBE_LEN: usize = TAR_MAGIC_OFFSET + TAR_MAGIC.len();

/// Gzip compresses with the raw level 9 default the rest of the ecosystem
/// settled on; zstd uses its own default of 3.
const GZIP_LEVEL: Level = Level::Precise(9);
const ZSTD_LEVEL: Level = Level::Precise(3);

/// Detect the compression of a blob from its leading bytes. Returns None
/// for unrecognised magic so callers can attach the offending resource to
/// the error they raise.
pub fn detect(prefix: &[u8]) -> Option<Compression> {
    if prefix.len() >= GZIP_MAGIC.len() && prefix[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        return Some(Compression::Gzip);
    }
    if prefix.len() >= ZSTD_MAGIC.len() && prefix[..ZSTD_MAGIC.len()] == ZSTD_MAGIC {
        return Some(Compression::Zstd);
    }
    if prefix.len() >= DETECT_PROBE_LEN
        && &prefix[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
    {
        return Some(Compression::None);
    }
    None
}

/// Probe a seekable reader for its compression format, restoring the reader
/// position afterwards. Detection from a non-seekable reader is not offered;
/// buffer a probe and use [`detect`] instead.
pub async fn detect_reader<R>(reader: &mut R) -> Result<Option<Compression>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    let position = reader
        .seek(SeekFrom::Current(0))
        .await
        .context(error::FileSnafu)?;
    let mut probe = vec![0u8; DETECT_PROBE_LEN];
    let mut filled = 0;
    while filled < probe.len() {
        let n = reader
            .read(&mut probe[filled..])
            .await
            .context(error::FileSnafu)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    probe.truncate(filled);
    reader
        .seek(SeekFrom::Start(position))
        .await
        .context(error::FileSnafu)?;
    Ok(detect(probe.as_slice()))
}

/// Streaming decompressor over a chunked byte reader. The gzip path accepts
/// concatenated gzip streams, which some registries emit for large layers.
pub struct Decompress {
    inner: Pin<Box<dyn AsyncRead + Send>>,
}

impl Decompress {
    pub fn new<R>(compression: Compression, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let reader = BufReader::new(Box::pin(reader));
        Self {
            inner: match compression {
                Compression::Gzip => {
                    let mut decoder = GzipDecoder::new(reader);
                    decoder.multiple_members(true);
                    Box::pin(decoder)
                }
                Compression::Zstd => Box::pin(ZstdDecoder::new(reader)),
                Compression::None => Box::pin(reader),
            },
        }
    }
}

impl AsyncRead for Decompress {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_read(cx, buf)
    }
}

/// Streaming compressor over a chunked byte reader.
pub struct Compress {
    inner: Pin<Box<dyn AsyncRead + Send>>,
}

impl Compress {
    pub fn new<R>(compression: Compression, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let reader = BufReader::new(Box::pin(reader));
        Self {
            inner: match compression {
                Compression::Gzip => Box::pin(GzipEncoder::with_quality(reader, GZIP_LEVEL)),
                Compression::Zstd => Box::pin(ZstdEncoder::with_quality(reader, ZSTD_LEVEL)),
                Compression::None => Box::pin(reader),
            },
        }
    }
}

impl AsyncRead for Compress {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.inner.as_mut().poll_read(cx, buf)
    }
}

/// One-shot compression of an in-memory buffer.
pub async fn compress_bytes(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let mut compressor = Compress::new(compression, std::io::Cursor::new(data.to_vec()));
    let mut out = Vec::new();
    compressor
        .read_to_end(&mut out)
        .await
        .context(error::FileSnafu)?;
    Ok(out)
}

/// One-shot decompression of an in-memory buffer.
pub async fn decompress_bytes(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let mut decompressor = Decompress::new(compression, std::io::Cursor::new(data.to_vec()));
    let mut out = Vec::new();
    decompressor
        .read_to_end(&mut out)
        .await
        .context(error::FileSnafu)?;
    Ok(out)
}
