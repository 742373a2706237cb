//! Filters decorate a sink: each one implements [`ElementSink`], holds the
//! sink it wraps, and either rewrites elements before forwarding or tees
//! metadata off the stream. Layer-rewriting filters recompute the content
//! digest and forward the element under its new name; sinks author their
//! manifests from whatever digests arrive.

pub mod exclude;
pub mod inspect;
pub mod search;
pub mod timestamps;

pub use exclude::ExcludeFilter;
pub use inspect::InspectFilter;
pub use search::SearchFilter;
pub use timestamps::TimestampNormalizer;

use std::path::Path;

use futures::StreamExt;
use snafu::ResultExt;
use tokio_tar::{Archive, Builder as ArchiveBuilder};

use crate::element::Blob;
use crate::tarformat::{self, MemberMeta};
use crate::{error, Result};

/// Rewrite a layer tar into a fresh temporary blob, dropping members `skip`
/// selects and overriding member mtimes when `mtime` is set. Member data is
/// copied byte for byte. Returns the new blob, its sha256 hex, and how many
/// members were dropped. The half-written temporary is released if the
/// rewrite fails.
pub(crate) async fn rewrite_layer<S>(
    blob: &Blob,
    temp_dir: Option<&Path>,
    skip: S,
    mtime: Option<u64>,
) -> Result<(Blob, String, usize)>
where
    S: Fn(&str) -> bool,
{
    let format = tarformat::select_format(blob, &skip, |meta| meta).await?;

    let tmp = match temp_dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir),
        None => tempfile::NamedTempFile::new(),
    }
    .context(error::TempFileSnafu)?;
    let path = tmp.into_temp_path();
    let file = tokio::fs::File::create(&path)
        .await
        .context(error::TempFileSnafu)?;
    let mut builder = ArchiveBuilder::new(file);

    let mut skipped = 0usize;
    let reader = blob.reader().await?;
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().context(error::ArchiveSnafu)?;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.context(error::ArchiveSnafu)?;
        let member_path = entry
            .path()
            .context(error::ArchiveSnafu)?
            .to_string_lossy()
            .to_string();
        if skip(member_path.as_str()) {
            skipped += 1;
            continue;
        }
        let header = entry.header().clone();
        let meta = MemberMeta {
            path: member_path,
            link: header
                .link_name()
                .ok()
                .flatten()
                .map(|l| l.to_string_lossy().to_string()),
            size: header.entry_size().unwrap_or(0),
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
        };
        let member_mtime = mtime.unwrap_or_else(|| header.mtime().unwrap_or(0));
        tarformat::append_member(&mut builder, format, &header, &meta, member_mtime, &mut entry)
            .await?;
    }

    let mut file = builder.into_inner().await.context(error::ArchiveSnafu)?;
    use tokio::io::AsyncWriteExt;
    file.flush().await.context(error::TempFileSnafu)?;
    drop(file);

    let size = tokio::fs::metadata(&path)
        .await
        .context(error::TempFileSnafu)?
        .len();
    let rewritten = Blob::from_spooled(path, size);
    let digest = rewritten.digest().await?;
    Ok((rewritten, digest, skipped))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::sha256_hex;
    use crate::testutil::{build_tar, read_tar, TarEntry};

    #[tokio::test]
    async fn test_rewrite_copies_member_bytes() {
        let original = build_tar(&[
            TarEntry::file_at("etc/hostname", b"box\n", 1234),
            TarEntry::dir("var"),
            TarEntry::symlink("bin/sh", "busybox"),
        ])
        .await;
        let blob = Blob::from_bytes(original);
        let (rewritten, digest, skipped) = rewrite_layer(&blob, None, |_| false, None)
            .await
            .unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(digest, rewritten.digest().await.unwrap());

        let members = read_tar(&rewritten).await;
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].0, "etc/hostname");
        assert_eq!(members[0].1, b"box\n");
        assert_eq!(members[0].2, 1234);
    }

    #[tokio::test]
    async fn test_rewrite_digest_matches_content() {
        let blob = Blob::from_bytes(build_tar(&[TarEntry::file("x", b"hi")]).await);
        let (rewritten, digest, _) = rewrite_layer(&blob, None, |_| false, Some(0))
            .await
            .unwrap();
        let bytes = rewritten.to_bytes().await.unwrap();
        assert_eq!(digest, sha256_hex(bytes.as_ref()));
    }
}
