//! Tar format selection for rewritten layers.
//!
//! USTAR headers are a kilobyte smaller per long-named member than PAX, so
//! rewritten layers use USTAR whenever every member fits its limits and fall
//! back to PAX extended headers otherwise. Selection runs over the planned
//! member set, after any skip/transform the rewrite will apply.

use futures::StreamExt;
use snafu::ResultExt;
use tokio::io::AsyncRead;
use tokio_tar::{Archive, Builder as ArchiveBuilder, EntryType, Header};

use crate::element::Blob;
use crate::{error, Result};

// USTAR (POSIX.1-1988) header limits. Paths up to 256 bytes fit if they
// split at a '/' into a prefix of at most 155 and a name of at most 100.
pub const USTAR_MAX_PATH: usize = 256;
pub const USTAR_MAX_NAME: usize = 100;
pub const USTAR_MAX_PREFIX: usize = 155;
pub const USTAR_MAX_LINKNAME: usize = 100;
pub const USTAR_MAX_SIZE: u64 = 8 * 1024 * 1024 * 1024 - 1;
pub const USTAR_MAX_ID: u64 = 0o7777777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarFormat {
    Ustar,
    Pax,
}

/// The member attributes that participate in format selection.
#[derive(Debug, Clone)]
pub struct MemberMeta {
    pub path: String,
    pub link: Option<String>,
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
}

impl MemberMeta {
    fn from_header(header: &Header, path: String) -> Self {
        Self {
            path,
            link: header
                .link_name()
                .ok()
                .flatten()
                .map(|l| l.to_string_lossy().to_string()),
            size: header.entry_size().unwrap_or(0),
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
        }
    }
}

/// Whether a member exceeds what a USTAR header can carry.
pub fn needs_pax(meta: &MemberMeta) -> bool {
    if meta.path.len() > USTAR_MAX_PATH {
        return true;
    }
    if meta.path.len() > USTAR_MAX_NAME {
        // The path must split at the final '/' into prefix + name.
        let (prefix, name) = match meta.path.rsplit_once('/') {
            Some(split) => split,
            None => return true,
        };
        if name.len() > USTAR_MAX_NAME || prefix.len() > USTAR_MAX_PREFIX {
            return true;
        }
    }
    if let Some(link) = meta.link.as_deref() {
        if link.len() > USTAR_MAX_LINKNAME || !link.is_ascii() {
            return true;
        }
    }
    if meta.size > USTAR_MAX_SIZE {
        return true;
    }
    if meta.uid > USTAR_MAX_ID || meta.gid > USTAR_MAX_ID {
        return true;
    }
    if !meta.path.is_ascii() {
        return true;
    }
    false
}

/// Scan a layer and pick the format its rewrite should use. `skip` marks
/// members the rewrite will drop; `transform` is applied to each remaining
/// member before the check, matching what the rewrite will write. The blob
/// is read through its own fresh reader, leaving no shared position behind.
pub async fn select_format<S, T>(blob: &Blob, skip: S, transform: T) -> Result<TarFormat>
where
    S: Fn(&str) -> bool,
    T: Fn(MemberMeta) -> MemberMeta,
{
    let reader = blob.reader().await?;
    let mut archive = Archive::new(reader);
    let mut entries = archive.entries().context(error::ArchiveSnafu)?;
    while let Some(entry) = entries.next().await {
        let entry = entry.context(error::ArchiveSnafu)?;
        let path = entry
            .path()
            .context(error::ArchiveSnafu)?
            .to_string_lossy()
            .to_string();
        if skip(path.as_str()) {
            continue;
        }
        let meta = transform(MemberMeta::from_header(entry.header(), path));
        if needs_pax(&meta) {
            debug!("layer requires PAX format ({})", meta.path);
            return Ok(TarFormat::Pax);
        }
    }
    Ok(TarFormat::Ustar)
}

/// Encode one PAX extended header record: "<len> <key>=<value>\n" where len
/// counts the whole record including itself.
fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let payload = key.len() + value.len() + 3; // ' ', '=', '\n'
    let mut digits = 1;
    while (payload + digits).to_string().len() > digits {
        digits += 1;
    }
    let total = payload + digits;
    let mut record = format!("{total} {key}=").into_bytes();
    record.extend_from_slice(value);
    record.push(b'\n');
    record
}

fn pax_records(meta: &MemberMeta) -> Vec<u8> {
    let mut records = Vec::new();
    if meta.path.len() > USTAR_MAX_NAME || !meta.path.is_ascii() {
        records.extend(pax_record("path", meta.path.as_bytes()));
    }
    if let Some(link) = meta.link.as_deref() {
        if link.len() > USTAR_MAX_LINKNAME || !link.is_ascii() {
            records.extend(pax_record("linkpath", link.as_bytes()));
        }
    }
    if meta.size > USTAR_MAX_SIZE {
        records.extend(pax_record("size", meta.size.to_string().as_bytes()));
    }
    if meta.uid > USTAR_MAX_ID {
        records.extend(pax_record("uid", meta.uid.to_string().as_bytes()));
    }
    if meta.gid > USTAR_MAX_ID {
        records.extend(pax_record("gid", meta.gid.to_string().as_bytes()));
    }
    records
}

/// Copy a raw byte string into a fixed header field, truncating.
fn set_raw_field(field: &mut [u8], value: &[u8]) {
    let n = value.len().min(field.len());
    field[..n].copy_from_slice(&value[..n]);
    for byte in field[n..].iter_mut() {
        *byte = 0;
    }
}

/// Append one member to `builder` in the selected format. `meta` describes
/// the member as it should be written (post transform); `data` supplies the
/// member content for regular files.
pub async fn append_member<W, R>(
    builder: &mut ArchiveBuilder<W>,
    format: TarFormat,
    source: &Header,
    meta: &MemberMeta,
    mtime: u64,
    data: &mut R,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    R: AsyncRead + Unpin,
{
    let mut header = Header::new_ustar();
    header.set_entry_type(source.entry_type());
    header.set_size(if source.entry_type().is_file() {
        meta.size
    } else {
        0
    });
    header.set_mode(source.mode().unwrap_or(0o644));
    header.set_uid(meta.uid.min(USTAR_MAX_ID));
    header.set_gid(meta.gid.min(USTAR_MAX_ID));
    header.set_mtime(mtime);
    if let Some(major) = source.device_major().ok().flatten() {
        let _ = header.set_device_major(major);
    }
    if let Some(minor) = source.device_minor().ok().flatten() {
        let _ = header.set_device_minor(minor);
    }
    if let Ok(Some(username)) = source.username() {
        let _ = header.set_username(username);
    }
    if let Ok(Some(groupname)) = source.groupname() {
        let _ = header.set_groupname(groupname);
    }

    match format {
        TarFormat::Ustar => {
            if let Some(link) = meta.link.as_deref() {
                header
                    .set_link_name(link)
                    .context(error::ArchiveSnafu)?;
            }
            builder
                .append_data(&mut header, meta.path.as_str(), data)
                .await
                .context(error::ArchiveSnafu)?;
        }
        TarFormat::Pax => {
            let records = pax_records(meta);
            if !records.is_empty() {
                let mut extended = Header::new_ustar();
                extended.set_entry_type(EntryType::XHeader);
                extended.set_size(records.len() as u64);
                extended.set_mode(0o644);
                extended.set_mtime(mtime);
                let pax_name = format!("PaxHeaders/{}", meta.path);
                let pax_bytes = pax_name.as_bytes();
                set_raw_field(
                    &mut extended.as_old_mut().name,
                    &pax_bytes[..pax_bytes.len().min(USTAR_MAX_NAME)],
                );
                extended.set_cksum();
                builder
                    .append(&extended, std::io::Cursor::new(records))
                    .await
                    .context(error::ArchiveSnafu)?;
            }

            // The real values live in the extended records; the ustar header
            // carries truncated fields for readers that predate PAX.
            set_raw_field(&mut header.as_old_mut().name, meta.path.as_bytes());
            if let Some(link) = meta.link.as_deref() {
                set_raw_field(&mut header.as_old_mut().linkname, link.as_bytes());
            }
            if meta.size > USTAR_MAX_SIZE {
                header.set_size(0);
            }
            header.set_cksum();
            builder
                .append(&header, data)
                .await
                .context(error::ArchiveSnafu)?;
        }
    }
    Ok(())
}
