//! Shared helpers for the crate's unit tests: an element-collecting sink,
//! synthetic tar construction, and an in-process registry stand-in.

pub(crate) use fake_registry::FakeRegistry;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_tar::{Archive, Builder as ArchiveBuilder, EntryType, Header};

use crate::element::{Blob, Element, ElementSink};
use crate::Result;

#[derive(Default)]
pub(crate) struct CollectSink {
    pub elements: Vec<Element>,
    pub finalized: bool,
    pub aborted: bool,
    pub decline: HashSet<String>,
}

impl CollectSink {
    pub fn declining<I: IntoIterator<Item = S>, S: Into<String>>(digests: I) -> Self {
        Self {
            decline: digests.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn layer_digests(&self) -> Vec<String> {
        self.elements
            .iter()
            .filter_map(|e| match e {
                Element::Layer { digest, .. } => Some(digest.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn config(&self) -> Option<(String, Vec<u8>)> {
        self.elements.iter().find_map(|e| match e {
            Element::Config { name, data } => Some((name.clone(), data.to_vec())),
            _ => None,
        })
    }

    pub fn layer_blob(&self, digest: &str) -> Option<Blob> {
        self.elements.iter().find_map(|e| match e {
            Element::Layer { digest: d, blob } if d == digest => blob.clone(),
            _ => None,
        })
    }
}

#[async_trait]
impl ElementSink for CollectSink {
    fn should_fetch(&self, digest: &str) -> bool {
        !self.decline.contains(digest)
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        self.elements.push(element);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.finalized = true;
        Ok(())
    }

    async fn abort(&mut self) {
        self.aborted = true;
    }
}

/// A [`CollectSink`] behind a shared handle, for tests that hand the sink to
/// a filter chain but still want to inspect what arrived.
#[derive(Clone, Default)]
pub(crate) struct SharedSink(pub std::sync::Arc<std::sync::Mutex<CollectSink>>);

impl SharedSink {
    pub fn collected(&self) -> std::sync::MutexGuard<'_, CollectSink> {
        self.0.lock().unwrap()
    }
}

#[async_trait]
impl ElementSink for SharedSink {
    fn should_fetch(&self, digest: &str) -> bool {
        self.0.lock().unwrap().should_fetch(digest)
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        self.0.lock().unwrap().elements.push(element);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.0.lock().unwrap().finalized = true;
        Ok(())
    }

    async fn abort(&mut self) {
        self.0.lock().unwrap().aborted = true;
    }
}

pub(crate) struct TarEntry {
    pub path: String,
    pub data: Vec<u8>,
    pub mtime: u64,
    pub entry_type: EntryType,
    pub link: Option<String>,
}

impl TarEntry {
    pub fn file(path: &str, data: &[u8]) -> Self {
        Self {
            path: path.to_string(),
            data: data.to_vec(),
            mtime: 0,
            entry_type: EntryType::Regular,
            link: None,
        }
    }

    pub fn file_at(path: &str, data: &[u8], mtime: u64) -> Self {
        Self {
            mtime,
            ..Self::file(path, data)
        }
    }

    pub fn dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            data: Vec::new(),
            mtime: 0,
            entry_type: EntryType::Directory,
            link: None,
        }
    }

    pub fn symlink(path: &str, target: &str) -> Self {
        Self {
            path: path.to_string(),
            data: Vec::new(),
            mtime: 0,
            entry_type: EntryType::Symlink,
            link: Some(target.to_string()),
        }
    }
}

/// Build an uncompressed tar in memory.
pub(crate) async fn build_tar(entries: &[TarEntry]) -> Vec<u8> {
    let mut builder = ArchiveBuilder::new(std::io::Cursor::new(Vec::new()));
    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry.entry_type);
        header.set_size(entry.data.len() as u64);
        header.set_mtime(entry.mtime);
        header.set_mode(0o644);
        if let Some(link) = entry.link.as_deref() {
            header.set_link_name(link).unwrap();
            header.set_size(0);
        }
        builder
            .append_data(
                &mut header,
                entry.path.as_str(),
                std::io::Cursor::new(entry.data.clone()),
            )
            .await
            .unwrap();
    }
    builder
        .into_inner()
        .await
        .map(|cursor| cursor.into_inner())
        .unwrap()
}

/// Read every entry of an uncompressed tar blob back as
/// (path, content, mtime) triples.
pub(crate) async fn read_tar(blob: &Blob) -> Vec<(String, Vec<u8>, u64)> {
    let reader = blob.reader().await.unwrap();
    let mut archive = Archive::new(reader);
    let mut out = Vec::new();
    let mut entries = archive.entries().unwrap();
    use futures::StreamExt;
    while let Some(entry) = entries.next().await {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().to_string();
        let mtime = entry.header().mtime().unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).await.unwrap();
        out.push((path, data, mtime));
    }
    out
}

/// A minimal Docker Registry HTTP API v2 stand-in served over a local TCP
/// socket, enough to exercise pull and push flows without a network: blob
/// HEAD/GET/POST/PUT, manifest GET/PUT, and per-method call counters.
pub(crate) mod fake_registry {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, MutexGuard};

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Default)]
    pub struct State {
        pub blobs: HashMap<String, Vec<u8>>,
        pub manifests: HashMap<String, serde_json::Value>,
        pub heads: usize,
        pub uploads_started: usize,
        pub blob_puts: usize,
        pub manifest_puts: usize,
    }

    pub struct FakeRegistry {
        addr: std::net::SocketAddr,
        state: Arc<Mutex<State>>,
    }

    impl FakeRegistry {
        pub async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let state = Arc::new(Mutex::new(State::default()));
            let accept_state = state.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let state = accept_state.clone();
                    tokio::spawn(async move {
                        let _ = serve(socket, state).await;
                    });
                }
            });
            Self { addr, state }
        }

        pub fn host(&self) -> String {
            format!("127.0.0.1:{}", self.addr.port())
        }

        pub fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap()
        }

        pub fn seed_blob(&self, digest: &str, bytes: &[u8]) {
            self.state()
                .blobs
                .insert(digest.to_string(), bytes.to_vec());
        }

        pub fn seed_manifest(&self, reference: &str, manifest: serde_json::Value) {
            self.state()
                .manifests
                .insert(reference.to_string(), manifest);
        }

        pub fn manifest(&self, reference: &str) -> Option<serde_json::Value> {
            self.state().manifests.get(reference).cloned()
        }

        /// (heads, uploads started, blob puts, manifest puts)
        pub fn counts(&self) -> (usize, usize, usize, usize) {
            let state = self.state();
            (
                state.heads,
                state.uploads_started,
                state.blob_puts,
                state.manifest_puts,
            )
        }
    }

    async fn serve(socket: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
        let (read_half, mut writer) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await? == 0 {
                return Ok(());
            }
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or("").to_string();
            let target = parts.next().unwrap_or("").to_string();

            let mut content_length: Option<usize> = None;
            let mut chunked = false;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).await? == 0 {
                    return Ok(());
                }
                let header = header.trim_end().to_ascii_lowercase();
                if header.is_empty() {
                    break;
                }
                if let Some(value) = header.strip_prefix("content-length:") {
                    content_length = value.trim().parse().ok();
                } else if header.starts_with("transfer-encoding:") && header.contains("chunked") {
                    chunked = true;
                }
            }

            let mut body = Vec::new();
            if chunked {
                loop {
                    let mut size_line = String::new();
                    reader.read_line(&mut size_line).await?;
                    let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
                    if size == 0 {
                        let mut terminator = String::new();
                        reader.read_line(&mut terminator).await?;
                        break;
                    }
                    let mut chunk = vec![0u8; size];
                    reader.read_exact(&mut chunk).await?;
                    body.extend_from_slice(chunk.as_slice());
                    let mut crlf = String::new();
                    reader.read_line(&mut crlf).await?;
                }
            } else if let Some(length) = content_length {
                body.resize(length, 0);
                reader.read_exact(&mut body).await?;
            }

            let (status, headers, response_body) =
                route(method.as_str(), target.as_str(), body, &state);
            let mut response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\n",
                response_body.len()
            );
            for (name, value) in headers {
                response.push_str(format!("{name}: {value}\r\n").as_str());
            }
            response.push_str("\r\n");
            writer.write_all(response.as_bytes()).await?;
            if method != "HEAD" {
                writer.write_all(response_body.as_slice()).await?;
            }
            writer.flush().await?;
        }
    }

    fn decode(component: &str) -> String {
        component.replace("%3A", ":").replace("%3a", ":")
    }

    type Response = (&'static str, Vec<(&'static str, String)>, Vec<u8>);

    fn route(method: &str, target: &str, body: Vec<u8>, state: &Arc<Mutex<State>>) -> Response {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let mut state = state.lock().unwrap();

        if method == "POST" && path.ends_with("/blobs/uploads/") {
            state.uploads_started += 1;
            return (
                "202 Accepted",
                vec![("location", format!("{path}session-1"))],
                Vec::new(),
            );
        }
        if method == "PUT" && path.contains("/blobs/uploads/") {
            let digest = query
                .split('&')
                .find_map(|pair| pair.strip_prefix("digest="))
                .map(decode)
                .unwrap_or_default();
            state.blob_puts += 1;
            state.blobs.insert(digest, body);
            return ("201 Created", Vec::new(), Vec::new());
        }
        if let Some((_, digest)) = path.split_once("/blobs/") {
            let digest = decode(digest);
            if method == "HEAD" {
                state.heads += 1;
                return if state.blobs.contains_key(digest.as_str()) {
                    ("200 OK", Vec::new(), Vec::new())
                } else {
                    ("404 Not Found", Vec::new(), Vec::new())
                };
            }
            if method == "GET" {
                return match state.blobs.get(digest.as_str()) {
                    Some(bytes) => (
                        "200 OK",
                        vec![("content-type", "application/octet-stream".to_string())],
                        bytes.clone(),
                    ),
                    None => ("404 Not Found", Vec::new(), Vec::new()),
                };
            }
        }
        if let Some((_, reference)) = path.split_once("/manifests/") {
            let reference = decode(reference);
            if method == "PUT" {
                state.manifest_puts += 1;
                if let Ok(manifest) = serde_json::from_slice(body.as_slice()) {
                    state.manifests.insert(reference, manifest);
                }
                return ("201 Created", Vec::new(), Vec::new());
            }
            if method == "GET" {
                return match state.manifests.get(reference.as_str()) {
                    Some(manifest) => (
                        "200 OK",
                        vec![(
                            "content-type",
                            "application/vnd.docker.distribution.manifest.v2+json".to_string(),
                        )],
                        serde_json::to_vec(manifest).unwrap(),
                    ),
                    None => ("404 Not Found", Vec::new(), Vec::new()),
                };
            }
        }
        ("404 Not Found", Vec::new(), Vec::new())
    }
}
