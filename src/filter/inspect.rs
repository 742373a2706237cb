use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;

use crate::element::{Element, ElementSink};
use crate::models::{History, ImageConfig};
use crate::{error, Result};

/// A read-only tee that records layer digests and sizes as they pass, plus
/// the non-empty-layer history entries from the configuration, and appends
/// one JSON line per image to a caller-supplied path in `finalize`.
///
/// History correlation is positional: after empty-layer entries are dropped,
/// history entry i describes layer i. Images whose history drifts from their
/// layer list get misassigned metadata; nothing re-verifies the mapping.
///
/// Layers are reported topmost first, and only the topmost entry carries the
/// image reference as a tag, matching the `docker history` convention.
pub struct InspectFilter {
    inner: Option<Box<dyn ElementSink>>,
    output_path: PathBuf,
    image: String,
    tag: String,
    history: Vec<History>,
    layers: Vec<(String, u64)>,
}

#[derive(Debug, Serialize)]
struct InspectRecord {
    name: String,
    layers: Vec<InspectLayer>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct InspectLayer {
    id: String,
    size: u64,
    created: i64,
    created_by: String,
    comment: String,
    tags: Option<Vec<String>>,
}

/// Parse an ISO-8601 created stamp to Unix seconds, treating a trailing `Z`
/// as `+00:00`. Anything unparseable becomes 0.
fn created_seconds(created: Option<&str>) -> i64 {
    let Some(created) = created else {
        return 0;
    };
    chrono::DateTime::parse_from_rfc3339(created)
        .map(|stamp| stamp.timestamp())
        .unwrap_or(0)
}

fn normalize_digest(digest: &str) -> String {
    if digest.starts_with("sha256:") {
        digest.to_string()
    } else {
        format!("sha256:{digest}")
    }
}

impl InspectFilter {
    pub fn new(
        inner: Option<Box<dyn ElementSink>>,
        output_path: impl Into<PathBuf>,
        image: &str,
        tag: &str,
    ) -> Self {
        Self {
            inner,
            output_path: output_path.into(),
            image: image.to_string(),
            tag: tag.to_string(),
            history: Vec::new(),
            layers: Vec::new(),
        }
    }

    fn record(&self) -> InspectRecord {
        let image_tag = format!("{}:{}", self.image, self.tag);
        let mut layers: Vec<InspectLayer> = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, (digest, size))| {
                let history = self.history.get(i);
                InspectLayer {
                    id: normalize_digest(digest),
                    size: *size,
                    created: created_seconds(
                        history.and_then(|h| h.created.as_deref()),
                    ),
                    created_by: history
                        .and_then(|h| h.created_by.clone())
                        .unwrap_or_default(),
                    comment: history
                        .and_then(|h| h.comment.clone())
                        .unwrap_or_default(),
                    tags: None,
                }
            })
            .collect();
        layers.reverse();
        if let Some(topmost) = layers.first_mut() {
            topmost.tags = Some(vec![image_tag.clone()]);
        }
        InspectRecord {
            name: image_tag,
            layers,
        }
    }

    async fn append_record(&self) -> Result<()> {
        let record = self.record();
        let mut line = serde_json::to_vec(&record).context(error::SerializeSnafu)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_path)
            .await
            .context(error::FileSnafu)?;
        file.write_all(line.as_slice())
            .await
            .context(error::FileSnafu)?;
        file.flush().await.context(error::FileSnafu)?;
        info!(
            "wrote inspect data for {} ({} layers) to {}",
            record.name,
            record.layers.len(),
            self.output_path.display()
        );
        Ok(())
    }
}

#[async_trait]
impl ElementSink for InspectFilter {
    fn should_fetch(&self, digest: &str) -> bool {
        match self.inner.as_ref() {
            Some(inner) => inner.should_fetch(digest),
            None => true,
        }
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        match &element {
            Element::Config { data, .. } => {
                match serde_json::from_slice::<ImageConfig>(data.as_ref()) {
                    Ok(config) => {
                        self.history = config
                            .history
                            .into_iter()
                            .filter(|entry| !entry.empty_layer)
                            .collect();
                    }
                    Err(err) => warn!("failed to parse image config: {err}"),
                }
            }
            Element::Layer { digest, blob } => {
                let size = blob.as_ref().map(|b| b.size()).unwrap_or(0);
                self.layers.push((digest.clone(), size));
            }
        }
        match self.inner.as_mut() {
            Some(inner) => inner.process(element).await,
            None => Ok(()),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        self.append_record().await?;
        match self.inner.as_mut() {
            Some(inner) => inner.finalize().await,
            None => Ok(()),
        }
    }

    async fn abort(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.abort().await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::Blob;
    use crate::testutil::SharedSink;

    const CONFIG: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "history": [
            {"created": "2023-01-01T00:00:00Z", "created_by": "ADD rootfs.tar /"},
            {"created": "2023-01-02T00:00:00Z", "created_by": "CMD [\"sh\"]", "empty_layer": true},
            {"created": "2023-01-03T10:30:00Z", "created_by": "RUN apk add curl"}
        ]
    }"#;

    async fn run_inspect(path: &std::path::Path) {
        let mut filter = InspectFilter::new(None, path, "library/busybox", "latest");
        filter
            .process(Element::config("abc.json", CONFIG.as_bytes().to_vec()))
            .await
            .unwrap();
        filter
            .process(Element::layer("aaa", Some(Blob::from_bytes(vec![0u8; 100]))))
            .await
            .unwrap();
        filter
            .process(Element::layer("bbb", Some(Blob::from_bytes(vec![0u8; 200]))))
            .await
            .unwrap();
        filter.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_output_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspect.jsonl");
        run_inspect(&path).await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.ends_with('\n'));
        let record: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(record["name"], "library/busybox:latest");

        let layers = record["layers"].as_array().unwrap();
        assert_eq!(layers.len(), 2);
        // Topmost first, only the topmost tagged.
        assert_eq!(layers[0]["Id"], "sha256:bbb");
        assert_eq!(layers[0]["Size"], 200);
        assert_eq!(layers[0]["CreatedBy"], "RUN apk add curl");
        assert_eq!(layers[0]["Tags"][0], "library/busybox:latest");
        assert_eq!(layers[1]["Id"], "sha256:aaa");
        assert_eq!(layers[1]["Tags"], serde_json::Value::Null);
        // 2023-01-01T00:00:00Z
        assert_eq!(layers[1]["Created"], 1672531200);
    }

    #[tokio::test]
    async fn test_appends_one_line_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspect.jsonl");
        run_inspect(&path).await;
        run_inspect(&path).await;
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_empty_input_finalizes_normally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspect.jsonl");
        let mut filter = InspectFilter::new(None, &path, "img", "tag");
        filter.finalize().await.unwrap();
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let record: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(record["layers"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_forwards_with_fresh_stream() {
        let sink = SharedSink::default();
        let dir = tempfile::tempdir().unwrap();
        let mut filter = InspectFilter::new(
            Some(Box::new(sink.clone())),
            dir.path().join("out.jsonl"),
            "img",
            "tag",
        );
        filter
            .process(Element::layer("aaa", Some(Blob::from_bytes(b"data".to_vec()))))
            .await
            .unwrap();
        filter.finalize().await.unwrap();
        let collected = sink.collected();
        assert!(collected.finalized);
        let blob = collected.layer_blob("aaa").unwrap();
        assert_eq!(blob.to_bytes().await.unwrap().as_ref(), b"data");
    }

    #[test]
    fn test_created_parsing() {
        assert_eq!(created_seconds(Some("2023-01-01T00:00:00Z")), 1672531200);
        assert_eq!(
            created_seconds(Some("2023-01-01T00:00:00+00:00")),
            1672531200
        );
        assert_eq!(created_seconds(Some("not a date")), 0);
        assert_eq!(created_seconds(None), 0);
    }
}
