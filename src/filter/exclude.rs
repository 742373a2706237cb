use std::path::PathBuf;

use async_trait::async_trait;
use glob::Pattern;
use snafu::ResultExt;

use super::rewrite_layer;
use crate::element::{Element, ElementSink};
use crate::{error, Result};

/// Drops members matching any of a list of glob patterns from every layer,
/// rewriting the layer tar and forwarding it under its recomputed digest.
///
/// Patterns use fnmatch semantics (`*`, `?`, `[...]`, with `*` free to cross
/// path separators) and match against the full archive-relative path. Useful
/// for stripping content like `.git` directories or `__pycache__` trees on
/// the way through.
pub struct ExcludeFilter {
    inner: Box<dyn ElementSink>,
    patterns: Vec<Pattern>,
    temp_dir: Option<PathBuf>,
}

impl ExcludeFilter {
    pub fn new(
        inner: Box<dyn ElementSink>,
        patterns: &[String],
        temp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                Pattern::new(raw).context(error::ExcludePatternSnafu {
                    pattern: raw.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            inner,
            patterns,
            temp_dir,
        })
    }

    fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(path))
    }
}

#[async_trait]
impl ElementSink for ExcludeFilter {
    fn should_fetch(&self, digest: &str) -> bool {
        self.inner.should_fetch(digest)
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Layer {
                digest,
                blob: Some(blob),
            } => {
                debug!("filtering layer {digest}");
                let (rewritten, new_digest, skipped) =
                    rewrite_layer(&blob, self.temp_dir.as_deref(), |p| self.matches(p), None)
                        .await?;
                if skipped > 0 {
                    info!("excluded {skipped} entries from layer {digest}");
                }
                self.inner
                    .process(Element::layer(new_digest, Some(rewritten)))
                    .await
            }
            other => self.inner.process(other).await,
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        self.inner.finalize().await
    }

    async fn abort(&mut self) {
        self.inner.abort().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::element::{sha256_hex, Blob};
    use crate::testutil::{build_tar, read_tar, SharedSink, TarEntry};

    async fn run_exclude(patterns: &[&str], entries: &[TarEntry]) -> SharedSink {
        let tar = build_tar(entries).await;
        let digest = sha256_hex(tar.as_slice());
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        let sink = SharedSink::default();
        let mut filter = ExcludeFilter::new(Box::new(sink.clone()), &patterns, None).unwrap();
        filter
            .process(Element::layer(digest, Some(Blob::from_bytes(tar))))
            .await
            .unwrap();
        filter.finalize().await.unwrap();
        sink
    }

    #[tokio::test]
    async fn test_pycache_exclusion_changes_digest() {
        let entries = [
            TarEntry::file("app/main.py", b"print('hi')\n"),
            TarEntry::file("app/__pycache__/main.cpython-311.pyc", b"\x00\x01"),
        ];
        let tar = build_tar(&entries).await;
        let original_digest = sha256_hex(tar.as_slice());

        let sink = run_exclude(&["*__pycache__*"], &entries).await;
        let (digests, blob) = {
            let collected = sink.collected();
            let digests = collected.layer_digests();
            let blob = collected.layer_blob(&digests[0]).unwrap();
            (digests, blob)
        };
        assert_eq!(digests.len(), 1);
        assert_ne!(digests[0], original_digest);

        let members = read_tar(&blob).await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].0, "app/main.py");
        assert_eq!(members[0].1, b"print('hi')\n");
    }

    #[tokio::test]
    async fn test_non_matching_members_copied_verbatim() {
        let entries = [
            TarEntry::file_at("keep/one", b"one", 11),
            TarEntry::file_at("drop/two", b"two", 22),
            TarEntry::file_at("keep/three", b"three", 33),
        ];
        let sink = run_exclude(&["drop/*"], &entries).await;
        let blob = {
            let collected = sink.collected();
            let digests = collected.layer_digests();
            collected.layer_blob(&digests[0]).unwrap()
        };
        let members = read_tar(&blob).await;
        assert_eq!(
            members
                .iter()
                .map(|(p, _, _)| p.as_str())
                .collect::<Vec<_>>(),
            vec!["keep/one", "keep/three"]
        );
        assert_eq!(members[0].1, b"one");
        assert_eq!(members[0].2, 11);
        assert_eq!(members[1].1, b"three");
        assert_eq!(members[1].2, 33);
    }

    #[tokio::test]
    async fn test_config_and_elided_layers_pass_through() {
        let sink = SharedSink::default();
        let mut filter =
            ExcludeFilter::new(Box::new(sink.clone()), &["*.pyc".to_string()], None).unwrap();
        filter
            .process(Element::config("abc.json", b"{}".as_slice()))
            .await
            .unwrap();
        filter.process(Element::layer("d1", None)).await.unwrap();
        let collected = sink.collected();
        assert_eq!(collected.elements.len(), 2);
        assert_eq!(collected.layer_digests(), vec!["d1"]);
        let (name, data) = collected.config().unwrap();
        assert_eq!(name, "abc.json");
        assert_eq!(data, b"{}");
    }

    #[test]
    fn test_bad_pattern_is_invalid_input() {
        let result = ExcludeFilter::new(
            Box::new(SharedSink::default()),
            &["[unclosed".to_string()],
            None,
        );
        assert!(result.is_err());
    }
}
