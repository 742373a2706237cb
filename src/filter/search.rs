use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use glob::Pattern;
use regex::Regex;
use snafu::ResultExt;
use tokio_tar::{Archive, EntryType};

use crate::element::{Blob, Element, ElementSink};
use crate::{error, Result};

/// How a search pattern is interpreted.
enum Matcher {
    /// fnmatch-style glob tried against the full path and the basename, so
    /// `*bash` finds `/bin/bash`.
    Glob(Pattern),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Glob(pattern) => {
                let basename = path.rsplit('/').next().unwrap_or(path);
                pattern.matches(path) || pattern.matches(basename)
            }
            Self::Regex(regex) => regex.is_match(path),
        }
    }
}

#[derive(Debug, Clone)]
struct MatchDetail {
    kind: &'static str,
    size: u64,
    link: Option<String>,
}

#[derive(Debug, Clone)]
struct SearchMatch {
    layer: String,
    path: String,
    detail: MatchDetail,
}

fn kind_of(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::Regular | EntryType::Continuous => "file",
        EntryType::Directory => "directory",
        EntryType::Symlink => "symlink",
        EntryType::Link => "hardlink",
        EntryType::Fifo => "fifo",
        EntryType::Char => "character device",
        EntryType::Block => "block device",
        _ => "unknown",
    }
}

/// A tee that records tar members whose path matches a pattern and reports
/// them in `finalize`, either grouped by layer for humans or one
/// `image:tag:layer-digest:path` line for scripts.
///
/// Works standalone (no wrapped sink) or in the middle of a chain; forwarded
/// layers always hand the next stage a fresh byte stream.
pub struct SearchFilter {
    inner: Option<Box<dyn ElementSink>>,
    matcher: Matcher,
    image: String,
    tag: String,
    script_friendly: bool,
    results: Vec<SearchMatch>,
}

impl SearchFilter {
    pub fn new(
        inner: Option<Box<dyn ElementSink>>,
        pattern: &str,
        use_regex: bool,
        image: &str,
        tag: &str,
        script_friendly: bool,
    ) -> Result<Self> {
        let matcher = if use_regex {
            Matcher::Regex(Regex::new(pattern).context(error::SearchRegexSnafu {
                pattern: pattern.to_string(),
            })?)
        } else {
            Matcher::Glob(Pattern::new(pattern).context(error::SearchPatternSnafu {
                pattern: pattern.to_string(),
            })?)
        };
        Ok(Self {
            inner,
            matcher,
            image: image.to_string(),
            tag: tag.to_string(),
            script_friendly,
            results: Vec::new(),
        })
    }

    async fn search_layer(&mut self, digest: &str, blob: &Blob) -> Result<()> {
        debug!("searching layer {digest}");
        let reader = blob.reader().await?;
        let mut archive = Archive::new(reader);
        let mut entries = archive.entries().context(error::ArchiveSnafu)?;
        while let Some(entry) = entries.next().await {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("failed to read layer {digest}: {err}");
                    break;
                }
            };
            let path = entry
                .path()
                .context(error::ArchiveSnafu)?
                .to_string_lossy()
                .to_string();
            if self.matcher.matches(path.as_str()) {
                let header = entry.header();
                self.results.push(SearchMatch {
                    layer: digest.to_string(),
                    path,
                    detail: MatchDetail {
                        kind: kind_of(header.entry_type()),
                        size: header.entry_size().unwrap_or(0),
                        link: header
                            .link_name()
                            .ok()
                            .flatten()
                            .map(|l| l.to_string_lossy().to_string()),
                    },
                });
            }
        }
        Ok(())
    }

    fn print_results(&self) {
        if self.results.is_empty() {
            if !self.script_friendly {
                println!("No matches found.");
            }
            return;
        }

        if self.script_friendly {
            for found in &self.results {
                println!("{}:{}:{}:{}", self.image, self.tag, found.layer, found.path);
            }
            return;
        }

        let mut by_layer: BTreeMap<&str, Vec<&SearchMatch>> = BTreeMap::new();
        for found in &self.results {
            by_layer.entry(found.layer.as_str()).or_default().push(found);
        }

        for (layer, matches) in &by_layer {
            println!("Layer: {layer}");
            for found in matches {
                match (&found.detail.link, found.detail.kind) {
                    (Some(link), kind @ ("symlink" | "hardlink")) => {
                        println!("  {} -> {} ({})", found.path, link, kind);
                    }
                    (_, "file") => {
                        println!("  {} (file, {} bytes)", found.path, found.detail.size);
                    }
                    (_, kind) => {
                        println!("  {} ({})", found.path, kind);
                    }
                }
            }
            println!();
        }

        let matches = self.results.len();
        let layers = by_layer.len();
        println!(
            "Found {} match{} in {} layer{}.",
            matches,
            if matches == 1 { "" } else { "es" },
            layers,
            if layers == 1 { "" } else { "s" },
        );
    }
}

#[async_trait]
impl ElementSink for SearchFilter {
    fn should_fetch(&self, _digest: &str) -> bool {
        // The search itself needs every layer, whatever the wrapped sink
        // already holds.
        true
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        if let Element::Layer {
            digest,
            blob: Some(blob),
        } = &element
        {
            let digest = digest.clone();
            let blob = blob.clone();
            self.search_layer(digest.as_str(), &blob).await?;
        }
        match self.inner.as_mut() {
            Some(inner) => inner.process(element).await,
            None => Ok(()),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        self.print_results();
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
    use crate::testutil::{build_tar, SharedSink, TarEntry};

    async fn search(pattern: &str, use_regex: bool) -> Vec<(String, String)> {
        let tar = build_tar(&[
            TarEntry::file("bin/busybox", b"ELF"),
            TarEntry::symlink("bin/sh", "busybox"),
            TarEntry::file("etc/passwd", b"root:x:0:0"),
            TarEntry::dir("usr/share"),
        ])
        .await;
        let mut filter =
            SearchFilter::new(None, pattern, use_regex, "img", "tag", false).unwrap();
        filter
            .process(Element::layer("lll", Some(Blob::from_bytes(tar))))
            .await
            .unwrap();
        filter
            .results
            .iter()
            .map(|found| (found.layer.clone(), found.path.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_glob_matches_basename() {
        let results = search("*busybox", false).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], ("lll".to_string(), "bin/busybox".to_string()));
    }

    #[tokio::test]
    async fn test_glob_matches_full_path() {
        let results = search("bin/*", false).await;
        assert_eq!(
            results.iter().map(|(_, p)| p.as_str()).collect::<Vec<_>>(),
            vec!["bin/busybox", "bin/sh"]
        );
    }

    #[tokio::test]
    async fn test_regex_mode() {
        let results = search(r"^etc/.*wd$", true).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, "etc/passwd");
    }

    #[tokio::test]
    async fn test_invalid_regex_rejected() {
        assert!(SearchFilter::new(None, "([", true, "img", "tag", false).is_err());
    }

    #[tokio::test]
    async fn test_wrapped_sink_gets_readable_stream() {
        let tar = build_tar(&[TarEntry::file("bin/busybox", b"ELF")]).await;
        let sink = SharedSink::default();
        let mut filter = SearchFilter::new(
            Some(Box::new(sink.clone())),
            "*busybox",
            false,
            "img",
            "tag",
            true,
        )
        .unwrap();
        filter
            .process(Element::layer("lll", Some(Blob::from_bytes(tar.clone()))))
            .await
            .unwrap();
        filter.finalize().await.unwrap();

        let blob = {
            let collected = sink.collected();
            assert!(collected.finalized);
            collected.layer_blob("lll").unwrap()
        };
        // The forwarded blob reads from position zero despite the search
        // having consumed it.
        assert_eq!(blob.to_bytes().await.unwrap().as_ref(), tar.as_slice());
    }

    #[tokio::test]
    async fn test_empty_stream_finalizes() {
        let mut filter = SearchFilter::new(None, "*", false, "img", "tag", true).unwrap();
        filter.finalize().await.unwrap();
    }
}
