use std::path::PathBuf;

use async_trait::async_trait;

use super::rewrite_layer;
use crate::element::{Element, ElementSink};
use crate::Result;

/// Rewrites every layer with all member mtimes pinned to one value (default
/// the epoch), for reproducible outputs. Member data is copied byte for
/// byte; the layer is forwarded under its recomputed digest.
///
/// Every pass through this filter produces a new digest, even when the
/// configured timestamp equals every member's existing mtime: re-serializing
/// a tar is not guaranteed byte-stable, so "no change" is treated
/// conservatively as a rewrite.
pub struct TimestampNormalizer {
    inner: Box<dyn ElementSink>,
    timestamp: u64,
    temp_dir: Option<PathBuf>,
}

impl TimestampNormalizer {
    pub fn new(inner: Box<dyn ElementSink>, timestamp: u64, temp_dir: Option<PathBuf>) -> Self {
        Self {
            inner,
            timestamp,
            temp_dir,
        }
    }
}

#[async_trait]
impl ElementSink for TimestampNormalizer {
    fn should_fetch(&self, digest: &str) -> bool {
        self.inner.should_fetch(digest)
    }

    async fn process(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Layer {
                digest,
                blob: Some(blob),
            } => {
                debug!("normalizing timestamps in layer {digest}");
                let (rewritten, new_digest, _) = rewrite_layer(
                    &blob,
                    self.temp_dir.as_deref(),
                    |_| false,
                    Some(self.timestamp),
                )
                .await?;
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
