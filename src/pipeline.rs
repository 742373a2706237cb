use crate::element::ElementSink;
use crate::source::ImageSource;
use crate::Result;

/// Drive a source into a sink. The source pushes each element at the head of
/// the chain as it produces it, consulting the sink's fetch predicate along
/// the way. On success the sink's `finalize` runs and authors whatever
/// output the sink produces; on the first error the stream stops and the
/// sink's `abort` runs instead, so no partially observed stream can publish
/// a manifest.
pub async fn run(source: &mut dyn ImageSource, sink: &mut dyn ElementSink) -> Result<()> {
    info!("copying {}:{}", source.image(), source.tag());
    match source.stream_to(sink).await {
        Ok(()) => sink.finalize().await,
        Err(err) => {
            warn!("stream failed, aborting sink: {err}");
            sink.abort().await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;

    use super::*;
    use crate::element::Element;
    use crate::error;
    use crate::testutil::CollectSink;

    struct ScriptedSource {
        elements: Vec<Element>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ImageSource for ScriptedSource {
        fn image(&self) -> &str {
            "scripted"
        }

        fn tag(&self) -> &str {
            "latest"
        }

        async fn stream_to(&mut self, sink: &mut dyn ElementSink) -> Result<()> {
            for (i, element) in self.elements.drain(..).enumerate() {
                if Some(i) == self.fail_after {
                    return error::ConfigMissingSnafu.fail();
                }
                sink.process(element).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_finalizes_on_success() {
        let mut source = ScriptedSource {
            elements: vec![
                Element::config("abc.json", b"{}".as_slice()),
                Element::layer("d1", None),
                Element::layer("d2", None),
            ],
            fail_after: None,
        };
        let mut sink = CollectSink::default();
        run(&mut source, &mut sink).await.unwrap();
        assert!(sink.finalized);
        assert!(!sink.aborted);
        assert_eq!(sink.layer_digests(), vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn test_run_aborts_on_failure() {
        let mut source = ScriptedSource {
            elements: vec![
                Element::config("abc.json", b"{}".as_slice()),
                Element::layer("d1", None),
            ],
            fail_after: Some(1),
        };
        let mut sink = CollectSink::default();
        let result = run(&mut source, &mut sink).await;
        assert!(result.is_err());
        assert!(sink.aborted);
        assert!(!sink.finalized);
    }
}
