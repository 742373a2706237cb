//! Reads images out of a local Docker or Podman daemon over its Unix socket.
//!
//! The daemon API only offers whole-image export (`docker save` over the
//! wire); there is no endpoint for individual blobs. The export is streamed
//! straight through [`SaveTarStreamer`] with a manifest pre-computed from
//! the daemon's inspect data, so OCI-layout exports need no buffering and
//! legacy ones buffer only out-of-order members.

use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use futures::TryStreamExt;
use snafu::ResultExt;
use tokio_util::io::StreamReader;

use crate::element::ElementSink;
use crate::source::savetar::{InspectHint, SaveTarStreamer};
use crate::source::ImageSource;
use crate::{error, Result};

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Docker's client negotiation timeout, in seconds.
const DAEMON_TIMEOUT: u64 = 120;

fn strip_sha256(value: &str) -> String {
    value
        .strip_prefix("sha256:")
        .unwrap_or(value)
        .to_string()
}

/// An image in a local container daemon, readable as an element stream.
/// Podman's Docker-compatible socket works interchangeably.
pub struct DaemonSource {
    docker: Docker,
    image: String,
    tag: String,
    temp_dir: Option<PathBuf>,
}

impl DaemonSource {
    pub fn connect(
        image: &str,
        tag: &str,
        socket_path: Option<&str>,
        temp_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let socket = socket_path.unwrap_or(DEFAULT_SOCKET_PATH);
        let docker = Docker::connect_with_unix(socket, DAEMON_TIMEOUT, bollard::API_DEFAULT_VERSION)
            .context(error::DaemonSnafu)?;
        Ok(Self {
            docker,
            image: image.to_string(),
            tag: tag.to_string(),
            temp_dir,
        })
    }

    fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Inspect the image and extract what the streamer can pre-compute: the
    /// image id (config digest) and the layer DiffIDs.
    async fn inspect(&self) -> Result<InspectHint> {
        let reference = self.reference();
        let inspect = match self.docker.inspect_image(reference.as_str()).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return error::DaemonImageNotFoundSnafu { reference }.fail();
            }
            Err(source) => return Err(error::Error::Daemon { source }),
        };

        let image_id = strip_sha256(inspect.id.as_deref().unwrap_or_default());
        let diff_ids = inspect
            .root_fs
            .and_then(|rootfs| rootfs.layers)
            .unwrap_or_default()
            .iter()
            .map(|layer| strip_sha256(layer))
            .collect();
        Ok(InspectHint {
            image_id,
            diff_ids,
            repo_tag: reference,
        })
    }
}

#[async_trait]
impl ImageSource for DaemonSource {
    fn image(&self) -> &str {
        &self.image
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    async fn stream_to(&mut self, sink: &mut dyn ElementSink) -> Result<()> {
        let hint = self.inspect().await?;
        info!(
            "streaming {} from the daemon ({} layers per inspect)",
            self.reference(),
            hint.diff_ids.len()
        );

        let reference = self.reference();
        let export = self
            .docker
            .export_image(reference.as_str())
            .map_err(std::io::Error::other);
        let reader = StreamReader::new(export);
        SaveTarStreamer::with_hint(hint, self.temp_dir.clone())
            .stream(reader, sink)
            .await
    }
}
