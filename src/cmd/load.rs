use clap::Parser;
use ocistream::pipeline;
use ocistream::sink::DaemonSink;
use ocistream::source::{ImageSource, RegistrySource};
use ocistream::Result;

use super::Globals;

#[derive(Parser, Debug)]
#[command(about = "Pull an image from a registry and load it into the local daemon")]
pub struct Load {
    registry: String,
    image: String,
    tag: String,
    #[arg(long, help = "Path to the Docker or Podman socket")]
    socket: Option<String>,
}

impl Load {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = RegistrySource::connect(
            globals.endpoint(self.registry.as_str(), self.image.as_str(), self.tag.as_str()),
            globals.platform(),
            globals.workers,
            globals.temp_dir.clone(),
        )
        .await?;
        let mut sink = DaemonSink::connect(
            source.image(),
            source.tag(),
            self.socket.as_deref(),
            globals.temp_dir.clone(),
        )
        .await?;
        pipeline::run(&mut source, &mut sink).await
    }
}
