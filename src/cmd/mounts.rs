use std::path::PathBuf;

use clap::Parser;
use ocistream::pipeline;
use ocistream::sink::MountsSink;
use ocistream::source::{ImageSource, RegistrySource};
use ocistream::Result;

use super::Globals;

#[derive(Parser, Debug)]
#[command(about = "Pull an image from a registry into an overlay-mount layout")]
pub struct Mounts {
    registry: String,
    image: String,
    tag: String,
    path: PathBuf,
}

impl Mounts {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = RegistrySource::connect(
            globals.endpoint(self.registry.as_str(), self.image.as_str(), self.tag.as_str()),
            globals.platform(),
            globals.workers,
            globals.temp_dir.clone(),
        )
        .await?;
        let mut sink = MountsSink::create(&self.path, source.image(), source.tag()).await?;
        pipeline::run(&mut source, &mut sink).await
    }
}
