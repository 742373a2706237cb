use std::path::PathBuf;

use clap::Parser;
use ocistream::pipeline;
use ocistream::sink::TarballSink;
use ocistream::source::{ImageSource, RegistrySource};
use ocistream::Result;

use super::{FilterArgs, Globals};

#[derive(Parser, Debug)]
#[command(about = "Pull an image from a registry into a save-tarball")]
pub struct Pull {
    registry: String,
    image: String,
    tag: String,
    output: PathBuf,
    #[command(flatten)]
    filters: FilterArgs,
}

impl Pull {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = RegistrySource::connect(
            globals.endpoint(self.registry.as_str(), self.image.as_str(), self.tag.as_str()),
            globals.platform(),
            globals.workers,
            globals.temp_dir.clone(),
        )
        .await?;
        let sink = TarballSink::create(&self.output, source.image(), source.tag()).await?;
        let mut sink =
            self.filters
                .wrap(Box::new(sink), globals, source.image(), source.tag())?;
        pipeline::run(&mut source, sink.as_mut()).await
    }
}
