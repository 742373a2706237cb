use std::path::PathBuf;

use clap::Parser;
use ocistream::pipeline;
use ocistream::sink::TarballSink;
use ocistream::source::{DaemonSource, ImageSource};
use ocistream::Result;

use super::{FilterArgs, Globals};

#[derive(Parser, Debug)]
#[command(about = "Save an image from the local daemon into a save-tarball")]
pub struct Save {
    image: String,
    tag: String,
    output: PathBuf,
    #[arg(long, help = "Path to the Docker or Podman socket")]
    socket: Option<String>,
    #[command(flatten)]
    filters: FilterArgs,
}

impl Save {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = DaemonSource::connect(
            self.image.as_str(),
            self.tag.as_str(),
            self.socket.as_deref(),
            globals.temp_dir.clone(),
        )?;
        let sink = TarballSink::create(&self.output, source.image(), source.tag()).await?;
        let mut sink =
            self.filters
                .wrap(Box::new(sink), globals, source.image(), source.tag())?;
        pipeline::run(&mut source, sink.as_mut()).await
    }
}
