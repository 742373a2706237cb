use std::path::PathBuf;

use clap::Parser;
use ocistream::pipeline;
use ocistream::sink::TarballSink;
use ocistream::source::DirectorySource;
use ocistream::Result;

use super::{FilterArgs, Globals};

#[derive(Parser, Debug)]
#[command(about = "Recreate a save-tarball from an exploded directory")]
pub struct Rebuild {
    path: PathBuf,
    image: String,
    tag: String,
    output: PathBuf,
    #[command(flatten)]
    filters: FilterArgs,
}

impl Rebuild {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source =
            DirectorySource::open(&self.path, self.image.as_str(), self.tag.as_str()).await?;
        let sink = TarballSink::create(&self.output, self.image.as_str(), self.tag.as_str()).await?;
        let mut sink = self.filters.wrap(
            Box::new(sink),
            globals,
            self.image.as_str(),
            self.tag.as_str(),
        )?;
        pipeline::run(&mut source, sink.as_mut()).await
    }
}
