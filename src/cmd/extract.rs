use std::path::PathBuf;

use clap::Parser;
use ocistream::pipeline;
use ocistream::sink::DirectorySink;
use ocistream::source::{ImageSource, RegistrySource};
use ocistream::Result;

use super::{FilterArgs, Globals};

#[derive(Parser, Debug)]
#[command(about = "Pull an image from a registry into an exploded directory")]
pub struct Extract {
    registry: String,
    image: String,
    tag: String,
    path: PathBuf,
    #[arg(long, help = "Name manifests per image/tag so the directory can hold many images")]
    unique_names: bool,
    #[arg(long, help = "Also materialize the merged, whiteout-aware image tree")]
    expand: bool,
    #[arg(long, help = "Also extract each layer into its own tree")]
    extract_layers: bool,
    #[command(flatten)]
    filters: FilterArgs,
}

impl Extract {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = RegistrySource::connect(
            globals.endpoint(self.registry.as_str(), self.image.as_str(), self.tag.as_str()),
            globals.platform(),
            globals.workers,
            globals.temp_dir.clone(),
        )
        .await?;
        let sink = DirectorySink::create(
            &self.path,
            source.image(),
            source.tag(),
            self.unique_names,
            self.expand,
            self.extract_layers,
        )
        .await?;
        let mut sink =
            self.filters
                .wrap(Box::new(sink), globals, source.image(), source.tag())?;
        pipeline::run(&mut source, sink.as_mut()).await
    }
}
