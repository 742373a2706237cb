use std::path::PathBuf;

use clap::Parser;
use ocistream::filter::InspectFilter;
use ocistream::pipeline;
use ocistream::source::{ImageSource, RegistrySource};
use ocistream::Result;

use super::Globals;

#[derive(Parser, Debug)]
#[command(about = "Append an image's layer metadata to a JSONL file")]
pub struct Inspect {
    registry: String,
    image: String,
    tag: String,
    output: PathBuf,
}

impl Inspect {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = RegistrySource::connect(
            globals.endpoint(self.registry.as_str(), self.image.as_str(), self.tag.as_str()),
            globals.platform(),
            globals.workers,
            globals.temp_dir.clone(),
        )
        .await?;
        let mut sink = InspectFilter::new(None, &self.output, source.image(), source.tag());
        pipeline::run(&mut source, &mut sink).await
    }
}
