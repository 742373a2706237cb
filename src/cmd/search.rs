use clap::Parser;
use ocistream::filter::SearchFilter;
use ocistream::pipeline;
use ocistream::source::{ImageSource, RegistrySource};
use ocistream::Result;

use super::Globals;

#[derive(Parser, Debug)]
#[command(about = "Search for files matching a pattern in an image's layers")]
pub struct Search {
    registry: String,
    image: String,
    tag: String,
    pattern: String,
    #[arg(long, help = "Treat the pattern as a regex instead of a glob")]
    regex: bool,
    #[arg(long, help = "Output one image:tag:layer:path line per match")]
    script_friendly: bool,
}

impl Search {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = RegistrySource::connect(
            globals.endpoint(self.registry.as_str(), self.image.as_str(), self.tag.as_str()),
            globals.platform(),
            globals.workers,
            globals.temp_dir.clone(),
        )
        .await?;
        let mut sink = SearchFilter::new(
            None,
            self.pattern.as_str(),
            self.regex,
            source.image(),
            source.tag(),
            self.script_friendly,
        )?;
        pipeline::run(&mut source, &mut sink).await
    }
}
