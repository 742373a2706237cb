use std::path::PathBuf;

use clap::Parser;
use ocistream::filter::SearchFilter;
use ocistream::pipeline;
use ocistream::source::{ImageSource, TarballSource};
use ocistream::Result;

use super::Globals;

#[derive(Parser, Debug)]
#[command(about = "Search for files matching a pattern in a save-tarball's layers")]
pub struct SearchTarball {
    tarball: PathBuf,
    pattern: String,
    #[arg(long, help = "Treat the pattern as a regex instead of a glob")]
    regex: bool,
    #[arg(long, help = "Output one image:tag:layer:path line per match")]
    script_friendly: bool,
}

impl SearchTarball {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = TarballSource::open(&self.tarball, globals.temp_dir.clone()).await?;
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
