use std::path::PathBuf;

use clap::Parser;
use ocistream::models::Compression;
use ocistream::pipeline;
use ocistream::sink::RegistrySink;
use ocistream::source::TarballSource;
use ocistream::Result;

use super::{FilterArgs, Globals};

#[derive(clap::ValueEnum, Debug, Clone, Copy, Default)]
enum WireCompression {
    #[default]
    Gzip,
    Zstd,
    None,
}

impl From<WireCompression> for Compression {
    fn from(value: WireCompression) -> Self {
        match value {
            WireCompression::Gzip => Compression::Gzip,
            WireCompression::Zstd => Compression::Zstd,
            WireCompression::None => Compression::None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Push an image from a save-tarball to a registry")]
pub struct Push {
    input: PathBuf,
    registry: String,
    image: String,
    tag: String,
    #[arg(long, value_enum, default_value = "gzip")]
    compression: WireCompression,
    #[command(flatten)]
    filters: FilterArgs,
}

impl Push {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let mut source = TarballSource::open(&self.input, globals.temp_dir.clone()).await?;
        let sink = RegistrySink::connect(
            globals.endpoint(self.registry.as_str(), self.image.as_str(), self.tag.as_str()),
            self.compression.into(),
            globals.workers,
            globals.temp_dir.clone(),
        )
        .await?;
        let mut sink = self.filters.wrap(
            Box::new(sink),
            globals,
            self.image.as_str(),
            self.tag.as_str(),
        )?;
        pipeline::run(&mut source, sink.as_mut()).await
    }
}
