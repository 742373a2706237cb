pub mod bundle;
pub mod extract;
pub mod inspect;
pub mod load;
pub mod mounts;
pub mod pull;
pub mod push;
pub mod rebuild;
pub mod save;
pub mod search;
pub mod search_tarball;

use std::path::PathBuf;

use ocistream::element::ElementSink;
use ocistream::filter::{ExcludeFilter, InspectFilter, TimestampNormalizer};
use ocistream::models::{Platform, RegistryEndpoint};
use ocistream::Result;

/// Options every command shares.
#[derive(clap::Args, Debug, Clone)]
pub struct Globals {
    #[arg(long, global = true, default_value = "linux")]
    pub os: String,
    #[arg(long, global = true, default_value = "amd64")]
    pub architecture: String,
    #[arg(long, global = true, default_value = "")]
    pub variant: String,
    #[arg(
        long,
        global = true,
        env = "OCISTREAM_USERNAME",
        help = "Username for registry authentication"
    )]
    pub username: Option<String>,
    #[arg(
        long,
        global = true,
        env = "OCISTREAM_PASSWORD",
        help = "Password for registry authentication"
    )]
    pub password: Option<String>,
    #[arg(
        long,
        global = true,
        help = "Use HTTP instead of HTTPS for registry connections"
    )]
    pub insecure: bool,
    #[arg(long, global = true, default_value_t = 4)]
    pub workers: usize,
    #[arg(long, global = true, help = "Directory for temporary layer files")]
    pub temp_dir: Option<PathBuf>,
}

impl Globals {
    pub fn platform(&self) -> Platform {
        Platform::new(
            self.os.as_str(),
            self.architecture.as_str(),
            self.variant.as_str(),
        )
    }

    pub fn endpoint(&self, host: &str, image: &str, tag: &str) -> RegistryEndpoint {
        RegistryEndpoint {
            host: host.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
            secure: !self.insecure,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Filter options commands with a writable output accept.
#[derive(clap::Args, Debug, Clone)]
pub struct FilterArgs {
    #[arg(long, help = "Exclude members matching this glob; repeatable")]
    pub exclude: Vec<String>,
    #[arg(long, default_value_t = false)]
    pub normalize_timestamps: bool,
    #[arg(long, default_value_t = 0)]
    pub timestamp: u64,
    #[arg(long, help = "Append per-image layer metadata to this JSONL file")]
    pub inspect_to: Option<PathBuf>,
}

impl FilterArgs {
    /// Wrap a sink in the configured filter chain. The inspect filter sits
    /// outermost so it records what the source produced; rewrites happen on
    /// the way down.
    pub fn wrap(
        &self,
        sink: Box<dyn ElementSink>,
        globals: &Globals,
        image: &str,
        tag: &str,
    ) -> Result<Box<dyn ElementSink>> {
        let mut sink = sink;
        if self.normalize_timestamps {
            sink = Box::new(TimestampNormalizer::new(
                sink,
                self.timestamp,
                globals.temp_dir.clone(),
            ));
        }
        if !self.exclude.is_empty() {
            sink = Box::new(ExcludeFilter::new(
                sink,
                self.exclude.as_slice(),
                globals.temp_dir.clone(),
            )?);
        }
        if let Some(inspect_to) = self.inspect_to.as_ref() {
            sink = Box::new(InspectFilter::new(Some(sink), inspect_to, image, tag));
        }
        Ok(sink)
    }
}
