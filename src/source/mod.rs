pub mod daemon;
pub mod directory;
pub mod registry;
pub(crate) mod savetar;
pub mod tarball;

pub use daemon::DaemonSource;
pub use directory::DirectorySource;
pub use registry::RegistrySource;
pub use tarball::TarballSource;

use async_trait::async_trait;

use crate::element::ElementSink;
use crate::Result;

/// The input half of the element stream. A source knows which image it
/// serves and pushes that image's elements — configuration first, then
/// layers in manifest order — into a sink, consulting the sink's
/// [`crate::element::ElementSink::should_fetch`] before doing the work of
/// materializing each layer.
#[async_trait]
pub trait ImageSource: Send {
    fn image(&self) -> &str;

    fn tag(&self) -> &str;

    async fn stream_to(&mut self, sink: &mut dyn ElementSink) -> Result<()>;
}
