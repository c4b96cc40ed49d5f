//! OCI image transports.
//!
//! Every source stages its image as a [`StagedImage`]: manifest, raw config
//! and re-openable layer blobs. Sinks write a staged image back out as an
//! OCI layout directory, a layout archive or a registry push.

pub mod archive;
pub mod layout;
pub mod reference;
pub mod registry;
pub mod transport;

pub use layout::{read_layout, write_layout, Provenance, StagedImage};
pub use reference::ImageReference;
pub use registry::{PushResult, RegistryAuth, RegistryPuller, RegistryPusher};
pub use transport::{ImageLocation, ImageSink, ImageSource, Transport};
