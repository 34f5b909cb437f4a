//! Audio subsystem module

pub mod decoder;
pub mod device;
pub mod loopback;
pub mod pcm;
pub mod source;

pub use decoder::{DecoderCommand, FileSource};
pub use device::{enumerate_devices, get_device_by_index, DeviceDescriptor};
pub use loopback::LoopbackSource;
pub use source::{AudioSource, SourceFactory, SourceSpec, SystemSources};
