pub mod decode;
pub mod mapper;

pub use decode::{decode, DecodedPayload, RawMeterPayload};
pub use mapper::{EnabledKinds, MappedStreams, SourcePoint, SourceValue, StreamMapper};
