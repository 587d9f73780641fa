//! Data references and the storage protocols behind them.
//!
//! A reference string such as `s3://bucket/reads.fq.gz` is resolved against
//! a `DataRegistry` into a `DataFile`, which reads and writes through the
//! protocol registered for its scheme. Resolution is a pure lookup.

mod file;
pub mod protocol;
mod registry;

pub use file::{Data, DataFile, Metadata};
pub use protocol::{
    Capabilities, DataProtocol, FnTranslator, ProtocolRegistry, ReadStream, Translator,
    WriteStream,
};
pub use registry::{DataRegistry, ProtocolSettings};
