//! SOA core: request headers, wire framing, the protocol codec and the processor contract.

pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod header;
pub mod processor;

pub use codec::{CodecError, DecodedMessage, MsgPackProtocol, ProtocolCodec};
pub use context::RequestContext;
pub use error::{FailureKind, ProcessError, SoaBaseCode, SoaError};
pub use header::{MessageType, ProcessorKey, ServiceIdentity, SoaHeader};
pub use processor::{FnProcessor, Processor, Reply};

