pub mod codec;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod message;
pub mod transport;
pub mod udp;

pub use codec::{JsonCodec, MessageSchema, ProtocolCodec, SchemaSet};
pub use descriptor::{Descriptor, TransportKind};
pub use error::{CodecError, TransportError, TransportResult};
pub use message::Message;
pub use transport::{AcquireInput, Transport};
pub use udp::UdpTransport;
