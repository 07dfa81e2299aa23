// In-memory SOAP message model. Serialization is limited to producing
// canonical bytes for digests and signatures.
pub mod envelope;
pub mod fault;
pub mod security_header;
pub mod xml_writer;

pub use envelope::{HeaderContent, Message, MessageBody, MessageHeader, MessageProperties};
pub use fault::{Fault, FaultCode};
pub use security_header::{SecurityHeader, SecurityHeaderElement};
