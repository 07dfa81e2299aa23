//! Message-level security for SOAP services.
//!
//! Security contexts are negotiated with WS-Trust / WS-SecureConversation
//! (SSPI-style multi-leg exchanges or direct issuance), stored in expiring
//! caches, and used by the symmetric, asymmetric, transport and duplex
//! security protocols to sign, encrypt and verify individual messages.
//!
//! XML parsing and the transport are left to the caller: messages are
//! exchanged as [`Message`](security::message::Message) values whose
//! canonical form is produced by the crate's own canonical writer.

pub mod security;

pub use security::{SecurityError, SecurityErrorKind, SecurityResult};
