use std::{fmt, sync::PoisonError};

use serde::{Deserialize, Serialize};
use speedy::{Readable, Writable};
use uuid::Uuid;

use crate::security::standards::FaultSubcode;

// Result type with generic OK type. Error type is SecurityError.
pub type SecurityResult<T> = std::result::Result<T, SecurityError>;

/// Coarse classification of security failures.
///
/// Components wrap lower-level parsing and crypto errors into one of these
/// before the error crosses a component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityErrorKind {
  // Security negotiation failed (bad RST/RSTR, authenticator mismatch, ...)
  Negotiation,
  // Incoming message failed verification, or outgoing could not be secured
  MessageSecurity,
  // Peer violated the wire protocol
  Protocol,
  // A cache or per-message quota was exhausted
  QuotaExceeded,
  // Caller supplied an invalid value
  Argument,
  // Time budget exhausted
  Timeout,
  // Operation is not valid in the current state
  InvalidOperation,
  // A security token could not be read, resolved or validated
  SecurityToken,
  // Malformed XML structure
  Xml,
  // Malformed encoding (base64, binary element payloads, ...)
  Format,
  // Internal failure, e.g. a poisoned lock
  Internal,
}

impl fmt::Display for SecurityErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SecurityErrorKind::Negotiation => "Security negotiation error",
      SecurityErrorKind::MessageSecurity => "Message security error",
      SecurityErrorKind::Protocol => "Protocol error",
      SecurityErrorKind::QuotaExceeded => "Quota exceeded",
      SecurityErrorKind::Argument => "Argument error",
      SecurityErrorKind::Timeout => "Timeout",
      SecurityErrorKind::InvalidOperation => "Invalid operation",
      SecurityErrorKind::SecurityToken => "Security token error",
      SecurityErrorKind::Xml => "XML error",
      SecurityErrorKind::Format => "Format error",
      SecurityErrorKind::Internal => "Internal error",
    };
    f.write_str(name)
  }
}

// Something like the SecurityException of WS-Security stacks: a kind, a
// message that is safe to show to the peer, and optionally the SOAP fault
// subcode to use when the error is reported on the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {msg}")]
pub struct SecurityError {
  kind: SecurityErrorKind,
  msg: String,
  fault_subcode: Option<FaultSubcode>,
}

impl SecurityError {
  pub fn new(kind: SecurityErrorKind, msg: impl Into<String>) -> Self {
    SecurityError {
      kind,
      msg: msg.into(),
      fault_subcode: None,
    }
  }

  pub fn with_fault_subcode(mut self, subcode: FaultSubcode) -> Self {
    self.fault_subcode = Some(subcode);
    self
  }

  pub fn kind(&self) -> SecurityErrorKind {
    self.kind
  }

  pub fn message(&self) -> &str {
    &self.msg
  }

  pub fn fault_subcode(&self) -> Option<FaultSubcode> {
    self.fault_subcode
  }

  pub fn is_timeout(&self) -> bool {
    self.kind == SecurityErrorKind::Timeout
  }
}

#[macro_export]
macro_rules! security_error {
  ($kind:ident, $($arg:tt)*) => {
    $crate::security::SecurityError::new(
      $crate::security::SecurityErrorKind::$kind,
      format!($($arg)*),
    )
  };
}

#[macro_export]
macro_rules! create_security_error_and_log {
  ($kind:ident, $($arg:tt)*) => {{
    let error = $crate::security_error!($kind, $($arg)*);
    log::error!("{}", error);
    error
  }};
}

impl<T> From<PoisonError<T>> for SecurityError {
  fn from(_: PoisonError<T>) -> Self {
    SecurityError::new(SecurityErrorKind::Internal, "Lock poisoned")
  }
}

impl From<ring::error::Unspecified> for SecurityError {
  fn from(_: ring::error::Unspecified) -> Self {
    SecurityError::new(
      SecurityErrorKind::MessageSecurity,
      "Cryptographic operation failed",
    )
  }
}

impl From<rsa::Error> for SecurityError {
  fn from(e: rsa::Error) -> Self {
    SecurityError::new(
      SecurityErrorKind::MessageSecurity,
      format!("RSA operation failed: {e}"),
    )
  }
}

impl From<speedy::Error> for SecurityError {
  fn from(e: speedy::Error) -> Self {
    SecurityError::new(
      SecurityErrorKind::Format,
      format!("Malformed binary element: {e}"),
    )
  }
}

/// Name/value configuration property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
  pub name: String,
  pub value: String,
}

impl Property {
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
    Property {
      name: name.into(),
      value: value.into(),
    }
  }
}

/// Globally unique identifier in `urn:uuid:` form, used for security context
/// ids and key generations.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Readable, Writable,
)]
pub struct UniqueId(String);

impl UniqueId {
  pub fn new() -> Self {
    UniqueId(format!("urn:uuid:{}", Uuid::new_v4()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Default for UniqueId {
  fn default() -> Self {
    Self::new()
  }
}

impl From<&str> for UniqueId {
  fn from(s: &str) -> Self {
    UniqueId(s.to_string())
  }
}

impl From<String> for UniqueId {
  fn from(s: String) -> Self {
    UniqueId(s)
  }
}

impl fmt::Display for UniqueId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Generates `wsu:Id` values for one message. Ids are unique within the
/// message because of the shared random prefix and the running counter.
#[derive(Debug)]
pub struct IdGenerator {
  prefix: String,
  counter: u32,
}

impl IdGenerator {
  pub fn new() -> Self {
    let uuid = Uuid::new_v4().simple().to_string();
    IdGenerator {
      prefix: format!("_{}", &uuid[..8]),
      counter: 0,
    }
  }

  pub fn next_id(&mut self) -> String {
    let id = format!("{}-{}", self.prefix, self.counter);
    self.counter += 1;
    id
  }
}

impl Default for IdGenerator {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn error_carries_kind_and_subcode() {
    let e = security_error!(Negotiation, "context {} does not match", "abc")
      .with_fault_subcode(FaultSubcode::FailedAuthentication);
    assert_eq!(e.kind(), SecurityErrorKind::Negotiation);
    assert_eq!(e.message(), "context abc does not match");
    assert_eq!(e.fault_subcode(), Some(FaultSubcode::FailedAuthentication));
    assert!(e.to_string().starts_with("Security negotiation error"));
  }

  #[test]
  fn id_generator_is_unique() {
    let mut generator = IdGenerator::new();
    let a = generator.next_id();
    let b = generator.next_id();
    assert_ne!(a, b);
    assert!(a.starts_with('_'));
  }

  #[test]
  fn unique_ids_differ() {
    let a = UniqueId::new();
    let b = UniqueId::new();
    assert_ne!(a, b);
    assert!(a.as_str().starts_with("urn:uuid:"));
  }
}
