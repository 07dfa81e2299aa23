use crate::security::{
  message::xml_writer::{XmlWriter, XmlWriterExt},
  standards::{FaultSubcode, SecurityStandardsManager, SOAP12_ENVELOPE_NAMESPACE},
  types::{SecurityError, SecurityErrorKind},
};

pub const FAULT_ACTION: &str = "http://www.w3.org/2005/08/addressing/soap/fault";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
  Sender,
  Receiver,
}

impl FaultCode {
  fn local_name(self) -> &'static str {
    match self {
      FaultCode::Sender => "Sender",
      FaultCode::Receiver => "Receiver",
    }
  }
}

/// SOAP 1.2 fault as produced by the security layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
  pub code: FaultCode,
  pub subcode: Option<FaultSubcode>,
  pub subcode_namespace: Option<String>,
  pub reason: String,
}

impl Fault {
  pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
    Fault {
      code,
      subcode: None,
      subcode_namespace: None,
      reason: reason.into(),
    }
  }

  pub fn with_subcode(mut self, subcode: FaultSubcode, standards: &SecurityStandardsManager) -> Self {
    self.subcode = Some(subcode);
    self.subcode_namespace = Some(standards.fault_subcode_namespace(subcode).to_string());
    self
  }

  pub fn is_failed_authentication(&self) -> bool {
    self.subcode == Some(FaultSubcode::FailedAuthentication)
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter) {
    let soap = SOAP12_ENVELOPE_NAMESPACE;
    writer.write_start_element("s", "Fault", soap);
    writer.write_start_element("s", "Code", soap);
    writer.write_element_string("s", "Value", soap, &format!("s:{}", self.code.local_name()));
    if let (Some(subcode), Some(ns)) = (self.subcode, &self.subcode_namespace) {
      writer.write_start_element("s", "Subcode", soap);
      writer.write_start_element("s", "Value", soap);
      writer.write_attribute("xmlns", "a", "", ns);
      writer.write_string(&format!("a:{}", subcode.local_name()));
      writer.write_end_element();
      writer.write_end_element();
    }
    writer.write_end_element();
    writer.write_start_element("s", "Reason", soap);
    writer.write_start_element("s", "Text", soap);
    writer.write_attribute("xml", "lang", "", "en-US");
    writer.write_string(&self.reason);
    writer.write_end_element();
    writer.write_end_element();
    writer.write_end_element();
  }

  /// Error to raise at the initiator when this fault arrives in reply to a
  /// negotiation leg.
  pub fn to_negotiation_error(&self) -> SecurityError {
    if self.is_failed_authentication() {
      SecurityError::new(
        SecurityErrorKind::Negotiation,
        format!("Security negotiation failed: authentication failed at the server ({})", self.reason),
      )
      .with_fault_subcode(FaultSubcode::FailedAuthentication)
    } else {
      let error = SecurityError::new(
        SecurityErrorKind::Negotiation,
        format!("Security negotiation fault: {}", self.reason),
      );
      match self.subcode {
        Some(subcode) => error.with_fault_subcode(subcode),
        None => error,
      }
    }
  }
}

impl SecurityError {
  /// Fault to send to the peer. Only the error message is used as reason
  /// text; callers never put key material into error messages.
  pub fn to_fault(&self, standards: &SecurityStandardsManager) -> Fault {
    let (code, default_subcode) = match self.kind() {
      SecurityErrorKind::Negotiation => (FaultCode::Sender, Some(FaultSubcode::FailedAuthentication)),
      SecurityErrorKind::MessageSecurity => (FaultCode::Sender, Some(FaultSubcode::InvalidSecurity)),
      SecurityErrorKind::SecurityToken => {
        (FaultCode::Sender, Some(FaultSubcode::InvalidSecurityToken))
      }
      SecurityErrorKind::Protocol
      | SecurityErrorKind::Argument
      | SecurityErrorKind::Xml
      | SecurityErrorKind::Format
      | SecurityErrorKind::InvalidOperation => (FaultCode::Sender, Some(FaultSubcode::InvalidRequest)),
      SecurityErrorKind::QuotaExceeded | SecurityErrorKind::Timeout => {
        (FaultCode::Receiver, Some(FaultSubcode::RequestFailed))
      }
      SecurityErrorKind::Internal => (FaultCode::Receiver, None),
    };
    let fault = Fault::new(code, self.message());
    match self.fault_subcode().or(default_subcode) {
      Some(subcode) => fault.with_subcode(subcode, standards),
      None => fault,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::security_error;

  #[test]
  fn negotiation_error_becomes_failed_authentication() {
    let standards = SecurityStandardsManager::default();
    let fault = security_error!(Negotiation, "bad blob").to_fault(&standards);
    assert_eq!(fault.code, FaultCode::Sender);
    assert!(fault.is_failed_authentication());
    assert_eq!(
      fault.subcode_namespace.as_deref(),
      Some(standards.security_version().namespace())
    );

    let error = fault.to_negotiation_error();
    assert_eq!(error.kind(), SecurityErrorKind::Negotiation);
    assert_eq!(error.fault_subcode(), Some(FaultSubcode::FailedAuthentication));
  }

  #[test]
  fn explicit_subcode_wins() {
    let standards = SecurityStandardsManager::default();
    let fault = security_error!(MessageSecurity, "unknown context")
      .with_fault_subcode(FaultSubcode::BadContextToken)
      .to_fault(&standards);
    assert_eq!(fault.subcode, Some(FaultSubcode::BadContextToken));
    assert_eq!(
      fault.subcode_namespace.as_deref(),
      Some(standards.secure_conversation_version().namespace())
    );
    let error = fault.to_negotiation_error();
    assert!(error.message().contains("unknown context"));
  }
}
