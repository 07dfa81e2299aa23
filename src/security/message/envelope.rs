use bytes::Bytes;

use crate::{
  security::{
    message::{
      fault::{Fault, FAULT_ACTION},
      security_header::{EncryptedData, SecurityHeader},
      xml_writer::{canonical_bytes, XmlWriter, XmlWriterExt},
    },
    protocol::SecurityMessageProperty,
    standards::{SecurityStandardsManager, SOAP12_ENVELOPE_NAMESPACE},
    trust::{
      RequestSecurityToken, RequestSecurityTokenResponse, RequestSecurityTokenResponseCollection,
    },
    types::UniqueId,
    SecurityResult,
  },
  security_error,
};

pub const ADDRESSING_NAMESPACE: &str = "http://www.w3.org/2005/08/addressing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderContent {
  /// Canonical content of the header element
  Plain(Bytes),
  /// Content replaced by its encryption
  Encrypted(EncryptedData),
}

/// A SOAP header other than the security header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
  pub name: String,
  pub namespace: String,
  pub id: Option<String>,
  pub must_understand: bool,
  pub content: HeaderContent,
}

impl MessageHeader {
  pub fn new(name: impl Into<String>, namespace: impl Into<String>, content: Bytes) -> Self {
    MessageHeader {
      name: name.into(),
      namespace: namespace.into(),
      id: None,
      must_understand: false,
      content: HeaderContent::Plain(content),
    }
  }

  pub fn is_encrypted(&self) -> bool {
    matches!(self.content, HeaderContent::Encrypted(_))
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    writer.write_start_element("", &self.name, &self.namespace);
    if let Some(id) = &self.id {
      writer.write_wsu_id(id);
    }
    if self.must_understand {
      writer.write_attribute("s", "mustUnderstand", SOAP12_ENVELOPE_NAMESPACE, "1");
    }
    match &self.content {
      HeaderContent::Plain(content) => writer.write_raw(content),
      HeaderContent::Encrypted(data) => data.write_to(writer, standards),
    }
    writer.write_end_element();
  }

  pub fn canonical_bytes(&self, standards: &SecurityStandardsManager) -> Vec<u8> {
    canonical_bytes(|w| self.write_to(w, standards))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
  Empty,
  /// Application payload, already in canonical form
  Raw(Bytes),
  Rst(RequestSecurityToken),
  Rstr(RequestSecurityTokenResponse),
  RstrCollection(RequestSecurityTokenResponseCollection),
  Fault(Fault),
  Encrypted(EncryptedData),
}

impl MessageBody {
  pub fn is_encrypted(&self) -> bool {
    matches!(self, MessageBody::Encrypted(_))
  }

  pub fn is_empty(&self) -> bool {
    matches!(self, MessageBody::Empty)
  }

  /// Canonical bytes of the body content, the plaintext when the body gets
  /// encrypted.
  pub fn content_bytes(&self, standards: &SecurityStandardsManager) -> Vec<u8> {
    canonical_bytes(|w| self.write_contents(w, standards))
  }

  pub fn write_contents(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    match self {
      MessageBody::Empty => {}
      MessageBody::Raw(bytes) => writer.write_raw(bytes),
      MessageBody::Rst(rst) => writer.write_raw(&rst.canonical_bytes()),
      MessageBody::Rstr(rstr) => writer.write_raw(&rstr.canonical_bytes()),
      MessageBody::RstrCollection(collection) => writer.write_raw(&collection.canonical_bytes()),
      MessageBody::Fault(fault) => fault.write_to(writer),
      MessageBody::Encrypted(data) => data.write_to(writer, standards),
    }
  }
}

/// Per-message state that is not serialized.
#[derive(Debug, Clone, Default)]
pub struct MessageProperties {
  pub security: Option<SecurityMessageProperty>,
  /// Context ids found by the session filter probe
  pub session_filter_ids: Option<Vec<UniqueId>>,
}

#[derive(Debug, Clone)]
pub struct Message {
  pub action: String,
  pub message_id: Option<UniqueId>,
  pub relates_to: Option<UniqueId>,
  pub to: Option<String>,
  pub headers: Vec<MessageHeader>,
  pub security_header: Option<SecurityHeader>,
  pub body_id: Option<String>,
  pub body: MessageBody,
  pub properties: MessageProperties,
}

impl Message {
  pub fn new(action: impl Into<String>, body: MessageBody) -> Self {
    Message {
      action: action.into(),
      message_id: Some(UniqueId::new()),
      relates_to: None,
      to: None,
      headers: Vec::new(),
      security_header: None,
      body_id: None,
      body,
      properties: MessageProperties::default(),
    }
  }

  /// Reply to `request`, correlated through relates-to.
  pub fn reply_to(request: &Message, action: impl Into<String>, body: MessageBody) -> Self {
    let mut reply = Message::new(action, body);
    reply.relates_to = request.message_id.clone();
    reply
  }

  pub fn fault_reply(request: &Message, fault: Fault) -> Self {
    Message::reply_to(request, FAULT_ACTION, MessageBody::Fault(fault))
  }

  pub fn is_fault(&self) -> bool {
    matches!(self.body, MessageBody::Fault(_))
  }

  pub fn with_header(mut self, header: MessageHeader) -> Self {
    self.headers.push(header);
    self
  }

  pub fn find_header(&self, name: &str, namespace: &str) -> Option<&MessageHeader> {
    self
      .headers
      .iter()
      .find(|h| h.name == name && h.namespace == namespace)
  }

  pub fn header_by_id(&self, id: &str) -> Option<&MessageHeader> {
    self.headers.iter().find(|h| h.id.as_deref() == Some(id))
  }

  pub fn header_by_id_mut(&mut self, id: &str) -> Option<&mut MessageHeader> {
    self
      .headers
      .iter_mut()
      .find(|h| h.id.as_deref() == Some(id))
  }

  /// Canonical `<s:Body>` element, including its id.
  pub fn body_canonical_bytes(&self, standards: &SecurityStandardsManager) -> Vec<u8> {
    canonical_bytes(|w| {
      w.write_start_element("s", "Body", SOAP12_ENVELOPE_NAMESPACE);
      if let Some(id) = &self.body_id {
        w.write_wsu_id(id);
      }
      self.body.write_contents(w, standards);
      w.write_end_element();
    })
  }

  /// Canonical bytes of the element with the given id, if it is the body or
  /// one of the (non-security) headers.
  pub fn part_canonical_bytes(
    &self,
    id: &str,
    standards: &SecurityStandardsManager,
  ) -> Option<Vec<u8>> {
    if self.body_id.as_deref() == Some(id) {
      Some(self.body_canonical_bytes(standards))
    } else {
      self.header_by_id(id).map(|h| h.canonical_bytes(standards))
    }
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter, standards: &SecurityStandardsManager) {
    let soap = SOAP12_ENVELOPE_NAMESPACE;
    writer.write_start_element("s", "Envelope", soap);
    writer.write_start_element("s", "Header", soap);
    writer.write_element_string("a", "Action", ADDRESSING_NAMESPACE, &self.action);
    if let Some(message_id) = &self.message_id {
      writer.write_element_string("a", "MessageID", ADDRESSING_NAMESPACE, message_id.as_str());
    }
    if let Some(relates_to) = &self.relates_to {
      writer.write_element_string("a", "RelatesTo", ADDRESSING_NAMESPACE, relates_to.as_str());
    }
    if let Some(to) = &self.to {
      writer.write_element_string("a", "To", ADDRESSING_NAMESPACE, to);
    }
    for header in &self.headers {
      header.write_to(writer, standards);
    }
    if let Some(security_header) = &self.security_header {
      security_header.write_to(writer, standards);
    }
    writer.write_end_element();
    writer.write_raw(&self.body_canonical_bytes(standards));
    writer.write_end_element();
  }

  pub fn canonical_bytes(&self, standards: &SecurityStandardsManager) -> Vec<u8> {
    canonical_bytes(|w| self.write_to(w, standards))
  }

  pub fn fault(&self) -> Option<&Fault> {
    match &self.body {
      MessageBody::Fault(fault) => Some(fault),
      _ => None,
    }
  }

  pub fn expect_rst(&self) -> SecurityResult<&RequestSecurityToken> {
    match &self.body {
      MessageBody::Rst(rst) => Ok(rst),
      _ => Err(security_error!(
        Negotiation,
        "Expected a RequestSecurityToken body in message with action {}",
        self.action
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn body_bytes_cover_the_id() {
    let standards = SecurityStandardsManager::default();
    let mut message = Message::new("urn:ping", MessageBody::Raw(Bytes::from_static(b"<p>1</p>")));
    let without_id = message.body_canonical_bytes(&standards);
    message.body_id = Some("_1".to_string());
    let with_id = message.body_canonical_bytes(&standards);
    assert_ne!(without_id, with_id);
    assert_eq!(message.part_canonical_bytes("_1", &standards), Some(with_id));
    assert_eq!(message.part_canonical_bytes("_2", &standards), None);
  }

  #[test]
  fn reply_is_correlated() {
    let request = Message::new("urn:ping", MessageBody::Empty);
    let reply = Message::reply_to(&request, "urn:pong", MessageBody::Empty);
    assert_eq!(reply.relates_to, request.message_id);
    assert_ne!(reply.message_id, request.message_id);
  }

  #[test]
  fn headers_are_found_by_name_and_id() {
    let mut header = MessageHeader::new("Route", "urn:app", Bytes::from_static(b"a"));
    header.id = Some("_5".to_string());
    let message = Message::new("urn:ping", MessageBody::Empty).with_header(header);
    assert!(message.find_header("Route", "urn:app").is_some());
    assert!(message.find_header("Route", "urn:other").is_none());
    assert_eq!(message.header_by_id("_5").map(|h| h.name.as_str()), Some("Route"));
  }
}
