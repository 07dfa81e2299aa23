use std::collections::HashSet;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    message::{security_header::SecurityHeaderElement, Message},
    standards::FaultSubcode,
    tokens::SecurityToken,
    SecurityResult,
  },
  security_error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveSecurityHeaderElementCategory {
  Signature,
  ReferenceList,
  EncryptedData,
  SignatureConfirmation,
  Timestamp,
  SecurityTokenReference,
  Token,
}

impl ReceiveSecurityHeaderElementCategory {
  pub fn of(element: &SecurityHeaderElement) -> Self {
    match element {
      SecurityHeaderElement::Signature(_) => Self::Signature,
      SecurityHeaderElement::ReferenceList(_) => Self::ReferenceList,
      SecurityHeaderElement::EncryptedData(_) => Self::EncryptedData,
      SecurityHeaderElement::SignatureConfirmation(_) => Self::SignatureConfirmation,
      SecurityHeaderElement::Timestamp(_) => Self::Timestamp,
      SecurityHeaderElement::SecurityTokenReference(_) => Self::SecurityTokenReference,
      SecurityHeaderElement::Token(_)
      | SecurityHeaderElement::EncryptedKey(_)
      | SecurityHeaderElement::DerivedKeyToken(_) => Self::Token,
    }
  }
}

/// How a token in the header is bound to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveSecurityHeaderBindingModes {
  #[default]
  Unknown,
  Primary,
  Signed,
  SignedEndorsing,
  Endorsing,
  /// Signed and encrypted supporting token
  Basic,
}

impl ReceiveSecurityHeaderBindingModes {
  fn requires_signature(self) -> bool {
    matches!(self, Self::Signed | Self::SignedEndorsing | Self::Basic)
  }
}

#[derive(Debug, Clone)]
pub struct ReceiveSecurityHeaderEntry {
  pub category: ReceiveSecurityHeaderElementCategory,
  pub id: Option<String>,
  pub binding_mode: ReceiveSecurityHeaderBindingModes,
  pub signed: bool,
  pub encrypted: bool,
  pub token: Option<SecurityToken>,
  /// Index of the supporting token requirement this entry satisfies
  pub supporting_token_tracker: Option<usize>,
}

/// Bookkeeping for every element parsed from an incoming security header.
///
/// Ids are unique across the security header, the message headers and the
/// body. A repeated id fails the message: the signature could otherwise be
/// checked against a different element than the one the application sees.
#[derive(Debug, Default)]
pub struct ReceiveSecurityHeaderElementManager {
  entries: Vec<ReceiveSecurityHeaderEntry>,
  ids: HashSet<String>,
  signed_ids: HashSet<String>,
  encrypted_ids: HashSet<String>,
}

impl ReceiveSecurityHeaderElementManager {
  pub fn new() -> Self {
    Self::default()
  }

  /// Records the ids of the message headers and the body.
  pub fn register_message_ids(&mut self, message: &Message) -> SecurityResult<()> {
    for id in message.headers.iter().filter_map(|h| h.id.as_deref()) {
      self.register_id(id)?;
    }
    if let Some(id) = &message.body_id {
      self.register_id(id)?;
    }
    Ok(())
  }

  fn register_id(&mut self, id: &str) -> SecurityResult<()> {
    if id.is_empty() {
      return Err(security_error!(Format, "Empty element id in the message"));
    }
    if !self.ids.insert(id.to_string()) {
      return Err(
        security_error!(MessageSecurity, "Duplicate element id {id} in the message")
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    Ok(())
  }

  /// Adds a header element. Returns its index.
  pub fn append_element(&mut self, element: &SecurityHeaderElement) -> SecurityResult<usize> {
    self.append(ReceiveSecurityHeaderElementCategory::of(element), element.id())
  }

  pub fn append(
    &mut self,
    category: ReceiveSecurityHeaderElementCategory,
    id: Option<&str>,
  ) -> SecurityResult<usize> {
    if let Some(id) = id {
      self.register_id(id)?;
    }
    self.entries.push(ReceiveSecurityHeaderEntry {
      category,
      id: id.map(str::to_string),
      binding_mode: ReceiveSecurityHeaderBindingModes::Unknown,
      signed: false,
      encrypted: false,
      token: None,
      supporting_token_tracker: None,
    });
    Ok(self.entries.len() - 1)
  }

  /// Replaces an `EncryptedData` entry by the element it decrypted to. The
  /// decrypted element keeps the position and is marked encrypted.
  pub fn replace_decrypted(
    &mut self,
    index: usize,
    element: &SecurityHeaderElement,
  ) -> SecurityResult<()> {
    if let Some(id) = element.id() {
      self.register_id(id)?;
    }
    let entry = self
      .entries
      .get_mut(index)
      .ok_or_else(|| security_error!(Internal, "No header element at index {index}"))?;
    entry.category = ReceiveSecurityHeaderElementCategory::of(element);
    entry.id = element.id().map(str::to_string);
    entry.encrypted = true;
    if let Some(id) = element.id() {
      self.encrypted_ids.insert(id.to_string());
    }
    Ok(())
  }

  pub fn set_token(&mut self, index: usize, token: SecurityToken) {
    if let Some(entry) = self.entries.get_mut(index) {
      entry.token = Some(token);
    }
  }

  pub fn set_binding_mode(
    &mut self,
    index: usize,
    mode: ReceiveSecurityHeaderBindingModes,
    supporting_token_tracker: Option<usize>,
  ) {
    if let Some(entry) = self.entries.get_mut(index) {
      entry.binding_mode = mode;
      entry.supporting_token_tracker = supporting_token_tracker;
    }
  }

  /// Index of the token entry holding `token` (or the token it was derived
  /// from or wrapped with).
  pub fn find_token_entry(&self, token: &SecurityToken) -> Option<usize> {
    let root_id = token.root_token().id();
    self.entries.iter().position(|e| {
      e.token
        .as_ref()
        .is_some_and(|t| t.id() == token.id() || t.id() == root_id)
    })
  }

  /// Marks the element with `id` as covered by a verified signature.
  pub fn mark_signed(&mut self, id: &str) {
    self.signed_ids.insert(id.to_string());
    for entry in self.entries.iter_mut().filter(|e| e.id.as_deref() == Some(id)) {
      entry.signed = true;
    }
  }

  pub fn mark_encrypted(&mut self, id: &str) {
    self.encrypted_ids.insert(id.to_string());
    for entry in self.entries.iter_mut().filter(|e| e.id.as_deref() == Some(id)) {
      entry.encrypted = true;
    }
  }

  pub fn is_signed(&self, id: &str) -> bool {
    self.signed_ids.contains(id)
  }

  pub fn is_encrypted(&self, id: &str) -> bool {
    self.encrypted_ids.contains(id)
  }

  pub fn contains_id(&self, id: &str) -> bool {
    self.ids.contains(id)
  }

  pub fn entries(&self) -> &[ReceiveSecurityHeaderEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn count(&self, category: ReceiveSecurityHeaderElementCategory) -> usize {
    self.entries.iter().filter(|e| e.category == category).count()
  }

  /// Every timestamp and signature confirmation must be signed, tokens bound
  /// as Signed, SignedEndorsing or Basic must be signed, and Basic tokens
  /// must also have arrived encrypted.
  pub fn ensure_all_required_security_header_targets_were_protected(&self) -> SecurityResult<()> {
    for entry in &self.entries {
      let name = entry.id.as_deref().unwrap_or("<no id>");
      match entry.category {
        ReceiveSecurityHeaderElementCategory::Timestamp
        | ReceiveSecurityHeaderElementCategory::SignatureConfirmation
          if !entry.signed =>
        {
          return Err(
            security_error!(
              MessageSecurity,
              "The {:?} element {name} is not signed",
              entry.category
            )
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
          );
        }
        ReceiveSecurityHeaderElementCategory::Token => {
          if entry.binding_mode.requires_signature() && !entry.signed {
            return Err(
              security_error!(
                MessageSecurity,
                "The {:?} supporting token {name} is not signed",
                entry.binding_mode
              )
              .with_fault_subcode(FaultSubcode::InvalidSecurity),
            );
          }
          if entry.binding_mode == ReceiveSecurityHeaderBindingModes::Basic && !entry.encrypted {
            return Err(
              security_error!(MessageSecurity, "The supporting token {name} is not encrypted")
                .with_fault_subcode(FaultSubcode::InvalidSecurity),
            );
          }
        }
        _ => {}
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;
  use crate::security::message::{
    security_header::{SignatureConfirmationElement, TimestampElement},
    MessageBody, MessageHeader,
  };

  fn timestamp(id: &str) -> SecurityHeaderElement {
    SecurityHeaderElement::Timestamp(TimestampElement {
      id: id.to_string(),
      created: Utc::now(),
      expires: None,
    })
  }

  #[test]
  fn duplicate_ids_fail() {
    let mut manager = ReceiveSecurityHeaderElementManager::new();
    manager.append_element(&timestamp("_0")).unwrap();
    let err = manager.append_element(&timestamp("_0")).unwrap_err();
    assert_eq!(err.kind(), crate::security::SecurityErrorKind::MessageSecurity);
  }

  #[test]
  fn header_ids_collide_with_message_parts() {
    let mut message = Message::new("urn:a", MessageBody::Empty);
    message.body_id = Some("_1".to_string());
    let mut header = MessageHeader::new("To", "urn:h", bytes::Bytes::from_static(b"x"));
    header.id = Some("_2".to_string());
    message.headers.push(header);

    let mut manager = ReceiveSecurityHeaderElementManager::new();
    manager.register_message_ids(&message).unwrap();
    assert!(manager.append_element(&timestamp("_1")).is_err());
    assert!(manager.append_element(&timestamp("_2")).is_err());
    assert!(manager.append_element(&timestamp("_3")).is_ok());
  }

  #[test]
  fn unsigned_timestamp_is_unprotected() {
    let mut manager = ReceiveSecurityHeaderElementManager::new();
    manager.append_element(&timestamp("_0")).unwrap();
    manager
      .append_element(&SecurityHeaderElement::SignatureConfirmation(
        SignatureConfirmationElement {
          id: "_1".to_string(),
          value: None,
        },
      ))
      .unwrap();
    assert!(manager
      .ensure_all_required_security_header_targets_were_protected()
      .is_err());
    manager.mark_signed("_0");
    assert!(manager
      .ensure_all_required_security_header_targets_were_protected()
      .is_err());
    manager.mark_signed("_1");
    manager
      .ensure_all_required_security_header_targets_were_protected()
      .unwrap();
  }

  #[test]
  fn basic_tokens_must_be_signed_and_encrypted() {
    let mut manager = ReceiveSecurityHeaderElementManager::new();
    let index = manager
      .append(ReceiveSecurityHeaderElementCategory::Token, Some("_t"))
      .unwrap();
    manager.set_binding_mode(index, ReceiveSecurityHeaderBindingModes::Basic, Some(0));
    manager.mark_signed("_t");
    assert!(manager
      .ensure_all_required_security_header_targets_were_protected()
      .is_err());
    manager.mark_encrypted("_t");
    manager
      .ensure_all_required_security_header_targets_were_protected()
      .unwrap();

    let endorsing = manager
      .append(ReceiveSecurityHeaderElementCategory::Token, Some("_e"))
      .unwrap();
    manager.set_binding_mode(endorsing, ReceiveSecurityHeaderBindingModes::Endorsing, Some(1));
    manager
      .ensure_all_required_security_header_targets_were_protected()
      .unwrap();
  }
}
