use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
  security::{message::Message, SecurityResult},
  security_error,
};

/// Action that matches every message.
pub const WILDCARD_ACTION: &str = "*";

/// Qualified name of a SOAP header.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HeaderQName {
  pub name: String,
  pub namespace: String,
}

impl HeaderQName {
  pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
    HeaderQName {
      name: name.into(),
      namespace: namespace.into(),
    }
  }

  /// Empty name matches every header of the namespace.
  fn matches(&self, name: &str, namespace: &str) -> bool {
    self.namespace == namespace && (self.name.is_empty() || self.name == name)
  }
}

/// The parts of a message that must be signed, or encrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePartSpecification {
  headers: BTreeSet<HeaderQName>,
  is_body_included: bool,
  #[serde(skip)]
  read_only: bool,
}

impl MessagePartSpecification {
  pub fn new(is_body_included: bool) -> Self {
    MessagePartSpecification {
      headers: BTreeSet::new(),
      is_body_included,
      read_only: false,
    }
  }

  pub fn body() -> Self {
    Self::new(true)
  }

  pub fn with_header(mut self, header: HeaderQName) -> Self {
    self.headers.insert(header);
    self
  }

  pub fn is_body_included(&self) -> bool {
    self.is_body_included
  }

  pub fn headers(&self) -> impl Iterator<Item = &HeaderQName> {
    self.headers.iter()
  }

  pub fn is_empty(&self) -> bool {
    !self.is_body_included && self.headers.is_empty()
  }

  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  pub fn make_read_only(&mut self) {
    self.read_only = true;
  }

  pub fn set_body_included(&mut self, included: bool) -> SecurityResult<()> {
    self.ensure_writable()?;
    self.is_body_included = included;
    Ok(())
  }

  pub fn add_header(&mut self, header: HeaderQName) -> SecurityResult<()> {
    self.ensure_writable()?;
    self.headers.insert(header);
    Ok(())
  }

  pub fn union(&mut self, other: &MessagePartSpecification) -> SecurityResult<()> {
    self.ensure_writable()?;
    self.is_body_included |= other.is_body_included;
    self.headers.extend(other.headers.iter().cloned());
    Ok(())
  }

  pub fn is_header_included(&self, name: &str, namespace: &str) -> bool {
    self.headers.iter().any(|h| h.matches(name, namespace))
  }

  /// Ids of the message parts covered by this specification. Parts without
  /// an id are given one from `next_id`.
  pub fn assign_part_ids(
    &self,
    message: &mut Message,
    mut next_id: impl FnMut() -> String,
  ) -> Vec<String> {
    let mut ids = Vec::new();
    for header in message.headers.iter_mut() {
      if self.is_header_included(&header.name, &header.namespace) {
        let id = header.id.get_or_insert_with(&mut next_id).clone();
        ids.push(id);
      }
    }
    if self.is_body_included && !message.body.is_empty() {
      let id = message.body_id.get_or_insert_with(&mut next_id).clone();
      ids.push(id);
    }
    ids
  }

  fn ensure_writable(&self) -> SecurityResult<()> {
    if self.read_only {
      Err(security_error!(
        InvalidOperation,
        "The message part specification is read-only"
      ))
    } else {
      Ok(())
    }
  }
}

/// Parts that apply to every action plus parts for individual actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedMessagePartSpecification {
  channel_parts: MessagePartSpecification,
  action_parts: BTreeMap<String, MessagePartSpecification>,
  #[serde(skip)]
  read_only: bool,
}

impl ScopedMessagePartSpecification {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn channel_parts(&self) -> &MessagePartSpecification {
    &self.channel_parts
  }

  pub fn actions(&self) -> impl Iterator<Item = &str> {
    self.action_parts.keys().map(String::as_str)
  }

  pub fn add_parts(&mut self, parts: &MessagePartSpecification) -> SecurityResult<()> {
    self.ensure_writable()?;
    self.channel_parts.union(parts)
  }

  pub fn add_parts_for_action(
    &mut self,
    parts: &MessagePartSpecification,
    action: impl Into<String>,
  ) -> SecurityResult<()> {
    self.ensure_writable()?;
    self
      .action_parts
      .entry(action.into())
      .or_default()
      .union(parts)
  }

  /// Parts for `action`: the action entry, else the wildcard entry, plus the
  /// channel parts unless excluded. None when nothing is defined for the
  /// action.
  pub fn try_get_parts(
    &self,
    action: &str,
    exclude_channel_scope: bool,
  ) -> Option<MessagePartSpecification> {
    let action_parts = self
      .action_parts
      .get(action)
      .or_else(|| self.action_parts.get(WILDCARD_ACTION));
    let mut result = match (action_parts, exclude_channel_scope) {
      (None, true) => return None,
      (Some(parts), _) => parts.clone(),
      (None, false) => MessagePartSpecification::default(),
    };
    result.read_only = false;
    if !exclude_channel_scope {
      // cannot fail, the clone is writable
      let _ = result.union(&self.channel_parts);
    }
    result.make_read_only();
    Some(result)
  }

  /// Like [`Self::try_get_parts`] but never None.
  pub fn parts_for_action(&self, action: &str) -> MessagePartSpecification {
    self
      .try_get_parts(action, false)
      .unwrap_or_else(|| self.channel_parts.clone())
  }

  pub fn union(&mut self, other: &ScopedMessagePartSpecification) -> SecurityResult<()> {
    self.ensure_writable()?;
    self.channel_parts.union(&other.channel_parts)?;
    for (action, parts) in &other.action_parts {
      self
        .action_parts
        .entry(action.clone())
        .or_default()
        .union(parts)?;
    }
    Ok(())
  }

  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  pub fn make_read_only(&mut self) {
    self.read_only = true;
    self.channel_parts.make_read_only();
    self
      .action_parts
      .values_mut()
      .for_each(MessagePartSpecification::make_read_only);
  }

  fn ensure_writable(&self) -> SecurityResult<()> {
    if self.read_only {
      Err(security_error!(
        InvalidOperation,
        "The scoped message part specification is read-only"
      ))
    } else {
      Ok(())
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtectionLevel {
  None,
  Sign,
  EncryptAndSign,
}

/// Protection declared by a contract for one message of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProtectionDescription {
  pub action: String,
  pub body_protection: ProtectionLevel,
  pub headers: Vec<(HeaderQName, ProtectionLevel)>,
}

/// Request and reply protection of one contract operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProtectionDescription {
  pub request: MessageProtectionDescription,
  /// None for one-way operations
  pub reply: Option<MessageProtectionDescription>,
}

/// Which parts of incoming and outgoing messages must be signed and
/// encrypted, per action. Seen from the endpoint that owns it: the outgoing
/// requirements of a client are the incoming requirements of the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProtectionRequirements {
  pub incoming_signature_parts: ScopedMessagePartSpecification,
  pub incoming_encryption_parts: ScopedMessagePartSpecification,
  pub outgoing_signature_parts: ScopedMessagePartSpecification,
  pub outgoing_encryption_parts: ScopedMessagePartSpecification,
  #[serde(skip)]
  read_only: bool,
}

impl ChannelProtectionRequirements {
  pub fn new() -> Self {
    Self::default()
  }

  /// Requirements of the client side of a contract.
  pub fn from_operations(operations: &[OperationProtectionDescription]) -> SecurityResult<Self> {
    let mut requirements = ChannelProtectionRequirements::new();
    for operation in operations {
      add_message_protection(
        &operation.request,
        &mut requirements.outgoing_signature_parts,
        &mut requirements.outgoing_encryption_parts,
      )?;
      if let Some(reply) = &operation.reply {
        add_message_protection(
          reply,
          &mut requirements.incoming_signature_parts,
          &mut requirements.incoming_encryption_parts,
        )?;
      }
    }
    Ok(requirements)
  }

  /// Every message, any action: body signed and, with `EncryptAndSign`, also
  /// encrypted.
  pub fn for_all_actions(level: ProtectionLevel) -> SecurityResult<Self> {
    let mut requirements = ChannelProtectionRequirements::new();
    if level == ProtectionLevel::None {
      return Ok(requirements);
    }
    let body = MessagePartSpecification::body();
    requirements.incoming_signature_parts.add_parts(&body)?;
    requirements.outgoing_signature_parts.add_parts(&body)?;
    if level == ProtectionLevel::EncryptAndSign {
      requirements.incoming_encryption_parts.add_parts(&body)?;
      requirements.outgoing_encryption_parts.add_parts(&body)?;
    }
    Ok(requirements)
  }

  pub fn add(&mut self, other: &ChannelProtectionRequirements) -> SecurityResult<()> {
    self.ensure_writable()?;
    self
      .incoming_signature_parts
      .union(&other.incoming_signature_parts)?;
    self
      .incoming_encryption_parts
      .union(&other.incoming_encryption_parts)?;
    self
      .outgoing_signature_parts
      .union(&other.outgoing_signature_parts)?;
    self
      .outgoing_encryption_parts
      .union(&other.outgoing_encryption_parts)
  }

  /// The same requirements seen from the other end of the channel.
  pub fn create_inverse(&self) -> Self {
    let mut inverse = ChannelProtectionRequirements {
      incoming_signature_parts: self.outgoing_signature_parts.clone(),
      incoming_encryption_parts: self.outgoing_encryption_parts.clone(),
      outgoing_signature_parts: self.incoming_signature_parts.clone(),
      outgoing_encryption_parts: self.incoming_encryption_parts.clone(),
      read_only: false,
    };
    if self.read_only {
      inverse.make_read_only();
    }
    inverse
  }

  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  pub fn make_read_only(&mut self) {
    self.read_only = true;
    self.incoming_signature_parts.make_read_only();
    self.incoming_encryption_parts.make_read_only();
    self.outgoing_signature_parts.make_read_only();
    self.outgoing_encryption_parts.make_read_only();
  }

  /// Signature and encryption parts for a message in the given direction.
  pub fn parts_for(
    &self,
    action: &str,
    outgoing: bool,
  ) -> (MessagePartSpecification, MessagePartSpecification) {
    if outgoing {
      (
        self.outgoing_signature_parts.parts_for_action(action),
        self.outgoing_encryption_parts.parts_for_action(action),
      )
    } else {
      (
        self.incoming_signature_parts.parts_for_action(action),
        self.incoming_encryption_parts.parts_for_action(action),
      )
    }
  }

  fn ensure_writable(&self) -> SecurityResult<()> {
    if self.read_only {
      Err(security_error!(
        InvalidOperation,
        "The channel protection requirements are read-only"
      ))
    } else {
      Ok(())
    }
  }
}

fn add_message_protection(
  description: &MessageProtectionDescription,
  signature: &mut ScopedMessagePartSpecification,
  encryption: &mut ScopedMessagePartSpecification,
) -> SecurityResult<()> {
  let mut signed = MessagePartSpecification::new(description.body_protection != ProtectionLevel::None);
  let mut encrypted =
    MessagePartSpecification::new(description.body_protection == ProtectionLevel::EncryptAndSign);
  for (header, level) in &description.headers {
    if *level != ProtectionLevel::None {
      signed.add_header(header.clone())?;
    }
    if *level == ProtectionLevel::EncryptAndSign {
      encrypted.add_header(header.clone())?;
    }
  }
  signature.add_parts_for_action(&signed, description.action.clone())?;
  encryption.add_parts_for_action(&encrypted, description.action.clone())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ping_operation() -> OperationProtectionDescription {
    OperationProtectionDescription {
      request: MessageProtectionDescription {
        action: "urn:ping".to_string(),
        body_protection: ProtectionLevel::EncryptAndSign,
        headers: vec![(HeaderQName::new("Route", "urn:app"), ProtectionLevel::Sign)],
      },
      reply: Some(MessageProtectionDescription {
        action: "urn:pingResponse".to_string(),
        body_protection: ProtectionLevel::Sign,
        headers: vec![],
      }),
    }
  }

  #[test]
  fn contract_levels_map_to_parts() {
    let requirements = ChannelProtectionRequirements::from_operations(&[ping_operation()]).unwrap();
    let (signed, encrypted) = requirements.parts_for("urn:ping", true);
    assert!(signed.is_body_included());
    assert!(signed.is_header_included("Route", "urn:app"));
    assert!(encrypted.is_body_included());
    assert!(!encrypted.is_header_included("Route", "urn:app"));

    let (signed, encrypted) = requirements.parts_for("urn:pingResponse", false);
    assert!(signed.is_body_included());
    assert!(encrypted.is_empty());

    // nothing declared for other actions
    let (signed, _) = requirements.parts_for("urn:other", true);
    assert!(signed.is_empty());
  }

  #[test]
  fn inverse_swaps_directions() {
    let requirements = ChannelProtectionRequirements::from_operations(&[ping_operation()]).unwrap();
    let inverse = requirements.create_inverse();
    let (signed, encrypted) = inverse.parts_for("urn:ping", false);
    assert!(signed.is_body_included());
    assert!(encrypted.is_body_included());
  }

  #[test]
  fn wildcard_and_channel_scope() {
    let mut scoped = ScopedMessagePartSpecification::new();
    scoped
      .add_parts(&MessagePartSpecification::new(false).with_header(HeaderQName::new("", "urn:app")))
      .unwrap();
    scoped
      .add_parts_for_action(&MessagePartSpecification::body(), WILDCARD_ACTION)
      .unwrap();
    let parts = scoped.try_get_parts("urn:any", false).unwrap();
    assert!(parts.is_body_included());
    assert!(parts.is_header_included("Anything", "urn:app"));
    assert!(parts.is_read_only());
    assert!(scoped.try_get_parts("urn:any", true).unwrap().is_body_included());
  }

  #[test]
  fn read_only_rejects_changes() {
    let mut requirements = ChannelProtectionRequirements::for_all_actions(ProtectionLevel::Sign).unwrap();
    requirements.make_read_only();
    let err = requirements
      .incoming_signature_parts
      .add_parts(&MessagePartSpecification::body())
      .unwrap_err();
    assert_eq!(err.kind(), crate::security::SecurityErrorKind::InvalidOperation);
    assert!(requirements.add(&ChannelProtectionRequirements::new()).is_err());
  }
}
