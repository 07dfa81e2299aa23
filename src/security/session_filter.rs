// Pre-dispatch routing of incoming messages to secure sessions.
use std::collections::HashSet;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    message::{
      security_header::{SecurityHeaderElement, WireToken},
      Message,
    },
    standards::SecurityStandardsManager,
    types::UniqueId,
    SecurityError, SecurityErrorKind, SecurityResult,
  },
  security_error,
};

type MessagePredicate = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// Matches messages that belong to the secure session identified by one
/// context id, without verifying their security header.
pub struct SecuritySessionFilter {
  context_id: UniqueId,
  standards: SecurityStandardsManager,
  excluded_actions: HashSet<String>,
  inner_filter: Option<MessagePredicate>,
}

impl SecuritySessionFilter {
  pub fn new(context_id: UniqueId, standards: SecurityStandardsManager) -> Self {
    SecuritySessionFilter {
      context_id,
      standards,
      excluded_actions: HashSet::new(),
      inner_filter: None,
    }
  }

  /// Messages with this action never match, e.g. the session's own
  /// negotiation traffic.
  pub fn exclude_action(mut self, action: impl Into<String>) -> Self {
    self.excluded_actions.insert(action.into());
    self
  }

  /// An additional condition a message must satisfy.
  pub fn with_inner_filter(mut self, filter: MessagePredicate) -> Self {
    self.inner_filter = Some(filter);
    self
  }

  pub fn context_id(&self) -> &UniqueId {
    &self.context_id
  }

  /// The probe result is cached on the message, so evaluating many filters
  /// against one message parses its security header only once.
  ///
  /// Messages whose header cannot be probed simply do not match. Only
  /// failures unrelated to the message content, like a poisoned lock, are
  /// returned.
  pub fn matches(&self, message: &mut Message) -> SecurityResult<bool> {
    if self.excluded_actions.contains(&message.action) {
      return Ok(false);
    }
    if let Some(filter) = &self.inner_filter {
      if !filter(message) {
        return Ok(false);
      }
    }
    if message.properties.session_filter_ids.is_none() {
      match probe_context_ids(message, &self.standards) {
        Ok(ids) => message.properties.session_filter_ids = Some(ids),
        Err(e) if is_probe_failure(&e) => {
          debug!("Security header probe of {} failed: {e}", message.action);
          message.properties.session_filter_ids = Some(Vec::new());
        }
        Err(e) => return Err(e),
      }
    }
    Ok(
      message
        .properties
        .session_filter_ids
        .as_ref()
        .map_or(false, |ids| ids.contains(&self.context_id)),
    )
  }
}

fn is_probe_failure(e: &SecurityError) -> bool {
  matches!(
    e.kind(),
    SecurityErrorKind::Xml
      | SecurityErrorKind::Format
      | SecurityErrorKind::SecurityToken
      | SecurityErrorKind::MessageSecurity
      | SecurityErrorKind::Protocol
      | SecurityErrorKind::InvalidOperation
      | SecurityErrorKind::Argument
  )
}

/// Context ids named anywhere in the security header: session tokens and
/// the key identifiers of derived keys, wrapped keys, signatures and
/// encrypted elements. Encrypted content is not looked into.
pub fn probe_context_ids(
  message: &Message,
  standards: &SecurityStandardsManager,
) -> SecurityResult<Vec<UniqueId>> {
  let header = match &message.security_header {
    Some(header) => header,
    None => return Ok(Vec::new()),
  };
  let namespace = standards.security_version().namespace();
  if message
    .headers
    .iter()
    .any(|h| h.name == "Security" && h.namespace == namespace)
  {
    return Err(security_error!(
      MessageSecurity,
      "The message carries more than one security header"
    ));
  }

  let mut seen_ids = HashSet::new();
  let mut context_ids = Vec::new();
  let mut add = |id: Option<&UniqueId>| {
    if let Some(id) = id {
      if !context_ids.contains(id) {
        context_ids.push(id.clone());
      }
    }
  };
  for element in &header.elements {
    if let Some(id) = element.id() {
      if !seen_ids.insert(id) {
        return Err(security_error!(
          Xml,
          "Duplicate id {id} in the security header"
        ));
      }
    }
    match element {
      SecurityHeaderElement::Token(token) => {
        if let WireToken::SecurityContext { context_id, .. } = &token.token {
          add(Some(context_id));
        }
      }
      SecurityHeaderElement::DerivedKeyToken(dk) => add(dk.base.security_context_id()),
      SecurityHeaderElement::EncryptedKey(ek) => add(ek.key_info.security_context_id()),
      SecurityHeaderElement::Signature(sig) => add(sig.key_info.security_context_id()),
      SecurityHeaderElement::SecurityTokenReference(reference) => {
        add(reference.clause.security_context_id())
      }
      SecurityHeaderElement::EncryptedData(data) => {
        add(data.key_info.as_ref().and_then(|k| k.security_context_id()))
      }
      SecurityHeaderElement::Timestamp(_)
      | SecurityHeaderElement::SignatureConfirmation(_)
      | SecurityHeaderElement::ReferenceList(_) => {}
    }
  }
  Ok(context_ids)
}

/// Filters paired with the value each one dispatches to. The first matching
/// filter wins.
pub struct SecuritySessionFilterTable<T> {
  entries: Vec<(SecuritySessionFilter, T)>,
}

impl<T> Default for SecuritySessionFilterTable<T> {
  fn default() -> Self {
    SecuritySessionFilterTable {
      entries: Vec::new(),
    }
  }
}

impl<T> SecuritySessionFilterTable<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, filter: SecuritySessionFilter, value: T) {
    self.entries.push((filter, value));
  }

  /// Drops the filter of a closed session.
  pub fn remove(&mut self, context_id: &UniqueId) -> Option<T> {
    let position = self
      .entries
      .iter()
      .position(|(f, _)| f.context_id() == context_id)?;
    Some(self.entries.remove(position).1)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn lookup(&self, message: &mut Message) -> SecurityResult<Option<&T>> {
    for (filter, value) in &self.entries {
      if filter.matches(message)? {
        return Ok(Some(value));
      }
    }
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use bytes::Bytes;

  use super::*;
  use crate::security::{
    message::{
      security_header::{DerivedKeyTokenElement, SecurityHeader, TimestampElement, TokenElement},
      MessageBody, MessageHeader,
    },
    tokens::KeyIdentifierClause,
  };

  fn message_with(elements: Vec<SecurityHeaderElement>) -> Message {
    let mut message = Message::new("urn:echo", MessageBody::Empty);
    let mut header = SecurityHeader::new();
    header.elements = elements;
    message.security_header = Some(header);
    message
  }

  fn token_element(id: &str, context_id: &UniqueId) -> SecurityHeaderElement {
    SecurityHeaderElement::Token(TokenElement {
      id: id.to_string(),
      token: WireToken::SecurityContext {
        context_id: context_id.clone(),
        generation: None,
      },
    })
  }

  #[test]
  fn matches_sessions_named_in_the_header() {
    let ours = UniqueId::new();
    let theirs = UniqueId::new();
    let filter = SecuritySessionFilter::new(ours.clone(), SecurityStandardsManager::default());
    let other = SecuritySessionFilter::new(theirs.clone(), SecurityStandardsManager::default());

    let mut message = message_with(vec![SecurityHeaderElement::DerivedKeyToken(
      DerivedKeyTokenElement {
        id: "_dk".to_string(),
        base: KeyIdentifierClause::security_context(ours.clone(), None),
        label: None,
        nonce: vec![1; 16],
        length: 32,
        offset: 0,
      },
    )]);
    assert!(filter.matches(&mut message).unwrap());
    assert!(!other.matches(&mut message).unwrap());
    assert_eq!(
      message.properties.session_filter_ids,
      Some(vec![ours.clone()])
    );

    // the cached result is used from now on
    message.security_header = Some(SecurityHeader::new());
    assert!(filter.matches(&mut message).unwrap());
  }

  #[test]
  fn excluded_actions_and_inner_filters() {
    let id = UniqueId::new();
    let filter = SecuritySessionFilter::new(id.clone(), SecurityStandardsManager::default())
      .exclude_action("urn:negotiate")
      .with_inner_filter(Box::new(|m| m.to.is_none()));
    let mut message = message_with(vec![token_element("_sct", &id)]);
    assert!(filter.matches(&mut message).unwrap());
    message.action = "urn:negotiate".to_string();
    assert!(!filter.matches(&mut message).unwrap());
    message.action = "urn:echo".to_string();
    message.to = Some("urn:elsewhere".to_string());
    assert!(!filter.matches(&mut message).unwrap());
  }

  #[test]
  fn malformed_headers_do_not_match() {
    let id = UniqueId::new();
    let filter = SecuritySessionFilter::new(id.clone(), SecurityStandardsManager::default());
    let mut duplicate = message_with(vec![
      token_element("_a", &id),
      SecurityHeaderElement::Timestamp(TimestampElement {
        id: "_a".to_string(),
        created: chrono::Utc::now(),
        expires: None,
      }),
    ]);
    assert!(probe_context_ids(&duplicate, &SecurityStandardsManager::default()).is_err());
    assert!(!filter.matches(&mut duplicate).unwrap());

    let mut twice = message_with(vec![token_element("_a", &id)]).with_header(MessageHeader::new(
      "Security",
      SecurityStandardsManager::default()
        .security_version()
        .namespace(),
      Bytes::new(),
    ));
    assert!(!filter.matches(&mut twice).unwrap());
  }

  #[test]
  fn table_dispatches_to_the_first_match() {
    let first = UniqueId::new();
    let second = UniqueId::new();
    let mut table = SecuritySessionFilterTable::new();
    table.add(
      SecuritySessionFilter::new(first.clone(), SecurityStandardsManager::default()),
      1,
    );
    table.add(
      SecuritySessionFilter::new(second.clone(), SecurityStandardsManager::default()),
      2,
    );
    let mut message = message_with(vec![token_element("_sct", &second)]);
    assert_eq!(table.lookup(&mut message).unwrap(), Some(&2));
    assert_eq!(table.remove(&second), Some(2));
    assert_eq!(table.lookup(&mut message).unwrap(), None);
    assert_eq!(table.len(), 1);
  }
}
