use std::collections::HashSet;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    algorithm_suite::SecurityAlgorithmSuite,
    cryptographic::{aes_gcm, signing, symmetric_key::random_nonce},
    message::{
      security_header::{
        DerivedKeyTokenElement, EncryptedData, EncryptedKeyElement, ReferenceListElement,
        SecurityHeader, SecurityHeaderElement, SignatureConfirmationElement, SignatureElement,
        SignatureReference, SignedInfo, TimestampElement, TokenElement,
      },
      HeaderContent, Message, MessageBody,
    },
    protocol::{
      correlation::SignatureConfirmations,
      factory::{SecurityHeaderLayout, SecurityProtocolFactory},
      protection_requirements::MessagePartSpecification,
    },
    standards::{SecurityStandardsManager, DEFAULT_DERIVATION_LABEL},
    time::{add_saturating, utc_now},
    tokens::{
      security_token::DerivedKeySecurityToken, KeyIdentifierClause, SecurityToken,
      SecurityTokenAttachmentMode, SupportingTokenSpecification,
    },
    types::IdGenerator,
    SecurityResult,
  },
  security_error,
};

pub const DERIVATION_NONCE_LENGTH: usize = 16;

/// A token together with the clause the header uses to refer to it.
#[derive(Debug, Clone)]
pub struct KeyedToken {
  pub token: SecurityToken,
  pub key_info: KeyIdentifierClause,
}

/// Builds the `<wsse:Security>` header of an outgoing message: tokens,
/// timestamp, signature confirmations, primary and endorsing signatures and
/// encryption of the required parts.
pub struct SendSecurityHeader<'a> {
  factory: &'a SecurityProtocolFactory,
  ids: IdGenerator,
  token_elements: Vec<SecurityHeaderElement>,
  included_token_ids: HashSet<String>,
  signing: Option<KeyedToken>,
  encryption: Option<KeyedToken>,
  signed_supporting_ids: Vec<String>,
  encrypted_supporting_ids: Vec<String>,
  endorsing: Vec<KeyedToken>,
  signature_confirmations: Option<SignatureConfirmations>,
}

impl<'a> SendSecurityHeader<'a> {
  pub fn new(factory: &'a SecurityProtocolFactory) -> Self {
    SendSecurityHeader {
      factory,
      ids: IdGenerator::new(),
      token_elements: Vec::new(),
      included_token_ids: HashSet::new(),
      signing: None,
      encryption: None,
      signed_supporting_ids: Vec::new(),
      encrypted_supporting_ids: Vec::new(),
      endorsing: Vec::new(),
      signature_confirmations: None,
    }
  }

  pub fn next_id(&mut self) -> String {
    self.ids.next_id()
  }

  /// Puts `token` into the header, once. Returns the element id.
  pub fn include_token(&mut self, token: &SecurityToken) -> SecurityResult<String> {
    let id = token.id().to_string();
    if self.included_token_ids.contains(&id) {
      return Ok(id);
    }
    let element = match token.as_wrapped_key() {
      Some(wrapped) => SecurityHeaderElement::EncryptedKey(EncryptedKeyElement {
        id: id.clone(),
        encryption_method: wrapped.wrap_algorithm().to_string(),
        key_info: wrapped.wrapping_clause().clone(),
        cipher_value: wrapped.wrapped_key().to_vec(),
        reference_list: Vec::new(),
      }),
      None => {
        let wire = token.to_wire_token().ok_or_else(|| {
          security_error!(
            SecurityToken,
            "A {} token cannot be carried in a security header",
            token.kind_name()
          )
        })?;
        SecurityHeaderElement::Token(TokenElement {
          id: id.clone(),
          token: wire,
        })
      }
    };
    self.token_elements.push(element);
    self.included_token_ids.insert(id.clone());
    Ok(id)
  }

  pub fn set_signing_token(
    &mut self,
    token: SecurityToken,
    key_info: KeyIdentifierClause,
    derive: bool,
  ) -> SecurityResult<()> {
    let length = self
      .factory
      .algorithm_suite()
      .default_signature_key_derivation_length();
    self.signing = Some(self.keyed(token, key_info, derive, length)?);
    Ok(())
  }

  pub fn set_encryption_token(
    &mut self,
    token: SecurityToken,
    key_info: KeyIdentifierClause,
    derive: bool,
  ) -> SecurityResult<()> {
    let length = self
      .factory
      .algorithm_suite()
      .default_encryption_key_derivation_length();
    self.encryption = Some(self.keyed(token, key_info, derive, length)?);
    Ok(())
  }

  pub fn has_signing_token(&self) -> bool {
    self.signing.is_some()
  }

  pub fn has_encryption_token(&self) -> bool {
    self.encryption.is_some()
  }

  pub fn set_signature_confirmations(&mut self, confirmations: SignatureConfirmations) {
    self.signature_confirmations = Some(confirmations);
  }

  /// Adds a supporting token; the attachment mode decides whether it is
  /// signed, encrypted or signs the primary signature itself.
  pub fn add_supporting_token(
    &mut self,
    token: SecurityToken,
    specification: &SupportingTokenSpecification,
  ) -> SecurityResult<()> {
    let element_id = self.include_token(&token)?;
    if specification.mode.is_signed() {
      self.signed_supporting_ids.push(element_id.clone());
    }
    if specification.mode == SecurityTokenAttachmentMode::SignedEncrypted {
      self.encrypted_supporting_ids.push(element_id.clone());
    }
    if specification.mode.is_endorsing() {
      let parameters = &specification.parameters;
      let derive = parameters.require_derived_keys
        && !parameters.has_asymmetric_key()
        && parameters.supports_derived_keys();
      let length = self
        .factory
        .algorithm_suite()
        .default_signature_key_derivation_length();
      let keyed = self.keyed(token, KeyIdentifierClause::local_id(element_id), derive, length)?;
      self.endorsing.push(keyed);
    }
    Ok(())
  }

  fn keyed(
    &mut self,
    token: SecurityToken,
    key_info: KeyIdentifierClause,
    derive: bool,
    length_bits: usize,
  ) -> SecurityResult<KeyedToken> {
    if !derive {
      return Ok(KeyedToken { token, key_info });
    }
    let id = self.ids.next_id();
    let nonce = random_nonce(DERIVATION_NONCE_LENGTH);
    let length = length_bits / 8;
    let derived = DerivedKeySecurityToken::derive(
      id.clone(),
      token,
      DEFAULT_DERIVATION_LABEL,
      nonce.clone(),
      length,
      0,
    )?;
    self
      .token_elements
      .push(SecurityHeaderElement::DerivedKeyToken(DerivedKeyTokenElement {
        id: id.clone(),
        base: key_info,
        label: None,
        nonce,
        length: length as u32,
        offset: 0,
      }));
    Ok(KeyedToken {
      token: derived.into(),
      key_info: KeyIdentifierClause::local_id(id),
    })
  }

  /// Secures `message`. Returns the values of every signature written, the
  /// primary signature first.
  pub fn apply(
    mut self,
    message: &mut Message,
    signature_parts: &MessagePartSpecification,
    encryption_parts: &MessagePartSpecification,
  ) -> SecurityResult<Vec<Vec<u8>>> {
    if message.security_header.is_some() {
      return Err(security_error!(
        InvalidOperation,
        "The message already carries a security header"
      ));
    }
    let suite = self.factory.algorithm_suite();
    let standards = *self.factory.standards();
    let body_encrypted = self.encryption.is_some()
      && encryption_parts.is_body_included()
      && !message.body.is_empty();
    let order = self.factory.protection_order().effective(body_encrypted);

    let signed_part_ids = if self.signing.is_some() {
      signature_parts.assign_part_ids(message, || self.ids.next_id())
    } else {
      Vec::new()
    };
    let encrypted_part_ids = if self.encryption.is_some() {
      encryption_parts.assign_part_ids(message, || self.ids.next_id())
    } else {
      Vec::new()
    };

    let timestamp = self.factory.include_timestamp().then(|| {
      let now = utc_now();
      TimestampElement {
        id: self.ids.next_id(),
        created: now,
        expires: Some(add_saturating(now, self.factory.timestamp_validity_duration())),
      }
    });
    let confirmations: Vec<SecurityHeaderElement> = match &self.signature_confirmations {
      Some(c) if c.is_empty() => vec![SecurityHeaderElement::SignatureConfirmation(
        SignatureConfirmationElement {
          id: self.ids.next_id(),
          value: None,
        },
      )],
      Some(c) => c
        .values()
        .iter()
        .map(|value| {
          SecurityHeaderElement::SignatureConfirmation(SignatureConfirmationElement {
            id: self.ids.next_id(),
            value: value.clone(),
          })
        })
        .collect(),
      None => Vec::new(),
    };

    let mut reference_list = Vec::new();
    if !order.is_sign_before_encrypt() {
      self.encrypt_message_parts(message, &encrypted_part_ids, &standards, &mut reference_list)?;
    }

    let mut signature = None;
    if let Some(signing) = &self.signing {
      let mut references = Vec::new();
      if let Some(ts) = &timestamp {
        let bytes = SecurityHeaderElement::Timestamp(ts.clone()).canonical_bytes(&standards);
        references.push(reference(suite, &ts.id, &bytes));
      }
      for confirmation in &confirmations {
        if let Some(id) = confirmation.id() {
          references.push(reference(suite, id, &confirmation.canonical_bytes(&standards)));
        }
      }
      for id in &self.signed_supporting_ids {
        let element = self
          .token_elements
          .iter()
          .find(|e| e.id() == Some(id.as_str()))
          .ok_or_else(|| security_error!(Internal, "Supporting token {id} is not in the header"))?;
        references.push(reference(suite, id, &element.canonical_bytes(&standards)));
      }
      for id in &signed_part_ids {
        let bytes = message
          .part_canonical_bytes(id, &standards)
          .ok_or_else(|| security_error!(Internal, "Message part {id} disappeared"))?;
        references.push(reference(suite, id, &bytes));
      }
      if !references.is_empty() {
        signature = Some(create_signature(self.ids.next_id(), suite, signing, references)?);
      }
    }

    // endorsing tokens sign the primary signature, or the timestamp when
    // there is none
    let endorsed = match (&signature, &timestamp) {
      (Some(sig), _) => Some((
        sig.id.clone(),
        SecurityHeaderElement::Signature(sig.clone()).canonical_bytes(&standards),
      )),
      (None, Some(ts)) => Some((
        ts.id.clone(),
        SecurityHeaderElement::Timestamp(ts.clone()).canonical_bytes(&standards),
      )),
      (None, None) => None,
    };
    let mut endorsing_signatures = Vec::new();
    for keyed in &self.endorsing {
      let (id, bytes) = endorsed.as_ref().ok_or_else(|| {
        security_error!(
          InvalidOperation,
          "An endorsing supporting token needs a signature or timestamp to sign"
        )
      })?;
      let references = vec![reference(suite, id, bytes)];
      endorsing_signatures.push(create_signature(self.ids.next_id(), suite, keyed, references)?);
    }

    if order.is_sign_before_encrypt() {
      self.encrypt_message_parts(message, &encrypted_part_ids, &standards, &mut reference_list)?;
    }

    let signature_values: Vec<Vec<u8>> = signature
      .iter()
      .chain(endorsing_signatures.iter())
      .map(|s| s.signature_value.clone())
      .collect();

    let mut signature_element = signature.map(SecurityHeaderElement::Signature);
    if order.encrypts_signature() {
      if let Some(element) = signature_element.take() {
        signature_element = Some(self.encrypt_element(&element, &mut reference_list)?);
      }
    }
    for id in self.encrypted_supporting_ids.clone() {
      if let Some(position) = self
        .token_elements
        .iter()
        .position(|e| e.id() == Some(id.as_str()))
      {
        let element = self.token_elements[position].clone();
        self.token_elements[position] = self.encrypt_element(&element, &mut reference_list)?;
      }
    }

    let layout = self.factory.layout();
    let mut header = SecurityHeader::new();
    let mut timestamp = timestamp.map(SecurityHeaderElement::Timestamp);
    if layout == SecurityHeaderLayout::LaxTimestampFirst {
      header.elements.extend(timestamp.take());
    }
    header.elements.append(&mut self.token_elements);
    if matches!(layout, SecurityHeaderLayout::Strict | SecurityHeaderLayout::Lax) {
      header.elements.extend(timestamp.take());
    }
    header.elements.extend(confirmations);
    let reference_list = (!reference_list.is_empty()).then(|| {
      SecurityHeaderElement::ReferenceList(ReferenceListElement {
        id: None,
        data_references: reference_list,
      })
    });
    if order.is_sign_before_encrypt() {
      header.elements.extend(signature_element);
      header.elements.extend(reference_list);
    } else {
      header.elements.extend(reference_list);
      header.elements.extend(signature_element);
    }
    header
      .elements
      .extend(endorsing_signatures.into_iter().map(SecurityHeaderElement::Signature));
    header.elements.extend(timestamp.take());

    trace!(
      "Secured message {} with {} security header elements",
      message.action,
      header.len()
    );
    message.security_header = Some(header);
    Ok(signature_values)
  }

  fn encrypt_message_parts(
    &mut self,
    message: &mut Message,
    part_ids: &[String],
    standards: &SecurityStandardsManager,
    reference_list: &mut Vec<String>,
  ) -> SecurityResult<()> {
    let Some(encryption) = &self.encryption else {
      return Ok(());
    };
    let suite = self.factory.algorithm_suite();
    for id in part_ids {
      let data_id = self.ids.next_id();
      if message.body_id.as_deref() == Some(id.as_str()) {
        let plaintext = message.body.content_bytes(standards);
        message.body = MessageBody::Encrypted(encrypt_data(data_id.clone(), suite, encryption, &plaintext)?);
      } else if let Some(header) = message.header_by_id_mut(id) {
        let HeaderContent::Plain(plaintext) = &header.content else {
          continue;
        };
        let data = encrypt_data(data_id.clone(), suite, encryption, plaintext)?;
        header.content = HeaderContent::Encrypted(data);
      } else {
        return Err(security_error!(Internal, "Message part {id} disappeared"));
      }
      reference_list.push(data_id);
    }
    Ok(())
  }

  fn encrypt_element(
    &mut self,
    element: &SecurityHeaderElement,
    reference_list: &mut Vec<String>,
  ) -> SecurityResult<SecurityHeaderElement> {
    let encryption = self.encryption.as_ref().ok_or_else(|| {
      security_error!(
        InvalidOperation,
        "No encryption token to encrypt the {} element with",
        element.kind_name()
      )
    })?;
    let data_id = self.ids.next_id();
    let data = encrypt_data(
      data_id.clone(),
      self.factory.algorithm_suite(),
      encryption,
      &element.to_binary()?,
    )?;
    reference_list.push(data_id);
    Ok(SecurityHeaderElement::EncryptedData(data))
  }
}

fn reference(suite: SecurityAlgorithmSuite, id: &str, bytes: &[u8]) -> SignatureReference {
  SignatureReference {
    uri: id.to_string(),
    digest_method: suite.default_digest_algorithm().to_string(),
    digest_value: suite.digest(bytes),
  }
}

fn create_signature(
  id: String,
  suite: SecurityAlgorithmSuite,
  keyed: &KeyedToken,
  references: Vec<SignatureReference>,
) -> SecurityResult<SignatureElement> {
  let signature_method = if keyed.token.has_asymmetric_key() {
    suite.default_asymmetric_signature_algorithm()
  } else {
    suite.default_symmetric_signature_algorithm()
  };
  let signed_info = SignedInfo {
    canonicalization_method: suite.default_canonicalization_algorithm().to_string(),
    signature_method: signature_method.to_string(),
    references,
  };
  let signature_value = signing::sign(
    signature_method,
    keyed.token.signing_key()?,
    &signed_info.canonical_bytes(),
  )?;
  Ok(SignatureElement {
    id,
    signed_info,
    signature_value,
    key_info: keyed.key_info.clone(),
  })
}

fn encrypt_data(
  id: String,
  suite: SecurityAlgorithmSuite,
  encryption: &KeyedToken,
  plaintext: &[u8],
) -> SecurityResult<EncryptedData> {
  Ok(EncryptedData {
    id,
    encryption_method: suite.default_encryption_algorithm().to_string(),
    key_info: Some(encryption.key_info.clone()),
    cipher_value: aes_gcm::encrypt(encryption.token.encryption_key()?, plaintext)?,
  })
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, Utc};

  use super::*;
  use crate::security::{
    cryptographic::SymmetricKey,
    protocol::factory::{MessageProtectionOrder, SecurityProtocolBinding, SecurityProtocolFactoryBuilder},
    tokens::{SecurityContextSecurityToken, SecurityTokenParameters, SecurityTokenReferenceStyle},
    types::UniqueId,
  };

  fn factory(order: MessageProtectionOrder, layout: SecurityHeaderLayout) -> std::sync::Arc<SecurityProtocolFactory> {
    SecurityProtocolFactoryBuilder::new(SecurityProtocolBinding::Symmetric {
      protection_token_parameters: SecurityTokenParameters::secure_conversation(),
    })
    .protection_order(order)
    .layout(layout)
    .build()
    .unwrap()
  }

  fn sct() -> SecurityToken {
    let now = Utc::now();
    SecurityContextSecurityToken::new(
      UniqueId::new(),
      "_sct",
      SymmetricKey::generate_random(32),
      now,
      now + Duration::hours(1),
      vec![],
    )
    .into()
  }

  fn message() -> Message {
    Message::new(
      "urn:echo",
      MessageBody::Raw(bytes::Bytes::from_static(b"<echo>hi</echo>")),
    )
  }

  fn kinds(message: &Message) -> Vec<&'static str> {
    message
      .security_header
      .as_ref()
      .unwrap()
      .elements
      .iter()
      .map(|e| e.kind_name())
      .collect()
  }

  fn secure(factory: &SecurityProtocolFactory, derive: bool) -> (Message, Vec<Vec<u8>>) {
    let token = sct();
    let clause = token
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap();
    let mut header = SendSecurityHeader::new(factory);
    header.include_token(&token).unwrap();
    header.set_signing_token(token.clone(), clause.clone(), derive).unwrap();
    header.set_encryption_token(token, clause, derive).unwrap();
    let mut message = message();
    let values = header
      .apply(
        &mut message,
        &MessagePartSpecification::body(),
        &MessagePartSpecification::body(),
      )
      .unwrap();
    (message, values)
  }

  #[test]
  fn sign_before_encrypt_layout() {
    let factory = factory(MessageProtectionOrder::SignBeforeEncrypt, SecurityHeaderLayout::Strict);
    let (message, values) = secure(&factory, false);
    assert_eq!(
      kinds(&message),
      vec!["Token", "Timestamp", "Signature", "ReferenceList"]
    );
    assert_eq!(values.len(), 1);
    assert!(message.body.is_encrypted());
    assert!(message.body_id.is_some());
  }

  #[test]
  fn encrypt_before_sign_puts_reference_list_first() {
    let factory = factory(MessageProtectionOrder::EncryptBeforeSign, SecurityHeaderLayout::LaxTimestampLast);
    let (message, _) = secure(&factory, true);
    assert_eq!(
      kinds(&message),
      vec![
        "Token",
        "DerivedKeyToken",
        "DerivedKeyToken",
        "ReferenceList",
        "Signature",
        "Timestamp"
      ]
    );
  }

  #[test]
  fn encrypted_signature_replaces_the_signature_element() {
    let factory = factory(
      MessageProtectionOrder::SignBeforeEncryptAndEncryptSignature,
      SecurityHeaderLayout::LaxTimestampFirst,
    );
    let (message, _) = secure(&factory, false);
    assert_eq!(
      kinds(&message),
      vec!["Timestamp", "Token", "EncryptedData", "ReferenceList"]
    );
    let header = message.security_header.as_ref().unwrap();
    let SecurityHeaderElement::ReferenceList(list) = &header.elements[3] else {
      panic!("expected a reference list");
    };
    assert_eq!(list.data_references.len(), 2);
  }

  #[test]
  fn unencrypted_body_keeps_the_signature_in_clear() {
    let factory = factory(
      MessageProtectionOrder::SignBeforeEncryptAndEncryptSignature,
      SecurityHeaderLayout::Strict,
    );
    let token = sct();
    let clause = KeyIdentifierClause::local_id("_sct");
    let mut header = SendSecurityHeader::new(&factory);
    header.include_token(&token).unwrap();
    header.set_signing_token(token.clone(), clause.clone(), false).unwrap();
    header.set_encryption_token(token, clause, false).unwrap();
    let mut message = message();
    header
      .apply(
        &mut message,
        &MessagePartSpecification::body(),
        &MessagePartSpecification::default(),
      )
      .unwrap();
    assert_eq!(kinds(&message), vec!["Token", "Timestamp", "Signature"]);
  }

  #[test]
  fn securing_twice_is_refused() {
    let factory = factory(MessageProtectionOrder::SignBeforeEncrypt, SecurityHeaderLayout::Strict);
    let (mut message, _) = secure(&factory, false);
    let header = SendSecurityHeader::new(&factory);
    assert!(header
      .apply(
        &mut message,
        &MessagePartSpecification::body(),
        &MessagePartSpecification::default()
      )
      .is_err());
  }
}
