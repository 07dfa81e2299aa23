use std::collections::HashSet;

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    algorithm_suite::compute_digest,
    cryptographic::{aes_gcm, digest::constant_time_equals, signing},
    message::{
      security_header::{EncryptedData, SecurityHeader, SecurityHeaderElement, SignatureElement, TimestampElement},
      HeaderContent, Message, MessageBody,
    },
    protocol::{
      correlation::SignatureConfirmations,
      element_manager::{
        ReceiveSecurityHeaderBindingModes, ReceiveSecurityHeaderElementCategory,
        ReceiveSecurityHeaderElementManager,
      },
      factory::{SecurityHeaderLayout, SecurityProtocolFactory, SupportingTokenAuthenticatorSpecification},
      protection_requirements::MessagePartSpecification,
      token_resolver::SecurityHeaderTokenResolver,
      ReceivedSupportingToken, SecurityTokenSpecification,
    },
    standards::{FaultSubcode, SecurityStandardsManager},
    time::{add_saturating, sub_saturating, utc_now},
    tokens::{SecurityToken, SecurityTokenAttachmentMode, SecurityTokenParameters},
    SecurityResult,
  },
  security_error, security_log,
};

/// Processes the `<wsse:Security>` header of an incoming message.
///
/// Processing runs in two phases. The first walks the header in document
/// order (tokens first under the lax layouts): tokens are registered with
/// the resolver and encrypted header elements are decrypted in place. The
/// second decrypts message parts and verifies signatures, in the order the
/// sender applied them. Afterwards the timestamp, replay cache, supporting
/// tokens and required protection of every part are checked.
pub struct ReceiveSecurityHeader<'a> {
  factory: &'a SecurityProtocolFactory,
  resolver: SecurityHeaderTokenResolver,
  elements: ReceiveSecurityHeaderElementManager,
  transport_protected: bool,
  signature_parts: MessagePartSpecification,
  encryption_parts: MessagePartSpecification,
  supporting_authenticators: Vec<SupportingTokenAuthenticatorSpecification>,
  expected_signature_confirmations: Option<SignatureConfirmations>,

  signature_indices: Vec<usize>,
  reference_list_index: Option<usize>,
  data_references: Vec<String>,
  decrypted_references: HashSet<String>,

  timestamp: Option<TimestampElement>,
  received_confirmations: SignatureConfirmations,
  confirmations_present: bool,
  signature_token: Option<SecurityToken>,
  encryption_token: Option<SecurityToken>,
  endorsing_tokens: Vec<SecurityToken>,
  signature_values: Vec<Vec<u8>>,
  supporting_tokens: Vec<ReceivedSupportingToken>,
}

impl<'a> ReceiveSecurityHeader<'a> {
  /// With `transport_protected`, the transport signs and encrypts the message
  /// and the header carries no primary signature.
  pub fn new(factory: &'a SecurityProtocolFactory, action: &str, transport_protected: bool) -> Self {
    let (signature_parts, encryption_parts) = factory.message_parts(action, false);
    let mut resolver =
      SecurityHeaderTokenResolver::new(factory.algorithm_suite(), factory.max_derived_keys(action));
    for out_of_band in factory.out_of_band_resolvers() {
      resolver.add_out_of_band_resolver(out_of_band.clone());
    }
    ReceiveSecurityHeader {
      factory,
      resolver,
      elements: ReceiveSecurityHeaderElementManager::new(),
      transport_protected,
      signature_parts,
      encryption_parts,
      supporting_authenticators: factory
        .supporting_token_authenticators(action)
        .into_iter()
        .cloned()
        .collect(),
      expected_signature_confirmations: None,
      signature_indices: Vec::new(),
      reference_list_index: None,
      data_references: Vec::new(),
      decrypted_references: HashSet::new(),
      timestamp: None,
      received_confirmations: SignatureConfirmations::new(),
      confirmations_present: false,
      signature_token: None,
      encryption_token: None,
      endorsing_tokens: Vec::new(),
      signature_values: Vec::new(),
      supporting_tokens: Vec::new(),
    }
  }

  pub fn resolver_mut(&mut self) -> &mut SecurityHeaderTokenResolver {
    &mut self.resolver
  }

  pub fn set_expected_signature_confirmations(&mut self, confirmations: SignatureConfirmations) {
    self.expected_signature_confirmations = Some(confirmations);
  }

  /// Root of the token that made the primary signature is `root_token()`
  /// of this one.
  pub fn signature_token(&self) -> Option<&SecurityToken> {
    self.signature_token.as_ref()
  }

  pub fn encryption_token(&self) -> Option<&SecurityToken> {
    self.encryption_token.as_ref()
  }

  pub fn endorsing_tokens(&self) -> &[SecurityToken] {
    &self.endorsing_tokens
  }

  pub fn timestamp(&self) -> Option<&TimestampElement> {
    self.timestamp.as_ref()
  }

  pub fn element_manager(&self) -> &ReceiveSecurityHeaderElementManager {
    &self.elements
  }

  /// Confirmations a reply to this message must carry: every signature value
  /// seen, or a single empty confirmation for an unsigned message.
  pub fn signature_confirmations_to_send(&self) -> SignatureConfirmations {
    let mut confirmations = SignatureConfirmations::new();
    for value in &self.signature_values {
      confirmations.add(Some(value.clone()));
    }
    confirmations
  }

  pub fn take_supporting_tokens(&mut self) -> Vec<ReceivedSupportingToken> {
    std::mem::take(&mut self.supporting_tokens)
  }

  /// Rejects a message protected with the base key when the parameters call
  /// for derived keys.
  pub fn enforce_derived_keys(&self, parameters: &SecurityTokenParameters) -> SecurityResult<()> {
    if !parameters.require_derived_keys || parameters.has_asymmetric_key() {
      return Ok(());
    }
    for token in self.signature_token.iter().chain(self.encryption_token.iter()) {
      if token.as_derived_key().is_none() {
        return Err(
          security_error!(
            MessageSecurity,
            "The message is protected with a {} key where a derived key is required",
            token.kind_name()
          )
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
    }
    Ok(())
  }

  pub fn process(&mut self, message: &mut Message) -> SecurityResult<()> {
    let mut header = message.security_header.take().ok_or_else(|| {
      security_error!(MessageSecurity, "The message has no security header")
        .with_fault_subcode(FaultSubcode::InvalidSecurity)
    })?;
    let result = self.process_header(message, &mut header);
    message.security_header = Some(header);
    if let Err(e) = &result {
      security_log!("Incoming {} rejected: {e}", message.action);
    }
    result
  }

  fn process_header(&mut self, message: &mut Message, header: &mut SecurityHeader) -> SecurityResult<()> {
    self.elements.register_message_ids(message)?;
    self.check_layout(header)?;
    for element in &header.elements {
      self.elements.append_element(element)?;
    }

    let lax = self.factory.layout() != SecurityHeaderLayout::Strict;
    if lax {
      for index in 0..header.elements.len() {
        if is_token_element(&header.elements[index]) {
          self.process_element(index, header)?;
        }
      }
    }
    for index in 0..header.elements.len() {
      if lax && is_token_element(&header.elements[index]) {
        continue;
      }
      self.process_element(index, header)?;
    }

    let primary_index = if self.transport_protected {
      None
    } else {
      self.signature_indices.first().copied()
    };
    let expected_order = self
      .factory
      .protection_order()
      .effective(message.body.is_encrypted());
    if let (Some(signature), Some(reference_list)) = (primary_index, self.reference_list_index) {
      if (signature < reference_list) != expected_order.is_sign_before_encrypt() {
        return Err(
          security_error!(
            MessageSecurity,
            "The message was not protected in the {expected_order:?} order"
          )
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
    }
    if expected_order.encrypts_signature() {
      if let Some(signature) = primary_index {
        if !self.elements.entries()[signature].encrypted {
          return Err(
            security_error!(MessageSecurity, "The primary signature must be encrypted")
              .with_fault_subcode(FaultSubcode::InvalidSecurity),
          );
        }
      }
    }

    if expected_order.is_sign_before_encrypt() {
      self.decrypt_parts(message)?;
      self.verify_signatures(message, header, primary_index)?;
    } else {
      self.verify_signatures(message, header, primary_index)?;
      self.decrypt_parts(message)?;
    }

    self.check_timestamp()?;
    self.detect_replay()?;
    self.match_supporting_tokens()?;
    if !self.transport_protected {
      if let Some(index) = self.signature_token.as_ref().and_then(|t| self.elements.find_token_entry(t)) {
        self
          .elements
          .set_binding_mode(index, ReceiveSecurityHeaderBindingModes::Primary, None);
      }
      self
        .elements
        .ensure_all_required_security_header_targets_were_protected()?;
      self.ensure_parts_protected(message)?;
    }
    self.check_signature_confirmations()
  }

  fn check_layout(&self, header: &SecurityHeader) -> SecurityResult<()> {
    let positions: Vec<usize> = header
      .elements
      .iter()
      .enumerate()
      .filter(|(_, e)| matches!(e, SecurityHeaderElement::Timestamp(_)))
      .map(|(i, _)| i)
      .collect();
    if positions.len() > 1 {
      return Err(
        security_error!(MessageSecurity, "The security header has more than one timestamp")
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    let misplaced = match (self.factory.layout(), positions.first()) {
      (SecurityHeaderLayout::LaxTimestampFirst, Some(&p)) => p != 0,
      (SecurityHeaderLayout::LaxTimestampLast, Some(&p)) => p + 1 != header.elements.len(),
      _ => false,
    };
    if misplaced {
      return Err(
        security_error!(
          MessageSecurity,
          "The timestamp is misplaced for the {:?} layout",
          self.factory.layout()
        )
        .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    Ok(())
  }

  fn process_element(&mut self, index: usize, header: &mut SecurityHeader) -> SecurityResult<()> {
    let element = header.elements[index].clone();
    match element {
      SecurityHeaderElement::Timestamp(timestamp) => self.timestamp = Some(timestamp),
      SecurityHeaderElement::Token(element) => {
        let token = self.resolver.add_wire_token(&element)?;
        self.elements.set_token(index, token);
      }
      SecurityHeaderElement::EncryptedKey(element) => {
        let token = self.resolver.add_encrypted_key(&element)?;
        self.elements.set_token(index, token);
        if !element.reference_list.is_empty() {
          self.note_reference_list(index, &element.reference_list);
        }
      }
      SecurityHeaderElement::DerivedKeyToken(element) => {
        let token = self.resolver.add_derived_key(&element)?;
        self.elements.set_token(index, token);
      }
      SecurityHeaderElement::SignatureConfirmation(confirmation) => {
        self.confirmations_present = true;
        self.received_confirmations.add(confirmation.value);
      }
      SecurityHeaderElement::ReferenceList(list) => {
        self.note_reference_list(index, &list.data_references);
      }
      SecurityHeaderElement::Signature(_) => self.signature_indices.push(index),
      SecurityHeaderElement::SecurityTokenReference(_) => {}
      SecurityHeaderElement::EncryptedData(data) => {
        let plaintext = self.decrypt(&data)?;
        let decrypted = SecurityHeaderElement::from_binary(&plaintext)?;
        if matches!(decrypted, SecurityHeaderElement::EncryptedData(_)) {
          return Err(security_error!(
            MessageSecurity,
            "Encrypted data {} decrypts to further encrypted data",
            data.id
          ));
        }
        trace!("Decrypted header element {} into a {}", data.id, decrypted.kind_name());
        self.decrypted_references.insert(data.id);
        self.elements.replace_decrypted(index, &decrypted)?;
        header.elements[index] = decrypted;
        self.process_element(index, header)?;
      }
    }
    Ok(())
  }

  fn note_reference_list(&mut self, index: usize, references: &[String]) {
    self.reference_list_index.get_or_insert(index);
    self.data_references.extend(references.iter().cloned());
  }

  fn decrypt(&mut self, data: &EncryptedData) -> SecurityResult<Vec<u8>> {
    self
      .factory
      .algorithm_suite()
      .ensure_acceptable_encryption_algorithm(&data.encryption_method)?;
    let clause = data.key_info.as_ref().ok_or_else(|| {
      security_error!(MessageSecurity, "Encrypted data {} names no key", data.id)
        .with_fault_subcode(FaultSubcode::InvalidSecurity)
    })?;
    let token = self.resolver.resolve_token(clause)?;
    let plaintext = aes_gcm::decrypt(token.encryption_key()?, &data.cipher_value).map_err(|_| {
      security_error!(MessageSecurity, "Cannot decrypt encrypted data {}", data.id)
        .with_fault_subcode(FaultSubcode::FailedCheck)
    })?;
    match &self.encryption_token {
      None => self.encryption_token = Some(token),
      Some(existing) if existing.root_token().id() == token.root_token().id() => {}
      Some(_) => {
        return Err(
          security_error!(MessageSecurity, "Message parts are encrypted with different tokens")
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
        )
      }
    }
    Ok(plaintext)
  }

  fn decrypt_parts(&mut self, message: &mut Message) -> SecurityResult<()> {
    for reference in self.data_references.clone() {
      if self.decrypted_references.contains(&reference) {
        continue;
      }
      let body_data = match &message.body {
        MessageBody::Encrypted(data) if data.id == reference => Some(data.clone()),
        _ => None,
      };
      if let Some(data) = body_data {
        let plaintext = self.decrypt(&data)?;
        message.body = MessageBody::Raw(Bytes::from(plaintext));
        if let Some(id) = &message.body_id {
          self.elements.mark_encrypted(id);
        }
        self.decrypted_references.insert(reference);
        continue;
      }

      let header = message.headers.iter().find(
        |h| matches!(&h.content, HeaderContent::Encrypted(data) if data.id == reference),
      );
      let Some(header) = header else {
        return Err(
          security_error!(
            MessageSecurity,
            "The reference list names unknown encrypted data {reference}"
          )
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      };
      let HeaderContent::Encrypted(data) = header.content.clone() else {
        continue;
      };
      let header_id = header.id.clone();
      let plaintext = self.decrypt(&data)?;
      if let Some(header) = message.headers.iter_mut().find(|h| h.id == header_id) {
        header.content = HeaderContent::Plain(Bytes::from(plaintext));
      }
      if let Some(id) = &header_id {
        self.elements.mark_encrypted(id);
      }
      self.decrypted_references.insert(reference);
    }
    if message.body.is_encrypted() || message.headers.iter().any(|h| h.is_encrypted()) {
      return Err(
        security_error!(
          MessageSecurity,
          "An encrypted message part is not named by any reference list"
        )
        .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    Ok(())
  }

  fn verify_signatures(
    &mut self,
    message: &Message,
    header: &SecurityHeader,
    primary_index: Option<usize>,
  ) -> SecurityResult<()> {
    let standards = *self.factory.standards();
    let primary_id = primary_index.and_then(|i| header.elements[i].id().map(str::to_string));
    let timestamp_id = self.timestamp.as_ref().map(|t| t.id.clone());
    for index in self.signature_indices.clone() {
      let SecurityHeaderElement::Signature(signature) = &header.elements[index] else {
        continue;
      };
      let token = self.verify_signature(message, header, signature, &standards)?;
      self.signature_values.push(signature.signature_value.clone());
      if Some(index) == primary_index {
        self.signature_token = Some(token);
        continue;
      }
      // endorsing signatures cover the primary signature, or the timestamp
      // when there is none
      let endorsed = primary_id.as_deref().or(timestamp_id.as_deref());
      if !endorsed.is_some_and(|id| signature.signed_info.reference(id).is_some()) {
        return Err(
          security_error!(
            MessageSecurity,
            "The endorsing signature {} does not cover the message signature",
            signature.id
          )
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
      self.endorsing_tokens.push(token);
    }
    Ok(())
  }

  fn verify_signature(
    &mut self,
    message: &Message,
    header: &SecurityHeader,
    signature: &SignatureElement,
    standards: &SecurityStandardsManager,
  ) -> SecurityResult<SecurityToken> {
    let suite = self.factory.algorithm_suite();
    let signed_info = &signature.signed_info;
    suite.ensure_acceptable_signature_algorithm(&signed_info.signature_method)?;
    let token = self.resolver.resolve_token(&signature.key_info)?;
    signing::verify(
      &signed_info.signature_method,
      token.verification_key()?,
      &signed_info.canonical_bytes(),
      &signature.signature_value,
    )
    .map_err(|_| {
      security_error!(MessageSecurity, "The signature {} is not valid", signature.id)
        .with_fault_subcode(FaultSubcode::FailedCheck)
    })?;

    for reference in &signed_info.references {
      suite.ensure_acceptable_digest_algorithm(&reference.digest_method)?;
      let bytes = match message.part_canonical_bytes(&reference.uri, standards) {
        Some(bytes) => bytes,
        None => header
          .find_by_id(&reference.uri)
          .map(|e| e.canonical_bytes(standards))
          .ok_or_else(|| {
            security_error!(
              MessageSecurity,
              "The signature {} references unknown element {}",
              signature.id,
              reference.uri
            )
            .with_fault_subcode(FaultSubcode::InvalidSecurity)
          })?,
      };
      let digest = compute_digest(&reference.digest_method, &bytes)?;
      if !constant_time_equals(&digest, &reference.digest_value) {
        return Err(
          security_error!(MessageSecurity, "The digest of element {} does not match", reference.uri)
            .with_fault_subcode(FaultSubcode::FailedCheck),
        );
      }
      self.elements.mark_signed(&reference.uri);
    }
    Ok(token)
  }

  fn check_timestamp(&self) -> SecurityResult<()> {
    let Some(timestamp) = &self.timestamp else {
      if self.factory.include_timestamp() {
        return Err(
          security_error!(MessageSecurity, "The security header has no timestamp")
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
      return Ok(());
    };
    let now = utc_now();
    let skew = self.factory.max_clock_skew();
    if timestamp.created > add_saturating(now, skew) {
      return Err(
        security_error!(MessageSecurity, "The message timestamp lies in the future")
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    if self.factory.detect_replays()
      && timestamp.created < sub_saturating(now, self.factory.replay_window() + skew)
    {
      return Err(
        security_error!(MessageSecurity, "The message is older than the replay window")
          .with_fault_subcode(FaultSubcode::MessageExpired),
      );
    }
    if let Some(expires) = timestamp.expires {
      if add_saturating(expires, skew) < now {
        return Err(
          security_error!(MessageSecurity, "The message has expired")
            .with_fault_subcode(FaultSubcode::MessageExpired),
        );
      }
    }
    Ok(())
  }

  fn detect_replay(&self) -> SecurityResult<()> {
    let Some(cache) = self.factory.nonce_cache() else {
      return Ok(());
    };
    let nonce = self.signature_values.first().ok_or_else(|| {
      security_error!(
        MessageSecurity,
        "Replay detection needs a signed message"
      )
      .with_fault_subcode(FaultSubcode::InvalidSecurity)
    })?;
    cache.check_and_add(nonce)
  }

  fn match_supporting_tokens(&mut self) -> SecurityResult<()> {
    let primary_root = self
      .signature_token
      .as_ref()
      .map(|t| t.root_token().id().to_string());
    let mut used = HashSet::new();
    let mut endorsements_matched = vec![false; self.endorsing_tokens.len()];

    for (tracker, requirement) in self.supporting_authenticators.clone().into_iter().enumerate() {
      let mode = requirement.specification.mode;
      let parameters = &requirement.specification.parameters;
      let candidate = self
        .elements
        .entries()
        .iter()
        .enumerate()
        .filter(|(index, entry)| {
          !used.contains(index) && entry.category == ReceiveSecurityHeaderElementCategory::Token
        })
        .find_map(|(index, entry)| {
          entry
            .token
            .as_ref()
            .filter(|t| {
              primary_root.as_deref() != Some(t.id())
                && parameters.matches_token_kind(t)
                && requirement.authenticator.can_validate_token(t)
            })
            .map(|t| (index, t.clone()))
        });
      let Some((index, token)) = candidate else {
        return Err(
          security_error!(
            MessageSecurity,
            "A required {mode:?} supporting token is missing"
          )
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      };
      used.insert(index);

      let endorsement = self
        .endorsing_tokens
        .iter()
        .position(|t| t.root_token().id() == token.id());
      if let Some(e) = endorsement {
        endorsements_matched[e] = true;
      }
      if mode.is_endorsing() && endorsement.is_none() {
        return Err(
          security_error!(
            MessageSecurity,
            "The {} supporting token does not endorse the message",
            token.kind_name()
          )
          .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
      if !self.transport_protected {
        let binding = match mode {
          SecurityTokenAttachmentMode::Signed => ReceiveSecurityHeaderBindingModes::Signed,
          SecurityTokenAttachmentMode::SignedEncrypted => ReceiveSecurityHeaderBindingModes::Basic,
          SecurityTokenAttachmentMode::Endorsing => ReceiveSecurityHeaderBindingModes::Endorsing,
          SecurityTokenAttachmentMode::SignedEndorsing => {
            ReceiveSecurityHeaderBindingModes::SignedEndorsing
          }
        };
        self.elements.set_binding_mode(index, binding, Some(tracker));
      }
      let policies = requirement.authenticator.validate_token(&token)?;
      debug!("Accepted {mode:?} supporting token {}", token.id());
      self.supporting_tokens.push(ReceivedSupportingToken {
        specification: SecurityTokenSpecification::new(token, policies),
        mode,
      });
    }

    if endorsements_matched.iter().any(|matched| !matched) {
      return Err(
        security_error!(
          MessageSecurity,
          "The message carries an endorsing signature no supporting token requirement expects"
        )
        .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    Ok(())
  }

  fn ensure_parts_protected(&self, message: &Message) -> SecurityResult<()> {
    let checks: [(&MessagePartSpecification, &str); 2] =
      [(&self.signature_parts, "signed"), (&self.encryption_parts, "encrypted")];
    for (parts, what) in checks {
      let protected = |id: Option<&String>| {
        id.is_some_and(|id| {
          if what == "signed" {
            self.elements.is_signed(id)
          } else {
            self.elements.is_encrypted(id)
          }
        })
      };
      for header in &message.headers {
        if parts.is_header_included(&header.name, &header.namespace) && !protected(header.id.as_ref()) {
          return Err(
            security_error!(
              MessageSecurity,
              "The header {} is required to be {what}",
              header.name
            )
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
          );
        }
      }
      if parts.is_body_included() && !message.body.is_empty() && !protected(message.body_id.as_ref()) {
        return Err(
          security_error!(MessageSecurity, "The body is required to be {what}")
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
    }
    Ok(())
  }

  fn check_signature_confirmations(&self) -> SecurityResult<()> {
    match &self.expected_signature_confirmations {
      Some(expected) => {
        if !self.confirmations_present || !self.received_confirmations.matches(expected) {
          return Err(
            security_error!(
              MessageSecurity,
              "The reply does not confirm the signatures of the request"
            )
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
          );
        }
      }
      None if self.confirmations_present && !self.factory.require_signature_confirmation() => {
        return Err(
          security_error!(MessageSecurity, "Unexpected signature confirmation")
            .with_fault_subcode(FaultSubcode::InvalidSecurity),
        );
      }
      None => {}
    }
    Ok(())
  }
}

fn is_token_element(element: &SecurityHeaderElement) -> bool {
  matches!(
    element,
    SecurityHeaderElement::Token(_)
      | SecurityHeaderElement::EncryptedKey(_)
      | SecurityHeaderElement::DerivedKeyToken(_)
  )
}
