use crate::{
  security::{
    message::xml_writer::{canonical_bytes, XmlWriter, XmlWriterExt},
    standards::SecurityStandardsManager,
    tokens::KeyIdentifierClause,
    trust::elements::{
      write_entropy, BinaryExchange, FrozenBytes, Lifetime, RequestedProofToken,
      RequestedSecurityToken,
    },
    SecurityResult,
  },
  security_error,
};

/// WS-Trust `RequestSecurityTokenResponse`. Follows the same read-only
/// contract as [`RequestSecurityToken`](super::RequestSecurityToken).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSecurityTokenResponse {
  standards: SecurityStandardsManager,
  context: Option<String>,
  token_type: Option<String>,
  key_size: Option<u32>,
  requested_security_token: Option<RequestedSecurityToken>,
  requested_attached_reference: Option<KeyIdentifierClause>,
  requested_unattached_reference: Option<KeyIdentifierClause>,
  requested_proof_token: Option<RequestedProofToken>,
  issuer_entropy: Option<Vec<u8>>,
  lifetime: Option<Lifetime>,
  binary_exchange: Option<BinaryExchange>,
  authenticator: Option<Vec<u8>>,
  requested_token_cancelled: bool,
  frozen: FrozenBytes,
}

macro_rules! rstr_setter {
  ($name:ident, $field:ident, $ty:ty) => {
    pub fn $name(&mut self, value: $ty) -> SecurityResult<()> {
      self.frozen.ensure_writable("RequestSecurityTokenResponse")?;
      self.$field = Some(value);
      Ok(())
    }
  };
}

impl RequestSecurityTokenResponse {
  pub fn new(standards: SecurityStandardsManager) -> Self {
    RequestSecurityTokenResponse {
      standards,
      context: None,
      token_type: None,
      key_size: None,
      requested_security_token: None,
      requested_attached_reference: None,
      requested_unattached_reference: None,
      requested_proof_token: None,
      issuer_entropy: None,
      lifetime: None,
      binary_exchange: None,
      authenticator: None,
      requested_token_cancelled: false,
      frozen: FrozenBytes::default(),
    }
  }

  pub fn standards(&self) -> &SecurityStandardsManager {
    &self.standards
  }

  pub fn context(&self) -> Option<&str> {
    self.context.as_deref()
  }

  pub fn token_type(&self) -> Option<&str> {
    self.token_type.as_deref()
  }

  pub fn key_size(&self) -> Option<u32> {
    self.key_size
  }

  pub fn requested_security_token(&self) -> Option<&RequestedSecurityToken> {
    self.requested_security_token.as_ref()
  }

  pub fn requested_attached_reference(&self) -> Option<&KeyIdentifierClause> {
    self.requested_attached_reference.as_ref()
  }

  pub fn requested_unattached_reference(&self) -> Option<&KeyIdentifierClause> {
    self.requested_unattached_reference.as_ref()
  }

  pub fn requested_proof_token(&self) -> Option<&RequestedProofToken> {
    self.requested_proof_token.as_ref()
  }

  pub fn issuer_entropy(&self) -> Option<&[u8]> {
    self.issuer_entropy.as_deref()
  }

  pub fn lifetime(&self) -> Option<&Lifetime> {
    self.lifetime.as_ref()
  }

  pub fn binary_exchange(&self) -> Option<&BinaryExchange> {
    self.binary_exchange.as_ref()
  }

  pub fn authenticator(&self) -> Option<&[u8]> {
    self.authenticator.as_deref()
  }

  pub fn is_requested_token_cancelled(&self) -> bool {
    self.requested_token_cancelled
  }

  rstr_setter!(set_context, context, String);
  rstr_setter!(set_token_type, token_type, String);
  rstr_setter!(set_key_size, key_size, u32);
  rstr_setter!(
    set_requested_security_token,
    requested_security_token,
    RequestedSecurityToken
  );
  rstr_setter!(
    set_requested_attached_reference,
    requested_attached_reference,
    KeyIdentifierClause
  );
  rstr_setter!(
    set_requested_unattached_reference,
    requested_unattached_reference,
    KeyIdentifierClause
  );
  rstr_setter!(set_requested_proof_token, requested_proof_token, RequestedProofToken);
  rstr_setter!(set_issuer_entropy, issuer_entropy, Vec<u8>);
  rstr_setter!(set_lifetime, lifetime, Lifetime);
  rstr_setter!(set_binary_exchange, binary_exchange, BinaryExchange);
  rstr_setter!(set_authenticator, authenticator, Vec<u8>);

  pub fn set_requested_token_cancelled(&mut self, cancelled: bool) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityTokenResponse")?;
    self.requested_token_cancelled = cancelled;
    Ok(())
  }

  pub fn is_read_only(&self) -> bool {
    self.frozen.is_frozen()
  }

  pub fn make_read_only(&mut self) {
    if !self.frozen.is_frozen() {
      let bytes = canonical_bytes(|w| self.write_elements(w));
      self.frozen.freeze(bytes);
    }
  }

  pub fn to_writable(&self) -> Self {
    let mut copy = self.clone();
    copy.frozen = FrozenBytes::default();
    copy
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter) {
    match self.frozen.get() {
      Some(bytes) => writer.write_raw(bytes),
      None => self.write_elements(writer),
    }
  }

  pub fn canonical_bytes(&self) -> Vec<u8> {
    match self.frozen.get() {
      Some(bytes) => bytes.to_vec(),
      None => canonical_bytes(|w| self.write_elements(w)),
    }
  }

  fn write_elements(&self, writer: &mut dyn XmlWriter) {
    let standards = &self.standards;
    let trust = standards.trust_version();
    let (p, ns) = (trust.prefix(), trust.namespace());
    writer.write_start_element(p, "RequestSecurityTokenResponse", ns);
    if let Some(context) = &self.context {
      writer.write_attribute("", "Context", "", context);
    }
    if let Some(token_type) = &self.token_type {
      writer.write_element_string(p, "TokenType", ns, token_type);
    }
    if let Some(key_size) = self.key_size {
      writer.write_element_string(p, "KeySize", ns, &key_size.to_string());
    }
    if let Some(token) = &self.requested_security_token {
      token.write_to(writer, standards);
    }
    if let Some(reference) = &self.requested_attached_reference {
      writer.write_start_element(p, "RequestedAttachedReference", ns);
      reference.write_to(writer, standards);
      writer.write_end_element();
    }
    if let Some(reference) = &self.requested_unattached_reference {
      writer.write_start_element(p, "RequestedUnattachedReference", ns);
      reference.write_to(writer, standards);
      writer.write_end_element();
    }
    if let Some(proof) = &self.requested_proof_token {
      proof.write_to(writer, standards);
    }
    if let Some(entropy) = &self.issuer_entropy {
      write_entropy(writer, standards, entropy);
    }
    if let Some(lifetime) = &self.lifetime {
      lifetime.write_to(writer, standards);
    }
    if let Some(exchange) = &self.binary_exchange {
      exchange.write_to(writer, standards);
    }
    if let Some(authenticator) = &self.authenticator {
      writer.write_start_element(p, "Authenticator", ns);
      writer.write_element_base64(p, "CombinedHash", ns, authenticator);
      writer.write_end_element();
    }
    if self.requested_token_cancelled {
      writer.write_start_element(p, "RequestedTokenCancelled", ns);
      writer.write_end_element();
    }
    writer.write_end_element();
  }
}

/// `RequestSecurityTokenResponseCollection`: the final reply of a
/// negotiation carries the issued token and the authenticator in two
/// separate responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSecurityTokenResponseCollection {
  standards: SecurityStandardsManager,
  responses: Vec<RequestSecurityTokenResponse>,
}

impl RequestSecurityTokenResponseCollection {
  pub fn new(
    standards: SecurityStandardsManager,
    responses: Vec<RequestSecurityTokenResponse>,
  ) -> Self {
    RequestSecurityTokenResponseCollection {
      standards,
      responses,
    }
  }

  pub fn responses(&self) -> &[RequestSecurityTokenResponse] {
    &self.responses
  }

  pub fn into_responses(self) -> Vec<RequestSecurityTokenResponse> {
    self.responses
  }

  /// The response that carries the given element.
  pub fn find<P>(&self, predicate: P) -> SecurityResult<&RequestSecurityTokenResponse>
  where
    P: Fn(&RequestSecurityTokenResponse) -> bool,
  {
    self.responses.iter().find(|r| predicate(r)).ok_or_else(|| {
      security_error!(
        Negotiation,
        "The RequestSecurityTokenResponseCollection has no matching response"
      )
    })
  }

  pub fn make_read_only(&mut self) {
    for response in &mut self.responses {
      response.make_read_only();
    }
  }

  pub fn write_to(&self, writer: &mut dyn XmlWriter) {
    let trust = self.standards.trust_version();
    writer.write_start_element(
      trust.prefix(),
      "RequestSecurityTokenResponseCollection",
      trust.namespace(),
    );
    for response in &self.responses {
      response.write_to(writer);
    }
    writer.write_end_element();
  }

  pub fn canonical_bytes(&self) -> Vec<u8> {
    canonical_bytes(|w| self.write_to(w))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::security::{types::UniqueId, SecurityErrorKind};

  #[test]
  fn response_serialization_and_freeze() {
    let standards = SecurityStandardsManager::default();
    let mut rstr = RequestSecurityTokenResponse::new(standards);
    rstr.set_context("ctx".to_string()).unwrap();
    rstr
      .set_requested_security_token(RequestedSecurityToken {
        id: "sct-1".to_string(),
        context_id: UniqueId::from("urn:uuid:1"),
        generation: None,
      })
      .unwrap();
    rstr.set_authenticator(vec![7; 32]).unwrap();
    rstr.make_read_only();
    let text = String::from_utf8(rstr.canonical_bytes()).unwrap();
    assert!(text.contains("urn:uuid:1"));
    assert!(text.contains("CombinedHash"));
    assert_eq!(
      rstr.set_key_size(256).unwrap_err().kind(),
      SecurityErrorKind::InvalidOperation
    );
  }

  #[test]
  fn collection_lookup() {
    let standards = SecurityStandardsManager::default();
    let mut with_auth = RequestSecurityTokenResponse::new(standards);
    with_auth.set_authenticator(vec![1]).unwrap();
    let collection = RequestSecurityTokenResponseCollection::new(
      standards,
      vec![RequestSecurityTokenResponse::new(standards), with_auth],
    );
    assert!(collection.find(|r| r.authenticator().is_some()).is_ok());
    assert!(collection.find(|r| r.is_requested_token_cancelled()).is_err());
  }
}
