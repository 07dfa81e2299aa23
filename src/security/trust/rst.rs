use crate::security::{
  message::xml_writer::{canonical_bytes, XmlWriter, XmlWriterExt},
  standards::SecurityStandardsManager,
  tokens::KeyIdentifierClause,
  trust::elements::{write_applies_to, write_entropy, BinaryExchange, FrozenBytes, RequestType},
  SecurityResult,
};

/// WS-Trust `RequestSecurityToken`.
///
/// After [`make_read_only`](Self::make_read_only) the canonical form is
/// fixed: every later serialization yields the same bytes, which keeps a
/// retransmitted request byte-identical to the first attempt. Setters then
/// fail with `InvalidOperation`; use [`to_writable`](Self::to_writable) for
/// an editable copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSecurityToken {
  standards: SecurityStandardsManager,
  context: Option<String>,
  token_type: Option<String>,
  request_type: RequestType,
  key_size: Option<u32>,
  applies_to: Option<String>,
  requestor_entropy: Option<Vec<u8>>,
  binary_exchange: Option<BinaryExchange>,
  renew_target: Option<KeyIdentifierClause>,
  cancel_target: Option<KeyIdentifierClause>,
  frozen: FrozenBytes,
}

impl RequestSecurityToken {
  pub fn new(standards: SecurityStandardsManager, request_type: RequestType) -> Self {
    RequestSecurityToken {
      standards,
      context: None,
      token_type: None,
      request_type,
      key_size: None,
      applies_to: None,
      requestor_entropy: None,
      binary_exchange: None,
      renew_target: None,
      cancel_target: None,
      frozen: FrozenBytes::default(),
    }
  }

  /// Issue request for a security context token.
  pub fn issue_security_context(standards: SecurityStandardsManager) -> Self {
    let mut rst = Self::new(standards, RequestType::Issue);
    rst.token_type = Some(standards.secure_conversation_version().token_type());
    rst
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

  pub fn request_type(&self) -> RequestType {
    self.request_type
  }

  pub fn key_size(&self) -> Option<u32> {
    self.key_size
  }

  pub fn applies_to(&self) -> Option<&str> {
    self.applies_to.as_deref()
  }

  pub fn requestor_entropy(&self) -> Option<&[u8]> {
    self.requestor_entropy.as_deref()
  }

  pub fn binary_exchange(&self) -> Option<&BinaryExchange> {
    self.binary_exchange.as_ref()
  }

  pub fn renew_target(&self) -> Option<&KeyIdentifierClause> {
    self.renew_target.as_ref()
  }

  pub fn cancel_target(&self) -> Option<&KeyIdentifierClause> {
    self.cancel_target.as_ref()
  }

  pub fn set_context(&mut self, context: impl Into<String>) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.context = Some(context.into());
    Ok(())
  }

  pub fn set_token_type(&mut self, token_type: impl Into<String>) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.token_type = Some(token_type.into());
    Ok(())
  }

  pub fn set_key_size(&mut self, key_size: u32) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.key_size = Some(key_size);
    Ok(())
  }

  pub fn set_applies_to(&mut self, address: impl Into<String>) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.applies_to = Some(address.into());
    Ok(())
  }

  pub fn set_requestor_entropy(&mut self, entropy: Vec<u8>) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.requestor_entropy = Some(entropy);
    Ok(())
  }

  pub fn set_binary_exchange(&mut self, exchange: BinaryExchange) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.binary_exchange = Some(exchange);
    Ok(())
  }

  pub fn set_renew_target(&mut self, target: KeyIdentifierClause) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.renew_target = Some(target);
    Ok(())
  }

  pub fn set_cancel_target(&mut self, target: KeyIdentifierClause) -> SecurityResult<()> {
    self.frozen.ensure_writable("RequestSecurityToken")?;
    self.cancel_target = Some(target);
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

  /// Editable copy with the frozen form discarded.
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
    writer.write_start_element(p, "RequestSecurityToken", ns);
    if let Some(context) = &self.context {
      writer.write_attribute("", "Context", "", context);
    }
    if let Some(token_type) = &self.token_type {
      writer.write_element_string(p, "TokenType", ns, token_type);
    }
    writer.write_element_string(p, "RequestType", ns, &self.request_type.uri(standards));
    if let Some(key_size) = self.key_size {
      writer.write_element_string(p, "KeySize", ns, &key_size.to_string());
    }
    if let Some(address) = &self.applies_to {
      write_applies_to(writer, address);
    }
    if let Some(entropy) = &self.requestor_entropy {
      write_entropy(writer, standards, entropy);
    }
    if let Some(exchange) = &self.binary_exchange {
      exchange.write_to(writer, standards);
    }
    if let Some(target) = &self.renew_target {
      writer.write_start_element(p, "RenewTarget", ns);
      target.write_to(writer, standards);
      writer.write_end_element();
    }
    if let Some(target) = &self.cancel_target {
      writer.write_start_element(p, "CancelTarget", ns);
      target.write_to(writer, standards);
      writer.write_end_element();
    }
    writer.write_end_element();
  }
}
