use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  security::{
    algorithm_suite::SecurityAlgorithmSuite,
    message::security_header::{DerivedKeyTokenElement, EncryptedKeyElement, TokenElement, WireToken},
    standards::{FaultSubcode, DEFAULT_DERIVATION_LABEL},
    tokens::{
      key_identifier::KeyIdentifier,
      security_token::{
        DerivedKeySecurityToken, UserNameSecurityToken, WrappedKeySecurityToken, X509SecurityToken,
      },
      KeyIdentifierClause, SecurityToken, SecurityTokenParameters, SecurityTokenReferenceStyle,
      SecurityTokenResolver,
    },
    types::UniqueId,
    SecurityResult,
  },
  security_error,
};

/// Length of an implicitly derived key when the reference does not say.
pub const DEFAULT_IMPLICIT_DERIVED_KEY_LENGTH: usize = 32;

/// Largest P_SHA1 output position a derived key may start at.
pub const DEFAULT_MAX_DERIVED_KEY_OFFSET: usize = 64;

/// A token seen in (or expected by) the message being processed.
#[derive(Debug, Clone)]
pub struct SecurityTokenEntry {
  pub token: SecurityToken,
  /// wsu:Id of the header element that carried the token
  pub element_id: Option<String>,
  pub parameters: Option<SecurityTokenParameters>,
  pub allowed_reference_style: SecurityTokenReferenceStyle,
}

impl SecurityTokenEntry {
  fn matches(&self, clause: &KeyIdentifierClause) -> bool {
    if let (KeyIdentifier::LocalId(id), Some(element_id)) = (clause.identifier(), &self.element_id) {
      if element_id == id {
        return true;
      }
    }
    match &self.parameters {
      Some(parameters) => {
        parameters.matches_key_identifier_clause(&self.token, clause, self.allowed_reference_style)
      }
      None if self.allowed_reference_style == SecurityTokenReferenceStyle::Internal => {
        clause.is_local_reference() && self.token.matches_key_identifier_clause(clause)
      }
      None => self.token.matches_key_identifier_clause(clause),
    }
  }
}

struct DerivedKeyCacheEntry {
  base_id: String,
  label: String,
  nonce: Vec<u8>,
  length: usize,
  offset: usize,
  token: SecurityToken,
}

impl DerivedKeyCacheEntry {
  fn matches(&self, base_id: &str, label: &str, nonce: &[u8], length: usize, offset: usize) -> bool {
    self.base_id == base_id
      && self.label == label
      && self.nonce == nonce
      && self.length == length
      && self.offset == offset
  }
}

/// Resolves key identifier clauses while one security header is processed.
///
/// Lookup order: tokens registered so far, encrypted keys (unwrapped with a
/// resolved wrapping token), out-of-band resolvers, then intrinsic clauses.
/// A derivation nonce on the clause yields a derived key of the resolved
/// token. Derivation is bounded in count and length per message.
pub struct SecurityHeaderTokenResolver {
  entries: Vec<SecurityTokenEntry>,
  out_of_band: Vec<Arc<dyn SecurityTokenResolver>>,
  expected_wrapper: Option<SecurityToken>,
  derived_keys: Vec<DerivedKeyCacheEntry>,
  derived_key_count: usize,
  max_derived_keys: usize,
  max_derived_key_length: usize,
  max_derived_key_offset: usize,
  allow_intrinsic_tokens: bool,
  algorithm_suite: SecurityAlgorithmSuite,
}

impl SecurityHeaderTokenResolver {
  pub fn new(algorithm_suite: SecurityAlgorithmSuite, max_derived_keys: usize) -> Self {
    SecurityHeaderTokenResolver {
      entries: Vec::new(),
      out_of_band: Vec::new(),
      expected_wrapper: None,
      derived_keys: Vec::new(),
      derived_key_count: 0,
      max_derived_keys,
      max_derived_key_length: algorithm_suite.max_derived_key_length(),
      max_derived_key_offset: DEFAULT_MAX_DERIVED_KEY_OFFSET,
      allow_intrinsic_tokens: false,
      algorithm_suite,
    }
  }

  pub fn add_out_of_band_resolver(&mut self, resolver: Arc<dyn SecurityTokenResolver>) {
    self.out_of_band.push(resolver);
  }

  /// Token expected to wrap encrypted keys in this message, tried before
  /// any other lookup of the wrapping key.
  pub fn set_expected_wrapper(&mut self, token: SecurityToken) {
    self.expected_wrapper = Some(token);
  }

  pub fn set_allow_intrinsic_tokens(&mut self, allow: bool) {
    self.allow_intrinsic_tokens = allow;
  }

  pub fn set_max_derived_key_length(&mut self, bytes: usize) {
    self.max_derived_key_length = bytes;
  }

  pub fn set_max_derived_key_offset(&mut self, bytes: usize) {
    self.max_derived_key_offset = bytes;
  }

  pub fn derived_key_count(&self) -> usize {
    self.derived_key_count
  }

  pub fn add(
    &mut self,
    token: SecurityToken,
    element_id: Option<String>,
    allowed_reference_style: SecurityTokenReferenceStyle,
    parameters: Option<SecurityTokenParameters>,
  ) {
    self.entries.push(SecurityTokenEntry {
      token,
      element_id,
      parameters,
      allowed_reference_style,
    });
  }

  pub fn entries(&self) -> &[SecurityTokenEntry] {
    &self.entries
  }

  /// Token named by `clause`, or an error when nothing resolves it.
  pub fn resolve_token(&mut self, clause: &KeyIdentifierClause) -> SecurityResult<SecurityToken> {
    self.try_resolve_token(clause)?.ok_or_else(|| {
      security_error!(
        MessageSecurity,
        "Cannot resolve the key identifier clause {:?}",
        clause.identifier()
      )
      .with_fault_subcode(FaultSubcode::SecurityTokenUnavailable)
    })
  }

  pub fn try_resolve_token(
    &mut self,
    clause: &KeyIdentifierClause,
  ) -> SecurityResult<Option<SecurityToken>> {
    let Some(base) = self.resolve_base(clause)? else {
      return Ok(None);
    };
    match clause.derivation_nonce() {
      None => Ok(Some(base)),
      Some(nonce) => {
        let length = clause
          .derivation_length()
          .map_or(DEFAULT_IMPLICIT_DERIVED_KEY_LENGTH, |l| l as usize);
        self
          .derive(base, DEFAULT_DERIVATION_LABEL, nonce.to_vec(), length, 0, None)
          .map(Some)
      }
    }
  }

  fn resolve_base(&mut self, clause: &KeyIdentifierClause) -> SecurityResult<Option<SecurityToken>> {
    if let Some(entry) = self.entries.iter().find(|e| e.matches(clause)) {
      return Ok(Some(entry.token.clone()));
    }

    if let KeyIdentifier::EncryptedKey {
      wrapped_key,
      wrap_algorithm,
      wrapping,
    } = clause.identifier()
    {
      let wrapping_clause = wrapping.to_clause();
      let token = self.unwrap_key(
        UniqueId::new().to_string(),
        wrapped_key.clone(),
        wrap_algorithm,
        wrapping_clause,
      )?;
      self.add(token.clone(), None, SecurityTokenReferenceStyle::External, None);
      return Ok(Some(token));
    }

    if let Some(token) = self.out_of_band.iter().find_map(|r| r.resolve_token(clause)) {
      return Ok(Some(token));
    }

    if let KeyIdentifier::X509RawData(raw_data) = clause.identifier() {
      if !self.allow_intrinsic_tokens {
        return Err(security_error!(
          MessageSecurity,
          "Key identifiers carrying the token itself are not allowed here"
        ));
      }
      let token: SecurityToken =
        X509SecurityToken::from_raw_data(UniqueId::new().to_string(), raw_data)?.into();
      self.add(token.clone(), None, SecurityTokenReferenceStyle::External, None);
      return Ok(Some(token));
    }
    Ok(None)
  }

  fn unwrap_key(
    &mut self,
    id: String,
    wrapped_key: Vec<u8>,
    wrap_algorithm: &str,
    wrapping_clause: KeyIdentifierClause,
  ) -> SecurityResult<SecurityToken> {
    self
      .algorithm_suite
      .ensure_acceptable_key_wrap_algorithm(wrap_algorithm)?;
    let wrapper = match &self.expected_wrapper {
      Some(expected) if expected.matches_key_identifier_clause(&wrapping_clause) => expected.clone(),
      _ => self.resolve_base(&wrapping_clause)?.ok_or_else(|| {
        security_error!(
          MessageSecurity,
          "Cannot resolve the key that wraps an encrypted key"
        )
        .with_fault_subcode(FaultSubcode::SecurityTokenUnavailable)
      })?,
    };
    Ok(WrappedKeySecurityToken::unwrap(id, wrapped_key, wrap_algorithm, wrapper, wrapping_clause)?.into())
  }

  /// Unwraps the key of an `xenc:EncryptedKey` header element and registers
  /// it under the element id.
  pub fn add_encrypted_key(&mut self, element: &EncryptedKeyElement) -> SecurityResult<SecurityToken> {
    let token = self.unwrap_key(
      element.id.clone(),
      element.cipher_value.clone(),
      &element.encryption_method,
      element.key_info.clone(),
    )?;
    self.add(
      token.clone(),
      Some(element.id.clone()),
      SecurityTokenReferenceStyle::External,
      None,
    );
    Ok(token)
  }

  /// Computes the key of a `DerivedKeyToken` header element and registers it
  /// under the element id.
  pub fn add_derived_key(&mut self, element: &DerivedKeyTokenElement) -> SecurityResult<SecurityToken> {
    let base = self.resolve_token(&element.base)?;
    let label = element.label.as_deref().unwrap_or(DEFAULT_DERIVATION_LABEL);
    let token = self.derive(
      base,
      label,
      element.nonce.clone(),
      element.length as usize,
      element.offset as usize,
      Some(element.id.clone()),
    )?;
    self.add(
      token.clone(),
      Some(element.id.clone()),
      SecurityTokenReferenceStyle::Internal,
      None,
    );
    Ok(token)
  }

  /// Token carried as a header element. Security context tokens carry no
  /// key on the wire and must be known to an out-of-band resolver.
  pub fn add_wire_token(&mut self, element: &TokenElement) -> SecurityResult<SecurityToken> {
    let token: SecurityToken = match &element.token {
      WireToken::X509 { raw_data } => X509SecurityToken::from_raw_data(&element.id, raw_data)?.into(),
      WireToken::UserName {
        user_name,
        password,
      } => UserNameSecurityToken::new(&element.id, user_name, password).into(),
      WireToken::SecurityContext {
        context_id,
        generation,
      } => {
        let clause = KeyIdentifierClause::security_context(context_id.clone(), generation.clone());
        self
          .out_of_band
          .iter()
          .find_map(|r| r.resolve_token(&clause))
          .ok_or_else(|| {
            security_error!(
              MessageSecurity,
              "The security context token {context_id} is not known or has expired"
            )
            .with_fault_subcode(FaultSubcode::BadContextToken)
          })?
      }
    };
    self.add(
      token.clone(),
      Some(element.id.clone()),
      SecurityTokenReferenceStyle::External,
      None,
    );
    Ok(token)
  }

  fn derive(
    &mut self,
    base: SecurityToken,
    label: &str,
    nonce: Vec<u8>,
    length: usize,
    offset: usize,
    id: Option<String>,
  ) -> SecurityResult<SecurityToken> {
    if length > self.max_derived_key_length {
      return Err(security_error!(
        MessageSecurity,
        "Derived key length {length} exceeds the maximum of {} bytes",
        self.max_derived_key_length
      ));
    }
    // P_SHA1 computes every byte before the offset too
    if offset > self.max_derived_key_offset || offset.checked_add(length).is_none() {
      return Err(
        security_error!(
          MessageSecurity,
          "Derived key offset {offset} exceeds the maximum of {} bytes",
          self.max_derived_key_offset
        )
        .with_fault_subcode(FaultSubcode::InvalidSecurity),
      );
    }
    if let Some(cached) = self
      .derived_keys
      .iter()
      .find(|d| d.matches(base.id(), label, &nonce, length, offset))
    {
      return Ok(cached.token.clone());
    }
    if self.derived_key_count >= self.max_derived_keys {
      return Err(security_error!(
        QuotaExceeded,
        "The message requires more than {} derived keys",
        self.max_derived_keys
      ));
    }
    let base_id = base.id().to_string();
    let token: SecurityToken = DerivedKeySecurityToken::derive(
      id.unwrap_or_else(|| UniqueId::new().to_string()),
      base,
      label,
      nonce.clone(),
      length,
      offset,
    )?
    .into();
    self.derived_key_count += 1;
    self.derived_keys.push(DerivedKeyCacheEntry {
      base_id,
      label: label.to_string(),
      nonce,
      length,
      offset,
      token: token.clone(),
    });
    Ok(token)
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, Utc};

  use super::*;
  use crate::security::{
    algorithm_suite::RSA_OAEP_KEY_WRAP,
    cryptographic::SymmetricKey,
    tokens::{
      provider::OutOfBandTokenResolver, security_token::tests::x509_token,
      SecurityContextSecurityToken,
    },
  };

  fn suite() -> SecurityAlgorithmSuite {
    SecurityAlgorithmSuite::Basic256
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

  #[test]
  fn registered_tokens_resolve_by_local_id_and_clause() {
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 4);
    let token = sct();
    let external = token
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap();
    resolver.add(token.clone(), Some("_t".to_string()), SecurityTokenReferenceStyle::External, None);
    assert_eq!(resolver.resolve_token(&KeyIdentifierClause::local_id("_t")).unwrap().id(), "_sct");
    assert_eq!(resolver.resolve_token(&external).unwrap().id(), "_sct");
    assert!(resolver.resolve_token(&KeyIdentifierClause::local_id("_x")).is_err());
  }

  #[test]
  fn internal_only_entries_ignore_external_clauses() {
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 4);
    let token = sct();
    let external = token
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap();
    resolver.add(
      token,
      None,
      SecurityTokenReferenceStyle::Internal,
      Some(SecurityTokenParameters::secure_conversation()),
    );
    assert!(resolver.try_resolve_token(&external).unwrap().is_none());
    assert!(resolver
      .try_resolve_token(&KeyIdentifierClause::local_id("_sct"))
      .unwrap()
      .is_some());
  }

  #[test]
  fn encrypted_keys_are_unwrapped_with_the_expected_wrapper() {
    let cert = x509_token("_cert");
    let cert_token: SecurityToken = cert.clone().into();
    let clause = cert_token
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap();
    let key = SymmetricKey::generate_random(32);
    let wrapped = WrappedKeySecurityToken::create(
      "_ek",
      key.clone(),
      RSA_OAEP_KEY_WRAP,
      cert.public_only().into(),
      clause.clone(),
    )
    .unwrap();

    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 4);
    // without the private key the wrapping key cannot be found
    assert!(resolver.resolve_token(&wrapped.inline_clause().unwrap()).is_err());

    resolver.set_expected_wrapper(cert_token);
    let resolved = resolver.resolve_token(&wrapped.inline_clause().unwrap()).unwrap();
    assert_eq!(resolved.symmetric_key(), Some(&key));
    // later references by hash find the registered key
    let by_hash = KeyIdentifierClause::encrypted_key_hash(wrapped.encrypted_key_hash());
    assert_eq!(resolver.resolve_token(&by_hash).unwrap().symmetric_key(), Some(&key));
  }

  #[test]
  fn intrinsic_clauses_need_permission() {
    let cert = x509_token("_cert");
    let clause = KeyIdentifierClause::x509_raw_data(cert.raw_data().to_vec());
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 4);
    assert!(resolver.resolve_token(&clause).is_err());
    resolver.set_allow_intrinsic_tokens(true);
    let token = resolver.resolve_token(&clause).unwrap();
    assert!(token.public_key().is_some());
    assert!(token.private_key().is_none());
  }

  #[test]
  fn out_of_band_tokens_are_found() {
    let token = sct();
    let clause = token
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap();
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 4);
    resolver.add_out_of_band_resolver(Arc::new(OutOfBandTokenResolver::new(vec![token])));
    assert_eq!(resolver.resolve_token(&clause).unwrap().id(), "_sct");
  }

  #[test]
  fn derivation_is_cached_and_bounded() {
    let token = sct();
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 2);
    resolver.add(token, Some("_t".to_string()), SecurityTokenReferenceStyle::Internal, None);

    let clause = KeyIdentifierClause::local_id("_t").with_derivation(vec![1; 16], Some(24));
    let a = resolver.resolve_token(&clause).unwrap();
    let b = resolver.resolve_token(&clause).unwrap();
    assert_eq!(a.symmetric_key(), b.symmetric_key());
    assert_eq!(resolver.derived_key_count(), 1);

    // too long
    let long = KeyIdentifierClause::local_id("_t").with_derivation(vec![2; 16], Some(4096));
    assert!(resolver.resolve_token(&long).is_err());

    resolver
      .resolve_token(&KeyIdentifierClause::local_id("_t").with_derivation(vec![3; 16], None))
      .unwrap();
    let err = resolver
      .resolve_token(&KeyIdentifierClause::local_id("_t").with_derivation(vec![4; 16], None))
      .unwrap_err();
    assert_eq!(err.kind(), crate::security::SecurityErrorKind::QuotaExceeded);
  }

  #[test]
  fn derived_key_elements_register_under_their_id() {
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 4);
    resolver.add(sct(), Some("_t".to_string()), SecurityTokenReferenceStyle::Internal, None);
    let element = DerivedKeyTokenElement {
      id: "_dk".to_string(),
      base: KeyIdentifierClause::local_id("_t"),
      label: None,
      nonce: vec![9; 16],
      length: 24,
      offset: 0,
    };
    let derived = resolver.add_derived_key(&element).unwrap();
    assert_eq!(derived.symmetric_key().map(|k| k.len()), Some(24));
    assert_eq!(derived.root_token().id(), "_sct");
    assert!(resolver.resolve_token(&KeyIdentifierClause::local_id("_dk")).is_ok());
  }

  fn dk_element(id: &str, label: Option<&str>, offset: u32) -> DerivedKeyTokenElement {
    DerivedKeyTokenElement {
      id: id.to_string(),
      base: KeyIdentifierClause::local_id("_t"),
      label: label.map(str::to_string),
      nonce: vec![5; 16],
      length: 32,
      offset,
    }
  }

  #[test]
  fn derived_keys_differ_by_offset_and_label() {
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 8);
    resolver.add(sct(), Some("_t".to_string()), SecurityTokenReferenceStyle::Internal, None);

    let first = resolver.add_derived_key(&dk_element("_dk1", None, 0)).unwrap();
    let shifted = resolver.add_derived_key(&dk_element("_dk2", None, 32)).unwrap();
    let relabeled = resolver
      .add_derived_key(&dk_element("_dk3", Some("other-label"), 0))
      .unwrap();
    assert_ne!(first.symmetric_key(), shifted.symmetric_key());
    assert_ne!(first.symmetric_key(), relabeled.symmetric_key());
    assert_eq!(resolver.derived_key_count(), 3);

    // identical parameters still hit the cache
    let again = resolver.add_derived_key(&dk_element("_dk4", None, 32)).unwrap();
    assert_eq!(again.symmetric_key(), shifted.symmetric_key());
    assert_eq!(resolver.derived_key_count(), 3);
  }

  #[test]
  fn large_derivation_offsets_are_refused() {
    let mut resolver = SecurityHeaderTokenResolver::new(suite(), 4);
    resolver.add(sct(), Some("_t".to_string()), SecurityTokenReferenceStyle::Internal, None);

    let err = resolver
      .add_derived_key(&dk_element("_dk", None, 200_000_000))
      .unwrap_err();
    assert_eq!(err.kind(), crate::security::SecurityErrorKind::MessageSecurity);
    assert_eq!(resolver.derived_key_count(), 0);
    assert!(resolver
      .add_derived_key(&dk_element("_dk", None, u32::MAX))
      .is_err());

    resolver.set_max_derived_key_offset(128);
    assert!(resolver.add_derived_key(&dk_element("_dk", None, 96)).is_ok());
  }
}
