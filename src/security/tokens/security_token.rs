use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::{
  security::{
    algorithm_suite::{AES128_KEY_WRAP, AES256_KEY_WRAP, RSA_OAEP_KEY_WRAP},
    cryptographic::{
      aes_gcm, digest,
      psha1::derive_key,
      rsa_key,
      signing::{SigningKey, VerificationKey},
      SymmetricKey,
    },
    message::security_header::WireToken,
    tokens::{
      key_identifier::{KeyIdentifier, KeyIdentifierClause, WrappingKeyReference},
      security_context_token::SecurityContextSecurityToken,
      token_parameters::SecurityTokenReferenceStyle,
    },
    SecurityResult,
  },
  security_error,
};

/// Certificate-like token holding an RSA key pair (or only the public half at
/// the relying side). The raw data is the DER encoded public key.
#[derive(Debug, Clone)]
pub struct X509SecurityToken {
  id: String,
  subject: String,
  public_key: RsaPublicKey,
  private_key: Option<Arc<RsaPrivateKey>>,
  raw_data: Vec<u8>,
  thumbprint: Vec<u8>,
  valid_from: DateTime<Utc>,
  valid_to: DateTime<Utc>,
}

impl X509SecurityToken {
  pub fn new(
    id: impl Into<String>,
    subject: impl Into<String>,
    private_key: RsaPrivateKey,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
  ) -> SecurityResult<Self> {
    let public_key = private_key.to_public_key();
    let raw_data = rsa_key::public_key_der(&public_key)?;
    let thumbprint = digest::sha1(&raw_data);
    Ok(X509SecurityToken {
      id: id.into(),
      subject: subject.into(),
      public_key,
      private_key: Some(Arc::new(private_key)),
      raw_data,
      thumbprint,
      valid_from,
      valid_to,
    })
  }

  /// Public-key-only token built from raw token data found in a message.
  pub fn from_raw_data(id: impl Into<String>, raw_data: &[u8]) -> SecurityResult<Self> {
    let public_key = rsa_key::public_key_from_der(raw_data)?;
    Ok(X509SecurityToken {
      id: id.into(),
      subject: String::new(),
      public_key,
      private_key: None,
      raw_data: raw_data.to_vec(),
      thumbprint: digest::sha1(raw_data),
      valid_from: DateTime::<Utc>::MIN_UTC,
      valid_to: DateTime::<Utc>::MAX_UTC,
    })
  }

  /// Copy without the private key, as the peer would see it.
  pub fn public_only(&self) -> Self {
    X509SecurityToken {
      private_key: None,
      ..self.clone()
    }
  }

  pub fn subject(&self) -> &str {
    &self.subject
  }

  pub fn public_key(&self) -> &RsaPublicKey {
    &self.public_key
  }

  pub fn private_key(&self) -> Option<&RsaPrivateKey> {
    self.private_key.as_deref()
  }

  pub fn raw_data(&self) -> &[u8] {
    &self.raw_data
  }

  pub fn thumbprint(&self) -> &[u8] {
    &self.thumbprint
  }
}

/// Plain symmetric key token, e.g. a binary secret received out of band.
#[derive(Debug, Clone)]
pub struct BinarySecretSecurityToken {
  id: String,
  key: SymmetricKey,
  valid_from: DateTime<Utc>,
  valid_to: DateTime<Utc>,
}

impl BinarySecretSecurityToken {
  pub fn new(id: impl Into<String>, key: SymmetricKey) -> Self {
    BinarySecretSecurityToken {
      id: id.into(),
      key,
      valid_from: Utc::now(),
      valid_to: DateTime::<Utc>::MAX_UTC,
    }
  }
}

/// A symmetric key transported encrypted under another token's key.
#[derive(Debug, Clone)]
pub struct WrappedKeySecurityToken {
  id: String,
  key: SymmetricKey,
  wrap_algorithm: String,
  wrapping_token: Box<SecurityToken>,
  wrapping_clause: KeyIdentifierClause,
  wrapped_key: Vec<u8>,
  valid_from: DateTime<Utc>,
}

fn wrap_with(token: &SecurityToken, algorithm: &str, key: &SymmetricKey) -> SecurityResult<Vec<u8>> {
  match (algorithm, token.public_key(), token.symmetric_key()) {
    (RSA_OAEP_KEY_WRAP, Some(public_key), _) => rsa_key::wrap_key(public_key, key.as_bytes()),
    (AES128_KEY_WRAP | AES256_KEY_WRAP, None, Some(wrapping_key)) => {
      aes_gcm::encrypt(wrapping_key, key.as_bytes())
    }
    _ => Err(security_error!(
      MessageSecurity,
      "Key wrap algorithm {algorithm} cannot be used with a {} token",
      token.kind_name()
    )),
  }
}

fn unwrap_with(token: &SecurityToken, algorithm: &str, wrapped: &[u8]) -> SecurityResult<SymmetricKey> {
  let bytes = match (algorithm, token.private_key(), token.symmetric_key()) {
    (RSA_OAEP_KEY_WRAP, Some(private_key), _) => rsa_key::unwrap_key(private_key, wrapped)?,
    (RSA_OAEP_KEY_WRAP, None, _) => {
      return Err(security_error!(
        SecurityToken,
        "The wrapping token has no private key to unwrap the key with"
      ))
    }
    (AES128_KEY_WRAP | AES256_KEY_WRAP, _, Some(wrapping_key)) => {
      aes_gcm::decrypt(wrapping_key, wrapped)?
    }
    _ => {
      return Err(security_error!(
        MessageSecurity,
        "Key wrap algorithm {algorithm} cannot be used with a {} token",
        token.kind_name()
      ))
    }
  };
  Ok(SymmetricKey::from_bytes(&bytes))
}

impl WrappedKeySecurityToken {
  /// Wraps `key` for the holder of `wrapping_token`.
  pub fn create(
    id: impl Into<String>,
    key: SymmetricKey,
    wrap_algorithm: &str,
    wrapping_token: SecurityToken,
    wrapping_clause: KeyIdentifierClause,
  ) -> SecurityResult<Self> {
    let wrapped_key = wrap_with(&wrapping_token, wrap_algorithm, &key)?;
    Ok(WrappedKeySecurityToken {
      id: id.into(),
      key,
      wrap_algorithm: wrap_algorithm.to_string(),
      wrapping_token: Box::new(wrapping_token),
      wrapping_clause,
      wrapped_key,
      valid_from: Utc::now(),
    })
  }

  /// Recovers the key carried in `wrapped_key`.
  pub fn unwrap(
    id: impl Into<String>,
    wrapped_key: Vec<u8>,
    wrap_algorithm: &str,
    wrapping_token: SecurityToken,
    wrapping_clause: KeyIdentifierClause,
  ) -> SecurityResult<Self> {
    let key = unwrap_with(&wrapping_token, wrap_algorithm, &wrapped_key)?;
    Ok(WrappedKeySecurityToken {
      id: id.into(),
      key,
      wrap_algorithm: wrap_algorithm.to_string(),
      wrapping_token: Box::new(wrapping_token),
      wrapping_clause,
      wrapped_key,
      valid_from: Utc::now(),
    })
  }

  pub fn wrap_algorithm(&self) -> &str {
    &self.wrap_algorithm
  }

  pub fn wrapping_token(&self) -> &SecurityToken {
    &self.wrapping_token
  }

  pub fn wrapping_clause(&self) -> &KeyIdentifierClause {
    &self.wrapping_clause
  }

  pub fn wrapped_key(&self) -> &[u8] {
    &self.wrapped_key
  }

  /// SHA-1 of the wrapped key, used to refer back to this key later.
  pub fn encrypted_key_hash(&self) -> Vec<u8> {
    digest::sha1(&self.wrapped_key)
  }

  /// Clause that carries the encrypted key inline.
  pub fn inline_clause(&self) -> SecurityResult<KeyIdentifierClause> {
    let wrapping = WrappingKeyReference::from_clause(&self.wrapping_clause).ok_or_else(|| {
      security_error!(
        SecurityToken,
        "The wrapping key clause cannot be carried inside an encrypted key"
      )
    })?;
    Ok(KeyIdentifierClause::encrypted_key(
      self.wrapped_key.clone(),
      self.wrap_algorithm.clone(),
      wrapping,
    ))
  }
}

/// Key derived with P_SHA1 from a base token's key.
#[derive(Debug, Clone)]
pub struct DerivedKeySecurityToken {
  id: String,
  key: SymmetricKey,
  base_token: Box<SecurityToken>,
  label: String,
  nonce: Vec<u8>,
  length: usize,
  offset: usize,
}

impl DerivedKeySecurityToken {
  pub fn derive(
    id: impl Into<String>,
    base_token: SecurityToken,
    label: &str,
    nonce: Vec<u8>,
    length: usize,
    offset: usize,
  ) -> SecurityResult<Self> {
    let base_key = base_token.symmetric_key().ok_or_else(|| {
      security_error!(
        SecurityToken,
        "Cannot derive a key from a {} token",
        base_token.kind_name()
      )
    })?;
    base_key.ensure_not_disposed()?;
    if length == 0 {
      return Err(security_error!(Argument, "Derived key length must be positive"));
    }
    let key = SymmetricKey::from_bytes(&derive_key(
      base_key.as_bytes(),
      label.as_bytes(),
      &nonce,
      offset,
      length,
    ));
    Ok(DerivedKeySecurityToken {
      id: id.into(),
      key,
      base_token: Box::new(base_token),
      label: label.to_string(),
      nonce,
      length,
      offset,
    })
  }

  pub fn base_token(&self) -> &SecurityToken {
    &self.base_token
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn nonce(&self) -> &[u8] {
    &self.nonce
  }

  pub fn length(&self) -> usize {
    self.length
  }

  pub fn offset(&self) -> usize {
    self.offset
  }
}

#[derive(Debug, Clone)]
pub struct UserNameSecurityToken {
  id: String,
  user_name: String,
  password: String,
  valid_from: DateTime<Utc>,
}

impl UserNameSecurityToken {
  pub fn new(id: impl Into<String>, user_name: impl Into<String>, password: impl Into<String>) -> Self {
    UserNameSecurityToken {
      id: id.into(),
      user_name: user_name.into(),
      password: password.into(),
      valid_from: Utc::now(),
    }
  }

  pub fn user_name(&self) -> &str {
    &self.user_name
  }

  pub fn password(&self) -> &str {
    &self.password
  }
}

/// Every kind of token the security protocols sign, encrypt or authenticate
/// with.
#[derive(Debug, Clone)]
pub enum SecurityToken {
  SecurityContext(SecurityContextSecurityToken),
  BinarySecret(BinarySecretSecurityToken),
  X509(X509SecurityToken),
  WrappedKey(WrappedKeySecurityToken),
  DerivedKey(DerivedKeySecurityToken),
  UserName(UserNameSecurityToken),
}

impl SecurityToken {
  pub fn id(&self) -> &str {
    match self {
      SecurityToken::SecurityContext(t) => t.id(),
      SecurityToken::BinarySecret(t) => &t.id,
      SecurityToken::X509(t) => &t.id,
      SecurityToken::WrappedKey(t) => &t.id,
      SecurityToken::DerivedKey(t) => &t.id,
      SecurityToken::UserName(t) => &t.id,
    }
  }

  pub fn kind_name(&self) -> &'static str {
    match self {
      SecurityToken::SecurityContext(_) => "SecurityContext",
      SecurityToken::BinarySecret(_) => "BinarySecret",
      SecurityToken::X509(_) => "X509",
      SecurityToken::WrappedKey(_) => "WrappedKey",
      SecurityToken::DerivedKey(_) => "DerivedKey",
      SecurityToken::UserName(_) => "UserName",
    }
  }

  pub fn valid_from(&self) -> DateTime<Utc> {
    match self {
      SecurityToken::SecurityContext(t) => t.valid_from(),
      SecurityToken::BinarySecret(t) => t.valid_from,
      SecurityToken::X509(t) => t.valid_from,
      SecurityToken::WrappedKey(t) => t.valid_from,
      SecurityToken::DerivedKey(t) => t.base_token.valid_from(),
      SecurityToken::UserName(t) => t.valid_from,
    }
  }

  pub fn valid_to(&self) -> DateTime<Utc> {
    match self {
      SecurityToken::SecurityContext(t) => t.expiration_time(),
      SecurityToken::BinarySecret(t) => t.valid_to,
      SecurityToken::X509(t) => t.valid_to,
      SecurityToken::WrappedKey(t) => t.wrapping_token.valid_to(),
      SecurityToken::DerivedKey(t) => t.base_token.valid_to(),
      SecurityToken::UserName(t) => t.valid_from + Duration::days(1),
    }
  }

  pub fn is_valid_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
    let from_ok = self
      .valid_from()
      .checked_sub_signed(skew)
      .map_or(true, |from| from <= now);
    let to_ok = self
      .valid_to()
      .checked_add_signed(skew)
      .map_or(true, |to| now <= to);
    from_ok && to_ok
  }

  pub fn symmetric_key(&self) -> Option<&SymmetricKey> {
    match self {
      SecurityToken::SecurityContext(t) => t.key().ok(),
      SecurityToken::BinarySecret(t) => Some(&t.key),
      SecurityToken::WrappedKey(t) => Some(&t.key),
      SecurityToken::DerivedKey(t) => Some(&t.key),
      SecurityToken::X509(_) | SecurityToken::UserName(_) => None,
    }
  }

  pub fn public_key(&self) -> Option<&RsaPublicKey> {
    match self {
      SecurityToken::X509(t) => Some(t.public_key()),
      _ => None,
    }
  }

  pub fn private_key(&self) -> Option<&RsaPrivateKey> {
    match self {
      SecurityToken::X509(t) => t.private_key(),
      _ => None,
    }
  }

  pub fn has_asymmetric_key(&self) -> bool {
    matches!(self, SecurityToken::X509(_))
  }

  pub fn has_key(&self) -> bool {
    self.symmetric_key().is_some() || self.public_key().is_some()
  }

  pub fn is_wrapped_key(&self) -> bool {
    matches!(self, SecurityToken::WrappedKey(_))
  }

  pub fn as_security_context(&self) -> Option<&SecurityContextSecurityToken> {
    match self {
      SecurityToken::SecurityContext(t) => Some(t),
      _ => None,
    }
  }

  pub fn as_wrapped_key(&self) -> Option<&WrappedKeySecurityToken> {
    match self {
      SecurityToken::WrappedKey(t) => Some(t),
      _ => None,
    }
  }

  pub fn as_derived_key(&self) -> Option<&DerivedKeySecurityToken> {
    match self {
      SecurityToken::DerivedKey(t) => Some(t),
      _ => None,
    }
  }

  /// The token a derived key was computed from, or the token itself.
  pub fn root_token(&self) -> &SecurityToken {
    match self {
      SecurityToken::DerivedKey(t) => t.base_token.root_token(),
      _ => self,
    }
  }

  pub fn signing_key(&self) -> SecurityResult<SigningKey<'_>> {
    if let Some(key) = self.symmetric_key() {
      Ok(SigningKey::Symmetric(key))
    } else if let Some(key) = self.private_key() {
      Ok(SigningKey::Asymmetric(key))
    } else {
      Err(security_error!(
        SecurityToken,
        "A {} token cannot produce signatures",
        self.kind_name()
      ))
    }
  }

  pub fn verification_key(&self) -> SecurityResult<VerificationKey<'_>> {
    if let Some(key) = self.symmetric_key() {
      Ok(VerificationKey::Symmetric(key))
    } else if let Some(key) = self.public_key() {
      Ok(VerificationKey::Asymmetric(key))
    } else {
      Err(security_error!(
        SecurityToken,
        "A {} token cannot verify signatures",
        self.kind_name()
      ))
    }
  }

  pub fn encryption_key(&self) -> SecurityResult<&SymmetricKey> {
    let key = self.symmetric_key().ok_or_else(|| {
      security_error!(
        SecurityToken,
        "A {} token has no symmetric key for encryption",
        self.kind_name()
      )
    })?;
    key.ensure_not_disposed()?;
    Ok(key)
  }

  pub fn matches_key_identifier_clause(&self, clause: &KeyIdentifierClause) -> bool {
    match (clause.identifier(), self) {
      (KeyIdentifier::LocalId(id), token) => token.id() == id.as_str(),
      (
        KeyIdentifier::SecurityContext {
          context_id,
          generation,
        },
        SecurityToken::SecurityContext(t),
      ) => t.context_id() == context_id && t.key_generation() == generation.as_ref(),
      (KeyIdentifier::Thumbprint(thumbprint), SecurityToken::X509(t)) => t.thumbprint() == thumbprint,
      (KeyIdentifier::X509RawData(raw), SecurityToken::X509(t)) => t.raw_data() == raw,
      (KeyIdentifier::EncryptedKeyHash(hash), SecurityToken::WrappedKey(t)) => {
        &t.encrypted_key_hash() == hash
      }
      (KeyIdentifier::EncryptedKey { wrapped_key, .. }, SecurityToken::WrappedKey(t)) => {
        &t.wrapped_key == wrapped_key
      }
      _ => false,
    }
  }

  pub fn can_create_key_identifier_clause(&self, style: SecurityTokenReferenceStyle) -> bool {
    match style {
      SecurityTokenReferenceStyle::Internal => true,
      SecurityTokenReferenceStyle::External => matches!(
        self,
        SecurityToken::SecurityContext(_) | SecurityToken::X509(_) | SecurityToken::WrappedKey(_)
      ),
    }
  }

  pub fn create_key_identifier_clause(
    &self,
    style: SecurityTokenReferenceStyle,
  ) -> SecurityResult<KeyIdentifierClause> {
    match (style, self) {
      (SecurityTokenReferenceStyle::Internal, token) => Ok(KeyIdentifierClause::local_id(token.id())),
      (SecurityTokenReferenceStyle::External, SecurityToken::SecurityContext(t)) => Ok(
        KeyIdentifierClause::security_context(t.context_id().clone(), t.key_generation().cloned()),
      ),
      (SecurityTokenReferenceStyle::External, SecurityToken::X509(t)) => {
        Ok(KeyIdentifierClause::thumbprint(t.thumbprint().to_vec()))
      }
      (SecurityTokenReferenceStyle::External, SecurityToken::WrappedKey(t)) => {
        Ok(KeyIdentifierClause::encrypted_key_hash(t.encrypted_key_hash()))
      }
      (SecurityTokenReferenceStyle::External, token) => Err(security_error!(
        SecurityToken,
        "A {} token cannot be referenced externally",
        token.kind_name()
      )),
    }
  }

  /// How the token itself appears in a security header, if it can.
  pub fn to_wire_token(&self) -> Option<WireToken> {
    match self {
      SecurityToken::SecurityContext(t) => Some(t.to_wire_token()),
      SecurityToken::X509(t) => Some(WireToken::X509 {
        raw_data: t.raw_data.clone(),
      }),
      SecurityToken::UserName(t) => Some(WireToken::UserName {
        user_name: t.user_name.clone(),
        password: t.password.clone(),
      }),
      _ => None,
    }
  }

  /// Wipes key material held by this copy of the token.
  pub fn dispose(&mut self) {
    match self {
      SecurityToken::SecurityContext(t) => t.dispose(),
      SecurityToken::BinarySecret(t) => t.key.dispose(),
      SecurityToken::WrappedKey(t) => t.key.dispose(),
      SecurityToken::DerivedKey(t) => t.key.dispose(),
      SecurityToken::X509(_) | SecurityToken::UserName(_) => {}
    }
  }
}

impl From<SecurityContextSecurityToken> for SecurityToken {
  fn from(t: SecurityContextSecurityToken) -> Self {
    SecurityToken::SecurityContext(t)
  }
}

impl From<X509SecurityToken> for SecurityToken {
  fn from(t: X509SecurityToken) -> Self {
    SecurityToken::X509(t)
  }
}

impl From<WrappedKeySecurityToken> for SecurityToken {
  fn from(t: WrappedKeySecurityToken) -> Self {
    SecurityToken::WrappedKey(t)
  }
}

impl From<DerivedKeySecurityToken> for SecurityToken {
  fn from(t: DerivedKeySecurityToken) -> Self {
    SecurityToken::DerivedKey(t)
  }
}

impl From<UserNameSecurityToken> for SecurityToken {
  fn from(t: UserNameSecurityToken) -> Self {
    SecurityToken::UserName(t)
  }
}

impl From<BinarySecretSecurityToken> for SecurityToken {
  fn from(t: BinarySecretSecurityToken) -> Self {
    SecurityToken::BinarySecret(t)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::sync::OnceLock;

  use super::*;
  use crate::security::{standards::DEFAULT_DERIVATION_LABEL, types::UniqueId};

  pub(crate) fn test_private_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY
      .get_or_init(|| rsa_key::generate_private_key(1024).unwrap())
      .clone()
  }

  pub(crate) fn x509_token(id: &str) -> X509SecurityToken {
    let now = Utc::now();
    X509SecurityToken::new(
      id,
      "CN=service",
      test_private_key(),
      now - Duration::hours(1),
      now + Duration::hours(1),
    )
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

  #[test]
  fn wrapped_key_round_trips_through_rsa() {
    let cert = x509_token("_x509");
    let key = SymmetricKey::generate_random(32);
    let clause = KeyIdentifierClause::thumbprint(cert.thumbprint().to_vec());
    let wrapped = WrappedKeySecurityToken::create(
      "_ek",
      key.clone(),
      RSA_OAEP_KEY_WRAP,
      cert.public_only().into(),
      clause.clone(),
    )
    .unwrap();
    assert!(wrapped.wrapping_token().private_key().is_none());

    let unwrapped = WrappedKeySecurityToken::unwrap(
      "_ek",
      wrapped.wrapped_key().to_vec(),
      RSA_OAEP_KEY_WRAP,
      cert.clone().into(),
      clause,
    )
    .unwrap();
    assert_eq!(unwrapped.key, key);

    // the public half alone cannot unwrap
    assert!(WrappedKeySecurityToken::unwrap(
      "_ek",
      wrapped.wrapped_key().to_vec(),
      RSA_OAEP_KEY_WRAP,
      cert.public_only().into(),
      KeyIdentifierClause::local_id("_x509"),
    )
    .is_err());
  }

  #[test]
  fn symmetric_wrapping_uses_the_wrapping_key() {
    let sct = sct();
    let key = SymmetricKey::generate_random(32);
    let clause = sct
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap();
    let wrapped =
      WrappedKeySecurityToken::create("_ek", key.clone(), AES256_KEY_WRAP, sct.clone(), clause.clone())
        .unwrap();
    let token: SecurityToken = wrapped.clone().into();
    assert!(token.matches_key_identifier_clause(&wrapped.inline_clause().unwrap()));
    assert!(token.matches_key_identifier_clause(&KeyIdentifierClause::encrypted_key_hash(
      wrapped.encrypted_key_hash()
    )));
    let unwrapped = WrappedKeySecurityToken::unwrap(
      "_ek2",
      wrapped.wrapped_key().to_vec(),
      AES256_KEY_WRAP,
      sct,
      clause,
    )
    .unwrap();
    assert_eq!(unwrapped.key, key);
  }

  #[test]
  fn derived_keys_depend_on_nonce() {
    let base = sct();
    let a = DerivedKeySecurityToken::derive("_a", base.clone(), DEFAULT_DERIVATION_LABEL, vec![1; 16], 32, 0)
      .unwrap();
    let b = DerivedKeySecurityToken::derive("_b", base.clone(), DEFAULT_DERIVATION_LABEL, vec![2; 16], 32, 0)
      .unwrap();
    assert_ne!(a.key, b.key);
    assert_eq!(a.key.len(), 32);
    let derived: SecurityToken = a.into();
    assert_eq!(derived.root_token().id(), base.id());

    let cert: SecurityToken = x509_token("_x").into();
    assert!(DerivedKeySecurityToken::derive("_c", cert, DEFAULT_DERIVATION_LABEL, vec![1], 32, 0).is_err());
  }

  #[test]
  fn clause_matching() {
    let cert: SecurityToken = x509_token("_x509").into();
    let thumbprint = cert
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .unwrap();
    assert!(cert.matches_key_identifier_clause(&thumbprint));
    assert!(cert.matches_key_identifier_clause(&KeyIdentifierClause::local_id("_x509")));
    assert!(!sct().matches_key_identifier_clause(&thumbprint));

    let user: SecurityToken = UserNameSecurityToken::new("_u", "alice", "pw").into();
    assert!(user
      .create_key_identifier_clause(SecurityTokenReferenceStyle::External)
      .is_err());
    assert!(user.signing_key().is_err());
  }

}
