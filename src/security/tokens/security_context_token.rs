use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::security::{
  cryptographic::SymmetricKey,
  message::security_header::WireToken,
  tokens::authorization_policy::AuthorizationPolicy,
  types::UniqueId,
  SecurityResult,
};

/// Session token issued by security negotiation (WS-SecureConversation
/// SecurityContextToken).
///
/// Cached instances are clones, so disposing one copy does not affect the
/// others.
#[derive(Debug, Clone)]
pub struct SecurityContextSecurityToken {
  id: String,
  context_id: UniqueId,
  key_generation: Option<UniqueId>,
  key: SymmetricKey,
  valid_from: DateTime<Utc>,
  valid_to: DateTime<Utc>,
  key_effective_time: DateTime<Utc>,
  key_expiration_time: DateTime<Utc>,
  authorization_policies: Arc<Vec<AuthorizationPolicy>>,
  bootstrap_message: Option<Bytes>,
  is_cookie_mode: bool,
}

impl SecurityContextSecurityToken {
  /// New token whose key window equals its validity window.
  pub fn new(
    context_id: UniqueId,
    id: impl Into<String>,
    key: SymmetricKey,
    valid_from: DateTime<Utc>,
    valid_to: DateTime<Utc>,
    authorization_policies: Vec<AuthorizationPolicy>,
  ) -> Self {
    SecurityContextSecurityToken {
      id: id.into(),
      context_id,
      key_generation: None,
      key,
      valid_from,
      valid_to,
      key_effective_time: valid_from,
      key_expiration_time: valid_to,
      authorization_policies: Arc::new(authorization_policies),
      bootstrap_message: None,
      is_cookie_mode: false,
    }
  }

  pub fn with_key_generation(
    mut self,
    key_generation: UniqueId,
    key_effective_time: DateTime<Utc>,
    key_expiration_time: DateTime<Utc>,
  ) -> Self {
    self.key_generation = Some(key_generation);
    self.key_effective_time = key_effective_time;
    self.key_expiration_time = key_expiration_time;
    self
  }

  pub fn with_bootstrap_message(mut self, message: Bytes) -> Self {
    self.bootstrap_message = Some(message);
    self
  }

  pub fn with_cookie_mode(mut self, is_cookie_mode: bool) -> Self {
    self.is_cookie_mode = is_cookie_mode;
    self
  }

  /// Token for the next key generation of the same context. Authorization
  /// policies carry over.
  pub fn renew(
    &self,
    key: SymmetricKey,
    key_effective_time: DateTime<Utc>,
    key_expiration_time: DateTime<Utc>,
  ) -> Self {
    SecurityContextSecurityToken {
      id: UniqueId::new().to_string(),
      context_id: self.context_id.clone(),
      key_generation: Some(UniqueId::new()),
      key,
      valid_from: self.valid_from,
      valid_to: self.valid_to.max(key_expiration_time),
      key_effective_time,
      key_expiration_time,
      authorization_policies: Arc::clone(&self.authorization_policies),
      bootstrap_message: self.bootstrap_message.clone(),
      is_cookie_mode: self.is_cookie_mode,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn context_id(&self) -> &UniqueId {
    &self.context_id
  }

  pub fn key_generation(&self) -> Option<&UniqueId> {
    self.key_generation.as_ref()
  }

  pub fn key(&self) -> SecurityResult<&SymmetricKey> {
    self.key.ensure_not_disposed()?;
    Ok(&self.key)
  }

  pub fn valid_from(&self) -> DateTime<Utc> {
    self.valid_from
  }

  pub fn valid_to(&self) -> DateTime<Utc> {
    self.valid_to
  }

  pub fn key_effective_time(&self) -> DateTime<Utc> {
    self.key_effective_time
  }

  pub fn key_expiration_time(&self) -> DateTime<Utc> {
    self.key_expiration_time
  }

  /// The earlier of the token and key expirations.
  pub fn expiration_time(&self) -> DateTime<Utc> {
    self.valid_to.min(self.key_expiration_time)
  }

  pub fn authorization_policies(&self) -> &[AuthorizationPolicy] {
    &self.authorization_policies
  }

  pub fn bootstrap_message(&self) -> Option<&Bytes> {
    self.bootstrap_message.as_ref()
  }

  pub fn is_cookie_mode(&self) -> bool {
    self.is_cookie_mode
  }

  pub fn is_currently_valid(&self, now: DateTime<Utc>) -> bool {
    self.valid_from <= now && now <= self.valid_to
  }

  pub fn is_key_currently_valid(&self, now: DateTime<Utc>) -> bool {
    self.key_effective_time <= now && now <= self.key_expiration_time
  }

  pub fn is_disposed(&self) -> bool {
    self.key.is_empty()
  }

  /// Wipes the key material of this copy.
  pub fn dispose(&mut self) {
    self.key.dispose();
  }

  pub fn to_wire_token(&self) -> WireToken {
    WireToken::SecurityContext {
      context_id: self.context_id.clone(),
      generation: self.key_generation.clone(),
    }
  }
}
