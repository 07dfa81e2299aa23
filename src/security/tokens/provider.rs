use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt};

use crate::{
  security::{
    cache::SecurityContextTokenCache,
    message::xml_writer::encode_base64,
    time::to_chrono_duration,
    tokens::{
      authorization_policy::{AuthorizationPolicy, NAME_CLAIM_TYPE, THUMBPRINT_CLAIM_TYPE},
      key_identifier::KeyIdentifierClause,
      security_token::SecurityToken,
    },
    SecurityResult,
  },
  security_error,
};

/// Source of tokens for outgoing messages.
pub trait SecurityTokenProvider: Send + Sync {
  fn get_token(&self, timeout: Duration) -> SecurityResult<SecurityToken>;

  /// Completes immediately unless the provider has to talk to the network.
  fn get_token_async(&self, timeout: Duration) -> BoxFuture<'_, SecurityResult<SecurityToken>> {
    future::ready(self.get_token(timeout)).boxed()
  }

  fn renew_token(&self, _timeout: Duration, token: &SecurityToken) -> SecurityResult<SecurityToken> {
    Err(security_error!(
      InvalidOperation,
      "Renewal of {} tokens is not supported by this provider",
      token.kind_name()
    ))
  }

  fn cancel_token(&self, _timeout: Duration, _token: &SecurityToken) -> SecurityResult<()> {
    Ok(())
  }
}

/// Validates tokens received in messages and produces the claims they
/// establish.
pub trait SecurityTokenAuthenticator: Send + Sync {
  fn can_validate_token(&self, token: &SecurityToken) -> bool;
  fn validate_token(&self, token: &SecurityToken) -> SecurityResult<Vec<AuthorizationPolicy>>;
}

/// Resolves key identifier clauses to tokens known out of band (not carried
/// in the message being processed).
pub trait SecurityTokenResolver: Send + Sync {
  fn resolve_token(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken>;
}

/// Provider handing out one preconfigured token.
pub struct FixedTokenProvider {
  token: SecurityToken,
}

impl FixedTokenProvider {
  pub fn new(token: SecurityToken) -> Self {
    FixedTokenProvider { token }
  }
}

impl SecurityTokenProvider for FixedTokenProvider {
  fn get_token(&self, _timeout: Duration) -> SecurityResult<SecurityToken> {
    Ok(self.token.clone())
  }
}

/// Resolver over a fixed set of tokens, e.g. the service certificate.
#[derive(Default)]
pub struct OutOfBandTokenResolver {
  tokens: Vec<SecurityToken>,
}

impl OutOfBandTokenResolver {
  pub fn new(tokens: Vec<SecurityToken>) -> Self {
    OutOfBandTokenResolver { tokens }
  }
}

impl SecurityTokenResolver for OutOfBandTokenResolver {
  fn resolve_token(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken> {
    self
      .tokens
      .iter()
      .find(|t| t.matches_key_identifier_clause(clause))
      .cloned()
  }
}

/// Accepts X.509 tokens inside their validity window, optionally only from a
/// set of trusted thumbprints. Chain validation is not done here.
pub struct X509TokenAuthenticator {
  trusted_thumbprints: Option<Vec<Vec<u8>>>,
  max_clock_skew: Duration,
}

impl X509TokenAuthenticator {
  pub fn new(max_clock_skew: Duration) -> Self {
    X509TokenAuthenticator {
      trusted_thumbprints: None,
      max_clock_skew,
    }
  }

  pub fn with_trusted_thumbprints(mut self, thumbprints: Vec<Vec<u8>>) -> Self {
    self.trusted_thumbprints = Some(thumbprints);
    self
  }
}

impl SecurityTokenAuthenticator for X509TokenAuthenticator {
  fn can_validate_token(&self, token: &SecurityToken) -> bool {
    matches!(token, SecurityToken::X509(_))
  }

  fn validate_token(&self, token: &SecurityToken) -> SecurityResult<Vec<AuthorizationPolicy>> {
    let SecurityToken::X509(cert) = token else {
      return Err(security_error!(SecurityToken, "Not an X.509 token"));
    };
    if !token.is_valid_at(Utc::now(), to_chrono_duration(self.max_clock_skew)) {
      return Err(security_error!(
        SecurityToken,
        "The X.509 token is not within its validity period"
      ));
    }
    if let Some(trusted) = &self.trusted_thumbprints {
      if !trusted.iter().any(|t| t.as_slice() == cert.thumbprint()) {
        return Err(security_error!(SecurityToken, "The X.509 token is not trusted"));
      }
    }
    Ok(vec![AuthorizationPolicy::identity(
      THUMBPRINT_CLAIM_TYPE,
      encode_base64(cert.thumbprint()),
      "X509",
      Some(token.valid_to()),
    )])
  }
}

pub type UserNamePasswordValidator = dyn Fn(&str, &str) -> bool + Send + Sync;

pub struct UserNameTokenAuthenticator {
  validator: Box<UserNamePasswordValidator>,
}

impl UserNameTokenAuthenticator {
  pub fn new(validator: Box<UserNamePasswordValidator>) -> Self {
    UserNameTokenAuthenticator { validator }
  }
}

impl SecurityTokenAuthenticator for UserNameTokenAuthenticator {
  fn can_validate_token(&self, token: &SecurityToken) -> bool {
    matches!(token, SecurityToken::UserName(_))
  }

  fn validate_token(&self, token: &SecurityToken) -> SecurityResult<Vec<AuthorizationPolicy>> {
    match token {
      SecurityToken::UserName(t) if (self.validator)(t.user_name(), t.password()) => {
        Ok(vec![AuthorizationPolicy::identity(
          NAME_CLAIM_TYPE,
          t.user_name(),
          "UserName",
          None,
        )])
      }
      SecurityToken::UserName(_) => Err(security_error!(
        SecurityToken,
        "The user name or password is incorrect"
      )),
      _ => Err(security_error!(SecurityToken, "Not a user name token")),
    }
  }
}

/// Accepts security context tokens that are present in the session token
/// cache, and resolves context references against it.
pub struct SecurityContextTokenAuthenticator {
  cache: Arc<SecurityContextTokenCache>,
}

impl SecurityContextTokenAuthenticator {
  pub fn new(cache: Arc<SecurityContextTokenCache>) -> Self {
    SecurityContextTokenAuthenticator { cache }
  }

  pub fn cache(&self) -> &Arc<SecurityContextTokenCache> {
    &self.cache
  }
}

impl SecurityTokenAuthenticator for SecurityContextTokenAuthenticator {
  fn can_validate_token(&self, token: &SecurityToken) -> bool {
    matches!(token, SecurityToken::SecurityContext(_))
  }

  fn validate_token(&self, token: &SecurityToken) -> SecurityResult<Vec<AuthorizationPolicy>> {
    let SecurityToken::SecurityContext(sct) = token else {
      return Err(security_error!(SecurityToken, "Not a security context token"));
    };
    let cached = self
      .cache
      .get_context(sct.context_id(), sct.key_generation())?
      .ok_or_else(|| {
        security_error!(
          SecurityToken,
          "Security context token {} is not known or has expired",
          sct.context_id()
        )
      })?;
    if !cached.is_key_currently_valid(Utc::now()) {
      return Err(security_error!(
        SecurityToken,
        "The key of security context {} is not currently valid",
        sct.context_id()
      ));
    }
    Ok(cached.authorization_policies().to_vec())
  }
}

impl SecurityTokenResolver for SecurityContextTokenAuthenticator {
  fn resolve_token(&self, clause: &KeyIdentifierClause) -> Option<SecurityToken> {
    match clause.identifier() {
      crate::security::tokens::key_identifier::KeyIdentifier::SecurityContext {
        context_id,
        generation,
      } => self
        .cache
        .get_context(context_id, generation.as_ref())
        .ok()
        .flatten()
        .map(SecurityToken::SecurityContext),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::security::tokens::security_token::{tests::x509_token, UserNameSecurityToken};

  #[test]
  fn fixed_provider_async_resolves_immediately() {
    let provider = FixedTokenProvider::new(x509_token("_c").into());
    let token = futures::executor::block_on(provider.get_token_async(Duration::from_secs(1))).unwrap();
    assert_eq!(token.id(), "_c");
    assert!(provider
      .renew_token(Duration::from_secs(1), &token)
      .is_err());
  }

  #[test]
  fn x509_trust_list() {
    let cert = x509_token("_c");
    let token: SecurityToken = cert.public_only().into();
    let open = X509TokenAuthenticator::new(Duration::from_secs(300));
    assert!(open.can_validate_token(&token));
    assert_eq!(open.validate_token(&token).unwrap().len(), 1);

    let closed = X509TokenAuthenticator::new(Duration::from_secs(300))
      .with_trusted_thumbprints(vec![vec![0; 20]]);
    assert!(closed.validate_token(&token).is_err());
  }

  #[test]
  fn user_name_validation() {
    let authenticator =
      UserNameTokenAuthenticator::new(Box::new(|user, password| user == "alice" && password == "pw"));
    let good: SecurityToken = UserNameSecurityToken::new("_u", "alice", "pw").into();
    let bad: SecurityToken = UserNameSecurityToken::new("_u", "alice", "nope").into();
    let policies = authenticator.validate_token(&good).unwrap();
    assert_eq!(
      crate::security::tokens::authorization_policy::primary_identity(&policies),
      Some("alice")
    );
    assert!(authenticator.validate_token(&bad).is_err());
  }

  #[test]
  fn out_of_band_resolution() {
    let cert: SecurityToken = x509_token("_c").into();
    let resolver = OutOfBandTokenResolver::new(vec![cert.clone()]);
    let clause = cert
      .create_key_identifier_clause(
        crate::security::tokens::token_parameters::SecurityTokenReferenceStyle::External,
      )
      .unwrap();
    assert!(resolver.resolve_token(&clause).is_some());
    assert!(resolver
      .resolve_token(&KeyIdentifierClause::local_id("_other"))
      .is_none());
  }
}
