use chrono::{DateTime, Utc};

use crate::security::{
  cryptographic::{
    digest::{constant_time_equals, RunningDigest},
    psha1::derive_key,
  },
  standards::AUTHENTICATOR_LABEL,
  time::utc_now,
  tokens::SecurityContextSecurityToken,
};

/// Length of the negotiation authenticator in bytes.
pub const AUTHENTICATOR_LENGTH: usize = 32;

/// Bookkeeping of one negotiation in progress: the context that ties the
/// legs together, the running digest over every leg exchanged in either
/// direction, the requested key size and, once done, the issued token.
#[derive(Debug, Clone)]
pub struct NegotiationState {
  context: String,
  digest: RunningDigest,
  key_size: u32,
  applies_to: Option<String>,
  issued_token: Option<SecurityContextSecurityToken>,
  legs: usize,
  started: DateTime<Utc>,
}

impl NegotiationState {
  pub fn new(context: impl Into<String>, key_size: u32) -> Self {
    NegotiationState {
      context: context.into(),
      digest: RunningDigest::new(),
      key_size,
      applies_to: None,
      issued_token: None,
      legs: 0,
      started: utc_now(),
    }
  }

  pub fn context(&self) -> &str {
    &self.context
  }

  pub fn key_size(&self) -> u32 {
    self.key_size
  }

  pub fn set_key_size(&mut self, key_size: u32) {
    self.key_size = key_size;
  }

  pub fn applies_to(&self) -> Option<&str> {
    self.applies_to.as_deref()
  }

  pub fn set_applies_to(&mut self, applies_to: Option<String>) {
    self.applies_to = applies_to;
  }

  /// Number of messages added to the transcript.
  pub fn leg_count(&self) -> usize {
    self.legs
  }

  pub fn started(&self) -> DateTime<Utc> {
    self.started
  }

  /// Adds the canonical bytes of one negotiation message to the transcript.
  pub fn record_leg(&mut self, canonical_message: &[u8]) {
    self.digest.update(canonical_message);
    self.legs += 1;
  }

  pub fn transcript_digest(&self) -> Vec<u8> {
    self.digest.current()
  }

  /// P_SHA1(proof key, "AUTH-HASH" || transcript digest).
  pub fn compute_authenticator(&self, proof_key: &[u8]) -> Vec<u8> {
    derive_key(
      proof_key,
      AUTHENTICATOR_LABEL.as_bytes(),
      &self.transcript_digest(),
      0,
      AUTHENTICATOR_LENGTH,
    )
  }

  pub fn verify_authenticator(&self, proof_key: &[u8], received: &[u8]) -> bool {
    constant_time_equals(&self.compute_authenticator(proof_key), received)
  }

  pub fn set_issued_token(&mut self, token: SecurityContextSecurityToken) {
    self.issued_token = Some(token);
  }

  pub fn issued_token(&self) -> Option<&SecurityContextSecurityToken> {
    self.issued_token.as_ref()
  }

  pub fn is_complete(&self) -> bool {
    self.issued_token.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn authenticator_binds_the_transcript() {
    let mut a = NegotiationState::new("ctx", 256);
    let mut b = NegotiationState::new("ctx", 256);
    for leg in [&b"rst"[..], b"rstr-1", b"rstr-2"] {
      a.record_leg(leg);
      b.record_leg(leg);
    }
    let key = [9u8; 32];
    let auth = a.compute_authenticator(&key);
    assert_eq!(auth.len(), AUTHENTICATOR_LENGTH);
    assert!(b.verify_authenticator(&key, &auth));

    b.record_leg(b"extra");
    assert!(!b.verify_authenticator(&key, &auth));
    assert!(!a.verify_authenticator(&[1u8; 32], &auth));
    assert_eq!(a.leg_count(), 3);
  }
}
