use crate::security::tokens::SecurityToken;

/// Signature values a reply must confirm, or that a request carried.
/// A `None` entry stands for "the request was not signed".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureConfirmations {
  values: Vec<Option<Vec<u8>>>,
}

impl SignatureConfirmations {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, value: Option<Vec<u8>>) {
    self.values.push(value);
  }

  pub fn values(&self) -> &[Option<Vec<u8>>] {
    &self.values
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Same values regardless of order.
  pub fn matches(&self, other: &SignatureConfirmations) -> bool {
    if self.values.len() != other.values.len() {
      return false;
    }
    let mut remaining: Vec<&Option<Vec<u8>>> = other.values.iter().collect();
    for value in &self.values {
      match remaining.iter().position(|v| *v == value) {
        Some(index) => {
          remaining.swap_remove(index);
        }
        None => return false,
      }
    }
    true
  }
}

/// Carries what securing a request decided over to the verification of its
/// reply (initiator side), or what verifying a request found over to the
/// securing of the reply (recipient side).
#[derive(Debug, Clone, Default)]
pub struct CorrelationState {
  token: Option<SecurityToken>,
  peer_token: Option<SecurityToken>,
  signature_confirmations: Option<SignatureConfirmations>,
}

impl CorrelationState {
  pub fn new(token: Option<SecurityToken>) -> Self {
    CorrelationState {
      token,
      ..Default::default()
    }
  }

  /// Token that protected the request. The reply must be protected with
  /// the same token.
  pub fn token(&self) -> Option<&SecurityToken> {
    self.token.as_ref()
  }

  /// The other side's own token, e.g. the initiator certificate a reply is
  /// encrypted for.
  pub fn peer_token(&self) -> Option<&SecurityToken> {
    self.peer_token.as_ref()
  }

  pub fn with_peer_token(mut self, token: SecurityToken) -> Self {
    self.peer_token = Some(token);
    self
  }

  pub fn signature_confirmations(&self) -> Option<&SignatureConfirmations> {
    self.signature_confirmations.as_ref()
  }

  pub fn with_signature_confirmations(mut self, confirmations: SignatureConfirmations) -> Self {
    self.signature_confirmations = Some(confirmations);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn confirmations_match_as_multisets() {
    let mut a = SignatureConfirmations::new();
    a.add(Some(vec![1]));
    a.add(Some(vec![2]));
    let mut b = SignatureConfirmations::new();
    b.add(Some(vec![2]));
    b.add(Some(vec![1]));
    assert!(a.matches(&b));

    let mut c = SignatureConfirmations::new();
    c.add(Some(vec![1]));
    c.add(Some(vec![1]));
    assert!(!a.matches(&c));
    assert!(!a.matches(&SignatureConfirmations::new()));
  }
}
