use ring::{digest, hmac};

use crate::{security::SecurityResult, security_error};

pub fn sha1(data: &[u8]) -> Vec<u8> {
  digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data)
    .as_ref()
    .to_vec()
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
  digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
  HmacSha1,
  HmacSha256,
}

impl HmacAlgorithm {
  fn ring_algorithm(self) -> hmac::Algorithm {
    match self {
      HmacAlgorithm::HmacSha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
      HmacAlgorithm::HmacSha256 => hmac::HMAC_SHA256,
    }
  }
}

pub fn hmac_sign(algorithm: HmacAlgorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
  let key = hmac::Key::new(algorithm.ring_algorithm(), key);
  hmac::sign(&key, data).as_ref().to_vec()
}

pub fn hmac_verify(
  algorithm: HmacAlgorithm,
  key: &[u8],
  data: &[u8],
  signature: &[u8],
) -> SecurityResult<()> {
  let key = hmac::Key::new(algorithm.ring_algorithm(), key);
  hmac::verify(&key, data, signature)
    .map_err(|_| security_error!(MessageSecurity, "HMAC signature verification failed"))
}

/// Running SHA-1 hash over a sequence of messages.
#[derive(Clone)]
pub struct RunningDigest {
  context: digest::Context,
}

impl RunningDigest {
  pub fn new() -> Self {
    RunningDigest {
      context: digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY),
    }
  }

  pub fn update(&mut self, data: &[u8]) {
    self.context.update(data);
  }

  /// Digest of everything so far. The running state is left untouched.
  pub fn current(&self) -> Vec<u8> {
    self.context.clone().finish().as_ref().to_vec()
  }
}

impl Default for RunningDigest {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for RunningDigest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("RunningDigest(SHA-1)")
  }
}

/// Constant-time comparison.
pub fn constant_time_equals(a: &[u8], b: &[u8]) -> bool {
  #[allow(deprecated)]
  ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn running_digest_matches_one_shot() {
    let mut running = RunningDigest::new();
    running.update(b"first leg");
    let partial = running.current();
    running.update(b"second leg");
    assert_eq!(partial, sha1(b"first leg"));
    assert_eq!(running.current(), sha1(b"first legsecond leg"));
  }

  #[test]
  fn hmac_round() {
    let tag = hmac_sign(HmacAlgorithm::HmacSha256, b"key", b"data");
    assert!(hmac_verify(HmacAlgorithm::HmacSha256, b"key", b"data", &tag).is_ok());
    assert!(hmac_verify(HmacAlgorithm::HmacSha1, b"key", b"data", &tag).is_err());
  }

  #[test]
  fn comparison() {
    assert!(constant_time_equals(b"abc", b"abc"));
    assert!(!constant_time_equals(b"abc", b"abd"));
    assert!(!constant_time_equals(b"abc", b"ab"));
  }
}
