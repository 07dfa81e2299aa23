use serde::{Deserialize, Serialize};

use crate::{
  security::{cryptographic::digest, SecurityResult},
  security_error,
};

// Algorithm identifiers (XML-DSig / XML-Enc URIs)
pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const SHA1_DIGEST: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const SHA256_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const HMAC_SHA1_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#hmac-sha1";
pub const HMAC_SHA256_SIGNATURE: &str = "http://www.w3.org/2001/04/xmldsig-more#hmac-sha256";
pub const RSA_SHA256_SIGNATURE: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const AES128_GCM_ENCRYPTION: &str = "http://www.w3.org/2009/xmlenc11#aes128-gcm";
pub const AES256_GCM_ENCRYPTION: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";
pub const RSA_OAEP_KEY_WRAP: &str = "http://www.w3.org/2009/xmlenc11#rsa-oaep";
// Symmetric key wrap. The wrapped key is carried as AES-GCM output of the
// wrapping key.
pub const AES128_KEY_WRAP: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes128";
pub const AES256_KEY_WRAP: &str = "http://www.w3.org/2001/04/xmlenc#kw-aes256";
pub const PSHA1_KEY_DERIVATION: &str = "http://schemas.xmlsoap.org/ws/2005/02/sc/dk/p_sha1";

/// Named algorithm suites: key lengths plus the algorithms used for digests,
/// signatures, encryption and key wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecurityAlgorithmSuite {
  #[default]
  Basic256,
  Basic128,
  Basic256Sha256,
  Basic128Sha256,
}

impl SecurityAlgorithmSuite {
  fn is_256(self) -> bool {
    matches!(
      self,
      SecurityAlgorithmSuite::Basic256 | SecurityAlgorithmSuite::Basic256Sha256
    )
  }

  fn uses_sha256(self) -> bool {
    matches!(
      self,
      SecurityAlgorithmSuite::Basic256Sha256 | SecurityAlgorithmSuite::Basic128Sha256
    )
  }

  /// Bits
  pub fn default_symmetric_key_length(self) -> usize {
    if self.is_256() {
      256
    } else {
      128
    }
  }

  /// Bits
  pub fn default_encryption_key_derivation_length(self) -> usize {
    self.default_symmetric_key_length()
  }

  /// Bits
  pub fn default_signature_key_derivation_length(self) -> usize {
    if self.is_256() {
      192
    } else {
      128
    }
  }

  pub fn is_symmetric_key_length_supported(self, bits: usize) -> bool {
    bits == self.default_symmetric_key_length()
  }

  /// Longest derived key a peer may request, in bytes.
  pub fn max_derived_key_length(self) -> usize {
    self
      .default_encryption_key_derivation_length()
      .max(self.default_signature_key_derivation_length())
      / 8
  }

  pub fn default_canonicalization_algorithm(self) -> &'static str {
    EXCLUSIVE_C14N
  }

  pub fn default_digest_algorithm(self) -> &'static str {
    if self.uses_sha256() {
      SHA256_DIGEST
    } else {
      SHA1_DIGEST
    }
  }

  pub fn default_symmetric_signature_algorithm(self) -> &'static str {
    if self.uses_sha256() {
      HMAC_SHA256_SIGNATURE
    } else {
      HMAC_SHA1_SIGNATURE
    }
  }

  pub fn default_asymmetric_signature_algorithm(self) -> &'static str {
    RSA_SHA256_SIGNATURE
  }

  pub fn default_encryption_algorithm(self) -> &'static str {
    if self.is_256() {
      AES256_GCM_ENCRYPTION
    } else {
      AES128_GCM_ENCRYPTION
    }
  }

  pub fn default_symmetric_key_wrap_algorithm(self) -> &'static str {
    if self.is_256() {
      AES256_KEY_WRAP
    } else {
      AES128_KEY_WRAP
    }
  }

  pub fn default_asymmetric_key_wrap_algorithm(self) -> &'static str {
    RSA_OAEP_KEY_WRAP
  }

  pub fn is_digest_algorithm_supported(self, uri: &str) -> bool {
    uri == self.default_digest_algorithm()
  }

  pub fn is_signature_algorithm_supported(self, uri: &str) -> bool {
    uri == self.default_symmetric_signature_algorithm()
      || uri == self.default_asymmetric_signature_algorithm()
  }

  pub fn is_encryption_algorithm_supported(self, uri: &str) -> bool {
    uri == self.default_encryption_algorithm()
  }

  pub fn is_key_wrap_algorithm_supported(self, uri: &str) -> bool {
    uri == self.default_symmetric_key_wrap_algorithm()
      || uri == self.default_asymmetric_key_wrap_algorithm()
  }

  pub fn ensure_acceptable_digest_algorithm(self, uri: &str) -> SecurityResult<()> {
    if self.is_digest_algorithm_supported(uri) {
      Ok(())
    } else {
      Err(security_error!(
        MessageSecurity,
        "Digest algorithm {uri} is not allowed by the algorithm suite {self:?}"
      ))
    }
  }

  pub fn ensure_acceptable_signature_algorithm(self, uri: &str) -> SecurityResult<()> {
    if self.is_signature_algorithm_supported(uri) {
      Ok(())
    } else {
      Err(security_error!(
        MessageSecurity,
        "Signature algorithm {uri} is not allowed by the algorithm suite {self:?}"
      ))
    }
  }

  pub fn ensure_acceptable_encryption_algorithm(self, uri: &str) -> SecurityResult<()> {
    if self.is_encryption_algorithm_supported(uri) {
      Ok(())
    } else {
      Err(security_error!(
        MessageSecurity,
        "Encryption algorithm {uri} is not allowed by the algorithm suite {self:?}"
      ))
    }
  }

  pub fn ensure_acceptable_key_wrap_algorithm(self, uri: &str) -> SecurityResult<()> {
    if self.is_key_wrap_algorithm_supported(uri) {
      Ok(())
    } else {
      Err(security_error!(
        MessageSecurity,
        "Key wrap algorithm {uri} is not allowed by the algorithm suite {self:?}"
      ))
    }
  }

  /// Digest of `data` with the suite digest algorithm.
  pub fn digest(self, data: &[u8]) -> Vec<u8> {
    compute_digest(self.default_digest_algorithm(), data).unwrap_or_default()
  }
}

pub fn compute_digest(uri: &str, data: &[u8]) -> SecurityResult<Vec<u8>> {
  match uri {
    SHA1_DIGEST => Ok(digest::sha1(data)),
    SHA256_DIGEST => Ok(digest::sha256(data)),
    other => Err(security_error!(
      MessageSecurity,
      "Unsupported digest algorithm {other}"
    )),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn basic256_lengths() {
    let suite = SecurityAlgorithmSuite::Basic256;
    assert_eq!(suite.default_symmetric_key_length(), 256);
    assert_eq!(suite.default_signature_key_derivation_length(), 192);
    assert_eq!(suite.max_derived_key_length(), 32);
    assert!(suite.is_symmetric_key_length_supported(256));
    assert!(!suite.is_symmetric_key_length_supported(128));
  }

  #[test]
  fn sha256_suites_pick_sha256() {
    let suite = SecurityAlgorithmSuite::Basic128Sha256;
    assert_eq!(suite.default_digest_algorithm(), SHA256_DIGEST);
    assert_eq!(suite.default_symmetric_signature_algorithm(), HMAC_SHA256_SIGNATURE);
    assert_eq!(suite.digest(b"x").len(), 32);
    assert!(suite.ensure_acceptable_digest_algorithm(SHA1_DIGEST).is_err());
  }
}
