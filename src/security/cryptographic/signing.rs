use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::{
  security::{
    algorithm_suite::{HMAC_SHA1_SIGNATURE, HMAC_SHA256_SIGNATURE, RSA_SHA256_SIGNATURE},
    SecurityResult,
  },
  security_error,
};
use super::{
  digest::{hmac_sign, hmac_verify, HmacAlgorithm},
  rsa_key,
  symmetric_key::SymmetricKey,
};

/// Key used to produce a signature.
#[derive(Clone, Copy)]
pub enum SigningKey<'a> {
  Symmetric(&'a SymmetricKey),
  Asymmetric(&'a RsaPrivateKey),
}

/// Key used to check a signature.
#[derive(Clone, Copy)]
pub enum VerificationKey<'a> {
  Symmetric(&'a SymmetricKey),
  Asymmetric(&'a RsaPublicKey),
}

fn hmac_algorithm(uri: &str) -> Option<HmacAlgorithm> {
  match uri {
    HMAC_SHA1_SIGNATURE => Some(HmacAlgorithm::HmacSha1),
    HMAC_SHA256_SIGNATURE => Some(HmacAlgorithm::HmacSha256),
    _ => None,
  }
}

pub fn sign(algorithm: &str, key: SigningKey, data: &[u8]) -> SecurityResult<Vec<u8>> {
  match (key, hmac_algorithm(algorithm)) {
    (SigningKey::Symmetric(key), Some(hmac)) => {
      key.ensure_not_disposed()?;
      Ok(hmac_sign(hmac, key.as_bytes(), data))
    }
    (SigningKey::Asymmetric(key), None) if algorithm == RSA_SHA256_SIGNATURE => {
      rsa_key::sign(key, data)
    }
    _ => Err(security_error!(
      MessageSecurity,
      "Signature algorithm {algorithm} cannot be used with this key"
    )),
  }
}

pub fn verify(
  algorithm: &str,
  key: VerificationKey,
  data: &[u8],
  signature: &[u8],
) -> SecurityResult<()> {
  match (key, hmac_algorithm(algorithm)) {
    (VerificationKey::Symmetric(key), Some(hmac)) => {
      key.ensure_not_disposed()?;
      hmac_verify(hmac, key.as_bytes(), data, signature)
    }
    (VerificationKey::Asymmetric(key), None) if algorithm == RSA_SHA256_SIGNATURE => {
      rsa_key::verify(key, data, signature)
    }
    _ => Err(security_error!(
      MessageSecurity,
      "Signature algorithm {algorithm} cannot be used with this key"
    )),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hmac_signature_requires_symmetric_key() {
    let key = SymmetricKey::generate_random(24);
    let signature = sign(HMAC_SHA1_SIGNATURE, SigningKey::Symmetric(&key), b"data").unwrap();
    assert!(verify(
      HMAC_SHA1_SIGNATURE,
      VerificationKey::Symmetric(&key),
      b"data",
      &signature
    )
    .is_ok());
    assert!(sign(RSA_SHA256_SIGNATURE, SigningKey::Symmetric(&key), b"data").is_err());
  }
}
