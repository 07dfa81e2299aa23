use rsa::{
  pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey},
  Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};

use crate::{security::SecurityResult, security_error};
use super::digest::sha1;

// Asymmetric operations of X.509-style tokens: RSA-OAEP (SHA-256) key
// transport and RSASSA-PKCS1-v1_5 with SHA-256 signatures.

pub fn generate_private_key(bits: usize) -> SecurityResult<RsaPrivateKey> {
  Ok(RsaPrivateKey::new(&mut rand::thread_rng(), bits)?)
}

pub fn wrap_key(public_key: &RsaPublicKey, key: &[u8]) -> SecurityResult<Vec<u8>> {
  Ok(public_key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), key)?)
}

pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped: &[u8]) -> SecurityResult<Vec<u8>> {
  private_key
    .decrypt(Oaep::new::<Sha256>(), wrapped)
    .map_err(|_| security_error!(MessageSecurity, "Unable to unwrap the encrypted key"))
}

pub fn sign(private_key: &RsaPrivateKey, data: &[u8]) -> SecurityResult<Vec<u8>> {
  let hashed = Sha256::digest(data);
  Ok(private_key.sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)?)
}

pub fn verify(public_key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> SecurityResult<()> {
  let hashed = Sha256::digest(data);
  public_key
    .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
    .map_err(|_| security_error!(MessageSecurity, "RSA signature verification failed"))
}

/// PKCS#1 DER encoding of the public key. This is the raw token data of an
/// X.509-style token on the wire.
pub fn public_key_der(public_key: &RsaPublicKey) -> SecurityResult<Vec<u8>> {
  public_key
    .to_pkcs1_der()
    .map(|doc| doc.as_bytes().to_vec())
    .map_err(|e| security_error!(Format, "Cannot encode public key: {e}"))
}

pub fn public_key_from_der(der: &[u8]) -> SecurityResult<RsaPublicKey> {
  RsaPublicKey::from_pkcs1_der(der)
    .map_err(|e| security_error!(SecurityToken, "Cannot decode public key: {e}"))
}

/// SHA-1 over the DER encoding, the customary key thumbprint.
pub fn thumbprint(public_key: &RsaPublicKey) -> SecurityResult<Vec<u8>> {
  Ok(sha1(&public_key_der(public_key)?))
}

#[cfg(test)]
mod tests {
  use std::sync::OnceLock;

  use super::*;

  fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| generate_private_key(1024).unwrap())
  }

  #[test]
  fn wrap_unwrap_key() {
    let private_key = test_key();
    let wrapped = wrap_key(&private_key.to_public_key(), &[5u8; 32]).unwrap();
    assert_eq!(unwrap_key(private_key, &wrapped).unwrap(), vec![5u8; 32]);
  }

  #[test]
  fn signature_detects_modification() {
    let private_key = test_key();
    let signature = sign(private_key, b"signed info").unwrap();
    let public_key = private_key.to_public_key();
    assert!(verify(&public_key, b"signed info", &signature).is_ok());
    assert!(verify(&public_key, b"signed inf0", &signature).is_err());
  }

  #[test]
  fn der_encoding_is_reversible() {
    let public_key = test_key().to_public_key();
    let der = public_key_der(&public_key).unwrap();
    assert_eq!(public_key_from_der(&der).unwrap(), public_key);
    assert_eq!(thumbprint(&public_key).unwrap().len(), 20);
  }
}
