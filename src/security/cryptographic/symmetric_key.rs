use std::fmt;

use rand::RngCore;
use zeroize::Zeroize;

use crate::{security::SecurityResult, security_error};

pub const AES128_KEY_LENGTH: usize = 16;
pub const AES256_KEY_LENGTH: usize = 32;

/// Symmetric key material. The bytes are wiped when the key is disposed or
/// dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
  bytes: Vec<u8>,
}

impl SymmetricKey {
  // Rust `rand` library uses by default the 12-round chacha-algorithm, which is
  // "widely believed" to be secure.
  pub fn generate_random(length_bytes: usize) -> Self {
    let mut bytes = vec![0u8; length_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    SymmetricKey { bytes }
  }

  pub fn from_bytes(bytes: &[u8]) -> Self {
    SymmetricKey {
      bytes: bytes.to_vec(),
    }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn len_bits(&self) -> usize {
    self.bytes.len() * 8
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn dispose(&mut self) {
    self.bytes.zeroize();
  }

  pub fn ensure_not_disposed(&self) -> SecurityResult<()> {
    if self.bytes.is_empty() {
      Err(security_error!(
        InvalidOperation,
        "Attempted to use disposed or empty key material"
      ))
    } else {
      Ok(())
    }
  }
}

impl Drop for SymmetricKey {
  fn drop(&mut self) {
    self.bytes.zeroize();
  }
}

// Never print key material.
impl fmt::Debug for SymmetricKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "SymmetricKey({} bits)", self.len_bits())
  }
}

/// Fresh random nonce bytes, e.g. for key derivation or entropy.
pub fn random_nonce(length_bytes: usize) -> Vec<u8> {
  let mut nonce = vec![0u8; length_bytes];
  rand::thread_rng().fill_bytes(&mut nonce);
  nonce
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn random_keys_have_requested_length_and_differ() {
    let a = SymmetricKey::generate_random(AES256_KEY_LENGTH);
    let b = SymmetricKey::generate_random(AES256_KEY_LENGTH);
    assert_eq!(a.len_bits(), 256);
    assert_ne!(a, b);
  }

  #[test]
  fn dispose_wipes_material() {
    let mut key = SymmetricKey::from_bytes(&[7u8; 16]);
    key.dispose();
    assert!(key.is_empty());
    assert!(key.ensure_not_disposed().is_err());
  }

  #[test]
  fn debug_does_not_leak_key() {
    let key = SymmetricKey::from_bytes(&[0xAB; 16]);
    let text = format!("{key:?}");
    assert_eq!(text, "SymmetricKey(128 bits)");
  }
}
