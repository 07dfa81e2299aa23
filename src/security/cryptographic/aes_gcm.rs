use ring::{aead::*, error::Unspecified};

use crate::{
  create_security_error_and_log,
  security::SecurityResult,
  security_error,
};
use super::symmetric_key::{random_nonce, SymmetricKey, AES128_KEY_LENGTH, AES256_KEY_LENGTH};

pub const IV_LENGTH: usize = NONCE_LEN;

// Every encryption gets a fresh random IV and we only encrypt once with that
// IV, so we can construct a trivial sequence of just one element.
struct TrivialNonceSequence {
  iv: [u8; IV_LENGTH],
  used: bool,
}

impl TrivialNonceSequence {
  fn new(iv: [u8; IV_LENGTH]) -> Self {
    TrivialNonceSequence { iv, used: false }
  }
}

impl NonceSequence for TrivialNonceSequence {
  fn advance(&mut self) -> Result<Nonce, Unspecified> {
    if self.used {
      Err(Unspecified) // you had one nonce
    } else {
      self.used = true;
      Ok(Nonce::assume_unique_for_key(self.iv))
    }
  }
}

#[allow(non_snake_case)]
fn to_unbound_AES_GCM_key(key: &SymmetricKey) -> SecurityResult<UnboundKey> {
  key.ensure_not_disposed()?;
  let algorithm = match key.len() {
    AES128_KEY_LENGTH => &AES_128_GCM,
    AES256_KEY_LENGTH => &AES_256_GCM,
    other => {
      return Err(create_security_error_and_log!(
        MessageSecurity,
        "No AES-GCM cipher for a {} bit key",
        other * 8
      ))
    }
  };
  Ok(UnboundKey::new(algorithm, key.as_bytes())?)
}

/// Authenticated encryption. Output layout is `IV || ciphertext || tag`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> SecurityResult<Vec<u8>> {
  let iv: [u8; IV_LENGTH] = random_nonce(IV_LENGTH)
    .try_into()
    .map_err(|_| security_error!(Internal, "IV generation failed"))?;

  // ring encrypts + tags in place, so we must create a buffer for that.
  let mut in_out = Vec::from(plaintext);
  let mut sealing_key = SealingKey::new(to_unbound_AES_GCM_key(key)?, TrivialNonceSequence::new(iv));
  sealing_key.seal_in_place_append_tag(Aad::empty(), &mut in_out)?;

  let mut output = Vec::with_capacity(IV_LENGTH + in_out.len());
  output.extend_from_slice(&iv);
  output.extend_from_slice(&in_out);
  Ok(output)
}

/// Inverse of [`encrypt`]. Fails if the data was modified.
pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> SecurityResult<Vec<u8>> {
  if data.len() < IV_LENGTH + AES_128_GCM.tag_len() {
    return Err(security_error!(
      MessageSecurity,
      "Cipher value is too short to be AES-GCM output"
    ));
  }
  let (iv, ciphertext) = data.split_at(IV_LENGTH);
  let iv: [u8; IV_LENGTH] = iv
    .try_into()
    .map_err(|_| security_error!(Format, "Bad IV"))?;

  let mut in_out = Vec::from(ciphertext);
  let mut opening_key = OpeningKey::new(to_unbound_AES_GCM_key(key)?, TrivialNonceSequence::new(iv));
  let plaintext = opening_key
    .open_in_place(Aad::empty(), &mut in_out)
    .map_err(|_| security_error!(MessageSecurity, "Decryption failed: data was modified or the key is wrong"))?;
  Ok(plaintext.to_vec())
}
