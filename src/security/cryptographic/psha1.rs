use ring::hmac;

// P_SHA-1 from RFC 2246 (TLS 1.0) Section 5:
//
//   P_hash(secret, seed) = HMAC_hash(secret, A(1) + seed) +
//                          HMAC_hash(secret, A(2) + seed) + ...
//   A(0) = seed
//   A(i) = HMAC_hash(secret, A(i-1))
//
// WS-Trust uses it for computed keys, WS-SecureConversation for derived keys
// and the negotiation authenticator.

/// Produces `length` bytes of P_SHA1 output, skipping the first `offset`.
pub fn psha1(secret: &[u8], seed: &[u8], offset: usize, length: usize) -> Vec<u8> {
  let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret);
  let needed = offset + length;
  let mut output = Vec::with_capacity(needed + 20);
  let mut a = hmac::sign(&key, seed).as_ref().to_vec(); // A(1)

  while output.len() < needed {
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(&a);
    ctx.update(seed);
    output.extend_from_slice(ctx.sign().as_ref());
    a = hmac::sign(&key, &a).as_ref().to_vec();
  }
  output[offset..needed].to_vec()
}

/// Key derivation as in WS-SecureConversation: the seed is `label || nonce`.
pub fn derive_key(secret: &[u8], label: &[u8], nonce: &[u8], offset: usize, length: usize) -> Vec<u8> {
  let mut seed = Vec::with_capacity(label.len() + nonce.len());
  seed.extend_from_slice(label);
  seed.extend_from_slice(nonce);
  psha1(secret, &seed, offset, length)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn output_is_deterministic_and_sized() {
    let a = psha1(b"secret", b"seed", 0, 45);
    let b = psha1(b"secret", b"seed", 0, 45);
    assert_eq!(a.len(), 45);
    assert_eq!(a, b);
  }

  #[test]
  fn offset_selects_later_bytes() {
    let full = psha1(b"secret", b"seed", 0, 64);
    let tail = psha1(b"secret", b"seed", 16, 32);
    assert_eq!(&full[16..48], tail.as_slice());
  }

  #[test]
  fn first_block_matches_definition() {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, b"k");
    let a1 = hmac::sign(&key, b"s");
    let mut block_input = a1.as_ref().to_vec();
    block_input.extend_from_slice(b"s");
    let expected = hmac::sign(&key, &block_input);
    assert_eq!(psha1(b"k", b"s", 0, 20), expected.as_ref());
  }

  #[test]
  fn label_and_nonce_are_concatenated() {
    assert_eq!(
      derive_key(b"k", b"AUTH-", b"HASH", 0, 32),
      psha1(b"k", b"AUTH-HASH", 0, 32)
    );
  }
}
