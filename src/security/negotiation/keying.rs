//! Issued-key computation for direct issuance and renewal, according to the
//! entropy mode.

use crate::{
  security::{
    algorithm_suite::SecurityAlgorithmSuite,
    cryptographic::symmetric_key::{random_nonce, SymmetricKey},
    standards::SecurityStandardsManager,
    trust::{
      compute_combined_key, RequestSecurityTokenResponse, RequestedProofToken,
      SecurityKeyEntropyMode,
    },
    SecurityResult,
  },
  security_error,
};

/// Issuer side result: the key plus what the response has to carry so the
/// requestor can compute it too.
pub struct IssuedKey {
  pub key: SymmetricKey,
  pub proof_token: Option<RequestedProofToken>,
  pub issuer_entropy: Option<Vec<u8>>,
}

/// Requested key size in bits, checked against the suite.
pub fn validate_key_size(
  requested: Option<u32>,
  suite: SecurityAlgorithmSuite,
) -> SecurityResult<u32> {
  match requested {
    None => Ok(suite.default_symmetric_key_length() as u32),
    Some(bits) if suite.is_symmetric_key_length_supported(bits as usize) => Ok(bits),
    Some(bits) => Err(security_error!(
      Negotiation,
      "Requested key size {bits} is not supported by the algorithm suite {suite:?}"
    )),
  }
}

pub fn issue_key(
  mode: SecurityKeyEntropyMode,
  requestor_entropy: Option<&[u8]>,
  key_size: u32,
  standards: &SecurityStandardsManager,
) -> SecurityResult<IssuedKey> {
  let key_bytes = (key_size / 8) as usize;
  match mode {
    SecurityKeyEntropyMode::ClientEntropy => {
      let entropy = requestor_entropy.ok_or_else(|| {
        security_error!(Negotiation, "Requestor entropy is required by the issuer")
      })?;
      if entropy.len() != key_bytes {
        return Err(security_error!(
          Negotiation,
          "Requestor entropy is {} bytes, expected {key_bytes}",
          entropy.len()
        ));
      }
      Ok(IssuedKey {
        key: SymmetricKey::from_bytes(entropy),
        proof_token: None,
        issuer_entropy: None,
      })
    }
    SecurityKeyEntropyMode::ServerEntropy => {
      if requestor_entropy.is_some() {
        return Err(security_error!(
          Negotiation,
          "Requestor entropy is not accepted by the issuer"
        ));
      }
      let key = SymmetricKey::generate_random(key_bytes);
      let proof = RequestedProofToken::BinarySecret(key.as_bytes().to_vec());
      Ok(IssuedKey {
        key,
        proof_token: Some(proof),
        issuer_entropy: None,
      })
    }
    SecurityKeyEntropyMode::CombinedEntropy => {
      let entropy = requestor_entropy.ok_or_else(|| {
        security_error!(Negotiation, "Requestor entropy is required by the issuer")
      })?;
      let issuer_entropy = random_nonce(key_bytes);
      let key = compute_combined_key(entropy, &issuer_entropy, key_size)?;
      Ok(IssuedKey {
        key,
        proof_token: Some(RequestedProofToken::ComputedKey(
          standards.trust_version().psha1_computed_key(),
        )),
        issuer_entropy: Some(issuer_entropy),
      })
    }
  }
}

/// Requestor side: the key described by `response`.
pub fn recover_key(
  mode: SecurityKeyEntropyMode,
  requestor_entropy: Option<&[u8]>,
  key_size: u32,
  response: &RequestSecurityTokenResponse,
  standards: &SecurityStandardsManager,
) -> SecurityResult<SymmetricKey> {
  let key_size = response.key_size().unwrap_or(key_size);
  match (mode, response.requested_proof_token()) {
    (SecurityKeyEntropyMode::ClientEntropy, None) => requestor_entropy
      .map(SymmetricKey::from_bytes)
      .ok_or_else(|| security_error!(Negotiation, "No requestor entropy was sent")),
    (SecurityKeyEntropyMode::ServerEntropy, Some(RequestedProofToken::BinarySecret(secret))) => {
      Ok(SymmetricKey::from_bytes(secret))
    }
    (SecurityKeyEntropyMode::CombinedEntropy, Some(RequestedProofToken::ComputedKey(uri))) => {
      if *uri != standards.trust_version().psha1_computed_key() {
        return Err(security_error!(
          Negotiation,
          "Unsupported computed key algorithm {uri}"
        ));
      }
      let requestor_entropy = requestor_entropy
        .ok_or_else(|| security_error!(Negotiation, "No requestor entropy was sent"))?;
      let issuer_entropy = response
        .issuer_entropy()
        .ok_or_else(|| security_error!(Negotiation, "The response carries no issuer entropy"))?;
      compute_combined_key(requestor_entropy, issuer_entropy, key_size)
    }
    (mode, _) => Err(security_error!(
      Negotiation,
      "The proof token does not fit the {mode:?} key entropy mode"
    )),
  }
}
